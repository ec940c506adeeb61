/*
 * This file is part of ModernFS.
 *
 * ModernFS is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * ModernFS is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * ModernFS. If not, see <https://www.gnu.org/licenses/>.
 */

//! The mount context: §4.H. Boots the stack bottom-up, runs recovery,
//! spawns the background checkpointer, and tears everything down cleanly
//! on drop.
//!
//! Every component the background checkpointer touches (`journal`,
//! `data_alloc`, `dev`) is reached through an `Arc` rather than the raw
//! global pointer the prototype installs for its FFI callback (§9): no
//! hidden global state, and the checkpointer thread simply holds its own
//! clones.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::alloc::ExtentAllocator;
use crate::block::BlockDevice;
use crate::error::FsResult;
use crate::inode::InodeCache;
use crate::journal::{CacheInvalidate, Journal};
use crate::layout::CHECKPOINT_INTERVAL_SECS;
use crate::superblock::Superblock;

/// The journal writes around the buffer cache; this forwards its
/// invalidation calls into the block device's cache (§4.C, §9).
struct DeviceInvalidate {
    dev: Arc<BlockDevice>,
}

impl CacheInvalidate for DeviceInvalidate {
    fn invalidate(&self, block: u32) {
        self.dev.invalidate(block);
    }
}

/// Shared shutdown signal for the background checkpointer.
struct Checkpointer {
    shutdown: AtomicBool,
    wake: Condvar,
    wake_lock: Mutex<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// The composed runtime state for one mounted image. Owns the block
/// device, journal, allocator, inode cache, and the background
/// checkpointer thread.
pub struct MountContext {
    pub dev: Arc<BlockDevice>,
    pub superblock: Mutex<Superblock>,
    pub journal: Option<Arc<Journal>>,
    pub data_alloc: Arc<ExtentAllocator>,
    pub icache: InodeCache,
    pub read_only: bool,
    checkpointer: Option<Arc<Checkpointer>>,
}

impl MountContext {
    /// Boots the stack: device -> superblock -> allocator -> inode cache
    /// -> (if writable) journal init + recover -> background checkpointer.
    /// Any failure tears down everything already initialized before
    /// returning (each step here only allocates in-process state, so
    /// "teardown" is simply letting the partially-built `Result::Err`
    /// unwind and drop what was already constructed).
    pub fn mount(path: impl AsRef<Path>, read_only: bool) -> FsResult<Self> {
        let dev = Arc::new(BlockDevice::open(&path, read_only)?);
        let sb = Superblock::load(&dev)?;

        let data_alloc = Arc::new(ExtentAllocator::load(
            &dev,
            sb.data_bitmap_start,
            sb.data_bitmap_blocks,
            sb.data_blocks,
        )?);

        let inode_bitmap = ExtentAllocator::load(
            &dev,
            sb.inode_bitmap_start,
            sb.inode_bitmap_blocks,
            sb.total_inodes,
        )?;
        let icache = InodeCache::new(
            dev.clone(),
            sb.inode_table_start,
            sb.total_inodes,
            inode_bitmap,
            1024,
        );

        let journal = if read_only {
            None
        } else {
            let jfile = dev.try_clone_file()?;
            let invalidate = Box::new(DeviceInvalidate { dev: dev.clone() });
            let journal = Journal::open(jfile, sb.journal_start, invalidate)?;
            let applied = journal.recover()?;
            if applied > 0 {
                log::info!("journal: recovered {applied} transaction(s) at mount");
            }
            Some(Arc::new(journal))
        };

        let checkpointer = if read_only {
            None
        } else {
            Some(Arc::new(Checkpointer {
                shutdown: AtomicBool::new(false),
                wake: Condvar::new(),
                wake_lock: Mutex::new(()),
                handle: Mutex::new(None),
            }))
        };

        let mut ctx = Self {
            dev,
            superblock: Mutex::new(sb),
            journal,
            data_alloc,
            icache,
            read_only,
            checkpointer,
        };

        if !read_only {
            ctx.spawn_checkpointer();
        }
        Ok(ctx)
    }

    /// Spawns the single background worker that sleeps on a condvar with
    /// a 30-second timeout, running a journal checkpoint and a bitmap sync
    /// on each unsolicited wake (§4.H, §9).
    fn spawn_checkpointer(&mut self) {
        let Some(cp) = self.checkpointer.clone() else {
            return;
        };
        let dev = self.dev.clone();
        let data_alloc = self.data_alloc.clone();
        let journal = self.journal.clone();
        let (bitmap_start, bitmap_blocks) = {
            let sb = self.superblock.lock().unwrap();
            (sb.data_bitmap_start, sb.data_bitmap_blocks)
        };

        let handle = std::thread::spawn(move || loop {
            let guard = cp.wake_lock.lock().unwrap();
            let _ = cp
                .wake
                .wait_timeout(guard, Duration::from_secs(CHECKPOINT_INTERVAL_SECS))
                .unwrap();
            if cp.shutdown.load(Ordering::Acquire) {
                break;
            }
            if let Some(j) = &journal {
                if let Err(e) = j.checkpoint() {
                    log::warn!("background checkpoint failed: {e}");
                }
            }
            if let Err(e) = data_alloc.sync(&dev, bitmap_start, bitmap_blocks) {
                log::warn!("background bitmap sync failed: {e}");
            }
        });
        *cp.handle.lock().unwrap() = Some(handle);
    }

    /// Flushes everything to stable storage: journal checkpoint, extent
    /// bitmap, inode cache, block allocator (cache), then fsyncs the
    /// image file.
    pub fn sync(&self) -> FsResult<()> {
        if self.read_only {
            return Ok(());
        }
        if let Some(j) = &self.journal {
            j.checkpoint()?;
        }
        let sb = {
            let mut sb = self.superblock.lock().unwrap();
            let (total, free, _) = self.data_alloc.stats();
            sb.free_blocks = free;
            debug_assert_eq!(sb.data_blocks, total);
            let (itotal, ifree) = self.icache.stats();
            sb.free_inodes = ifree;
            debug_assert_eq!(sb.total_inodes, itotal);
            sb.write_time = now_secs();
            sb.clone()
        };
        self.data_alloc
            .sync(&self.dev, sb.data_bitmap_start, sb.data_bitmap_blocks)?;
        self.icache.sync_all()?;
        sb.store(&self.dev)?;
        self.dev.sync()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Drop for MountContext {
    fn drop(&mut self) {
        if let Some(cp) = &self.checkpointer {
            cp.shutdown.store(true, Ordering::Release);
            cp.wake.notify_all();
            if let Some(handle) = cp.handle.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
        if !self.read_only {
            if let Err(e) = self.sync() {
                log::error!("final sync on unmount failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::format_image;
    use tempfile::NamedTempFile;

    #[test]
    fn mount_fresh_image_and_unmount_cleanly() {
        let f = NamedTempFile::new().unwrap();
        format_image(f.path(), 8).unwrap();
        let ctx = MountContext::mount(f.path(), false).unwrap();
        assert!(!ctx.read_only);
        drop(ctx);
    }

    #[test]
    fn read_only_mount_skips_journal_and_checkpointer() {
        let f = NamedTempFile::new().unwrap();
        format_image(f.path(), 8).unwrap();
        let ctx = MountContext::mount(f.path(), true).unwrap();
        assert!(ctx.journal.is_none());
        assert!(ctx.checkpointer.is_none());
    }
}
