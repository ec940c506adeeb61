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

//! The block device: `pread`/`pwrite` of the disk image at 4 KiB
//! granularity, fronted by a [`BufferCache`].
//!
//! This is the only layer that touches the image file directly. Every
//! other component reaches the disk through [`BlockDevice::read_block`] /
//! [`BlockDevice::write_block`], except the journal, which opens its own
//! cloned file descriptor so it can write around the cache (see
//! `crate::journal`).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::block::cache::{BufferCache, DEFAULT_CAPACITY};
use crate::error::{FsError, FsResult};
use crate::layout::BLOCK_SIZE;

/// Read/write counters mirrored into the superblock on every sync (§4.H).
#[derive(Default)]
pub struct DeviceStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
}

/// A 4 KiB-granular block device backed by a disk image file.
pub struct BlockDevice {
    file: File,
    total_blocks: u32,
    read_only: bool,
    cache: Mutex<BufferCache>,
    pub stats: DeviceStats,
}

impl BlockDevice {
    /// Opens `path`, computing the block count from the file's size.
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> FsResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let len = file.metadata()?.len();
        let total_blocks = (len / BLOCK_SIZE as u64) as u32;
        Ok(Self {
            file,
            total_blocks,
            read_only,
            cache: Mutex::new(BufferCache::new(DEFAULT_CAPACITY)),
            stats: DeviceStats::default(),
        })
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn check_range(&self, block: u32) -> FsResult<()> {
        if block >= self.total_blocks {
            return Err(FsError::invalid(format!(
                "block {block} out of range (total {})",
                self.total_blocks
            )));
        }
        Ok(())
    }

    /// Reads one 4 KiB block, through the cache.
    pub fn read_block(&self, block: u32) -> FsResult<[u8; BLOCK_SIZE]> {
        self.check_range(block)?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let mut cache = self.cache.lock().unwrap();
        if let Some(data) = cache.lookup(block) {
            return Ok(data);
        }
        let mut buf = [0u8; BLOCK_SIZE];
        let offset = block as u64 * BLOCK_SIZE as u64;
        self.file.read_exact_at(&mut buf, offset)?;
        cache.insert(block, buf, false);
        Ok(buf)
    }

    /// Writes one 4 KiB block through the cache; durability is reached only
    /// at the next [`BlockDevice::sync`] (or [`BufferCache::sync`] inline,
    /// if the cache degraded to direct I/O because it was full).
    pub fn write_block(&self, block: u32, data: &[u8; BLOCK_SIZE]) -> FsResult<()> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        self.check_range(block)?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let mut cache = self.cache.lock().unwrap();
        if !cache.insert(block, *data, true) {
            // Cache degraded: write straight through rather than block.
            let offset = block as u64 * BLOCK_SIZE as u64;
            self.file.write_all_at(data, offset)?;
        }
        Ok(())
    }

    /// Invalidates any cached copy of `block`. Called by the journal after
    /// it writes `block` directly, bypassing this cache.
    pub fn invalidate(&self, block: u32) {
        self.cache.lock().unwrap().invalidate(block);
    }

    /// Flushes every dirty frame, then forces the image file to stable
    /// storage.
    pub fn sync(&self) -> FsResult<()> {
        if self.read_only {
            return Ok(());
        }
        self.cache.lock().unwrap().sync(&self.file)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Opens an independent file descriptor onto the same image, for a
    /// component (the journal) that needs its own offset/ownership and
    /// must write around the cache.
    pub fn try_clone_file(&self) -> FsResult<File> {
        Ok(self.file.try_clone()?)
    }

    #[cfg(test)]
    pub fn cached_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn make_image(blocks: u32) -> NamedTempFile {
        let f = NamedTempFile::new().unwrap();
        f.as_file()
            .set_len(blocks as u64 * BLOCK_SIZE as u64)
            .unwrap();
        f
    }

    #[test]
    fn read_write_roundtrip() {
        let img = make_image(16);
        let dev = BlockDevice::open(img.path(), false).unwrap();
        let mut data = [0u8; BLOCK_SIZE];
        data[..5].copy_from_slice(b"hello");
        dev.write_block(3, &data).unwrap();
        let got = dev.read_block(3).unwrap();
        assert_eq!(&got[..5], b"hello");
    }

    #[test]
    fn out_of_range_is_rejected() {
        let img = make_image(4);
        let dev = BlockDevice::open(img.path(), false).unwrap();
        assert!(dev.read_block(4).is_err());
        assert!(dev.write_block(100, &[0u8; BLOCK_SIZE]).is_err());
    }

    #[test]
    fn read_only_rejects_writes() {
        let img = make_image(4);
        {
            let dev = BlockDevice::open(img.path(), false).unwrap();
            dev.write_block(0, &[7u8; BLOCK_SIZE]).unwrap();
            dev.sync().unwrap();
        }
        let dev = BlockDevice::open(img.path(), true).unwrap();
        assert!(matches!(
            dev.write_block(0, &[0u8; BLOCK_SIZE]),
            Err(FsError::ReadOnly)
        ));
        assert_eq!(dev.read_block(0).unwrap()[0], 7);
    }

    #[test]
    fn sync_persists_across_reopen() {
        let img = make_image(8);
        {
            let dev = BlockDevice::open(img.path(), false).unwrap();
            dev.write_block(2, &[9u8; BLOCK_SIZE]).unwrap();
            dev.sync().unwrap();
        }
        let dev = BlockDevice::open(img.path(), false).unwrap();
        assert_eq!(dev.read_block(2).unwrap()[0], 9);
    }
}
