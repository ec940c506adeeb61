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

//! The VFS-shaped facade: §6's operation table realized as one method per
//! row on [`Filesystem`]. This is the only layer `src/bin/mount.rs`'s FUSE
//! adapter calls; everything below it (mount context, inode cache,
//! directory layer, journal) is reached only through here.
//!
//! Mutating operations that touch block contents route through a journal
//! transaction when the mount is writable (every writable mount has one —
//! only read-only mounts skip journal init, and those reject mutations
//! before reaching here). `write` commits and checkpoints synchronously,
//! matching §6's table exactly; other mutating ops commit but leave
//! checkpointing to the background thread or an explicit `fsync`.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::alloc::ExtentAllocator;
use crate::dir::{self, EntryType};
use crate::error::{FsError, FsResult};
use crate::inode::{inode_read, inode_truncate, inode_write, DiskInode, FileKind, InodeHandle};
use crate::journal::{Transaction, MAX_BLOCKS_PER_TRANSACTION};
use crate::layout::{BLOCK_SIZE, NAME_MAX};
use crate::mount::MountContext;
use crate::path::{self, Resolver};
use crate::superblock::Superblock;

/// A snapshot of one inode's attributes, independent of any particular
/// adapter's attribute struct (the FUSE adapter maps this to
/// `fuser::FileAttr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub inum: u32,
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub blocks: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

/// One directory entry as returned by [`Filesystem::readdir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub inum: u32,
    pub kind: EntryType,
}

/// Live `statfs`-shaped counters (§6), with a `namemax` field carried
/// alongside the spec's table because every comparable from-scratch
/// filesystem in this pack's corpus reports one.
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub total_inodes: u32,
    pub free_inodes: u32,
    pub namemax: u32,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn attr_of(inum: u32, disk: &DiskInode) -> Attr {
    Attr {
        inum,
        kind: disk.kind,
        mode: disk.mode,
        uid: disk.uid,
        gid: disk.gid,
        nlink: disk.nlink,
        size: disk.size,
        blocks: disk.blocks,
        atime: disk.atime,
        mtime: disk.mtime,
        ctime: disk.ctime,
    }
}

fn validate_component(name: &str) -> FsResult<()> {
    if name.is_empty() || name.len() > NAME_MAX || name == "." || name == ".." {
        return Err(FsError::invalid(format!("invalid path component {name:?}")));
    }
    Ok(())
}

/// The mounted file system: one [`MountContext`] plus the root inode
/// number, exposing the VFS operations of §6.
pub struct Filesystem {
    pub ctx: MountContext,
    pub root_inum: u32,
}

impl Filesystem {
    /// Mounts `path`, validating that the root inode is a directory
    /// (§4.H: "Holds the root inode number (validated to be a directory)").
    pub fn mount(path: impl AsRef<Path>, read_only: bool) -> FsResult<Self> {
        let ctx = MountContext::mount(path, read_only)?;
        let root_inum = ctx.superblock.lock().unwrap().root_inum;
        let root = ctx.icache.get(root_inum)?;
        let is_dir = root.lock().kind == FileKind::Directory;
        ctx.icache.put(root_inum);
        if !is_dir {
            return Err(FsError::corruption("root inode is not a directory"));
        }
        Ok(Self { ctx, root_inum })
    }

    fn begin_txn(&self) -> Option<Transaction> {
        self.ctx.journal.as_ref().map(|j| j.begin())
    }

    fn commit_txn(&self, txn: Option<Transaction>) -> FsResult<()> {
        if let (Some(j), Some(t)) = (&self.ctx.journal, txn) {
            if !t.is_empty() {
                j.commit(t)?;
            }
        }
        Ok(())
    }

    fn check_writable(&self) -> FsResult<()> {
        if self.ctx.read_only {
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }

    fn disk_snapshot(&self, handle: &InodeHandle) -> DiskInode {
        handle.lock().clone()
    }

    fn replace(&self, handle: &InodeHandle, disk: DiskInode) {
        *handle.lock() = disk;
        handle.mark_dirty();
    }

    /// `getattr`: resolve → fill attributes.
    pub fn getattr(&self, inum: u32) -> FsResult<Attr> {
        let h = self.ctx.icache.get(inum)?;
        let attr = attr_of(inum, &h.lock());
        self.ctx.icache.put(inum);
        Ok(attr)
    }

    /// One path-component lookup inside `parent`, used by adapters that
    /// walk a tree one component at a time (FUSE's native calling
    /// convention) rather than through [`Filesystem::resolve`].
    pub fn lookup(&self, parent: u32, name: &str) -> FsResult<Attr> {
        let parent_h = self.ctx.icache.get(parent)?;
        let parent_disk = self.disk_snapshot(&parent_h);
        if parent_disk.kind != FileKind::Directory {
            self.ctx.icache.put(parent);
            return Err(FsError::invalid("lookup on a non-directory"));
        }
        let found = dir::lookup(&self.ctx.dev, &self.ctx.data_alloc, &parent_disk, name);
        self.ctx.icache.put(parent);
        let child_inum = found?;
        self.getattr(child_inum)
    }

    /// `readdir`: resolve (must be a directory) → iterate.
    pub fn readdir(&self, inum: u32) -> FsResult<Vec<DirEntry>> {
        let h = self.ctx.icache.get(inum)?;
        let disk = self.disk_snapshot(&h);
        self.ctx.icache.put(inum);
        if disk.kind != FileKind::Directory {
            return Err(FsError::invalid("readdir on a non-directory"));
        }
        let mut entries = Vec::new();
        dir::iterate(&self.ctx.dev, &self.ctx.data_alloc, &disk, |name, child_inum| {
            let kind = self
                .ctx
                .icache
                .get(child_inum)
                .map(|ch| {
                    let k = ch.lock().kind.into();
                    self.ctx.icache.put(child_inum);
                    k
                })
                .unwrap_or(EntryType::File);
            entries.push(DirEntry {
                name: name.to_string(),
                inum: child_inum,
                kind,
            });
            true
        })?;
        Ok(entries)
    }

    /// `mkdir`: resolve_parent → alloc dir inode → add `.`/`..` → add in
    /// parent, `parent.nlink++` (the new `..` back-reference).
    pub fn mkdir(&self, parent: u32, name: &str, mode: u32) -> FsResult<Attr> {
        self.check_writable()?;
        validate_component(name)?;
        let now = now_secs();

        let parent_h = self.ctx.icache.get(parent)?;
        let result = (|| -> FsResult<Attr> {
            let mut parent_disk = self.disk_snapshot(&parent_h);
            if parent_disk.kind != FileKind::Directory {
                return Err(FsError::invalid("mkdir inside a non-directory"));
            }
            if dir::lookup(&self.ctx.dev, &self.ctx.data_alloc, &parent_disk, name).is_ok() {
                return Err(FsError::AlreadyExists);
            }

            let child_inum = self.ctx.icache.alloc(FileKind::Directory, mode, now)?;
            let child_h = self.ctx.icache.get(child_inum)?;
            let mut txn = self.begin_txn();

            let mut child_disk = self.disk_snapshot(&child_h);
            child_disk.nlink = 2;
            dir::init_new_directory(
                &self.ctx.dev,
                &self.ctx.data_alloc,
                &mut child_disk,
                child_inum,
                parent,
                txn.as_mut(),
                now,
            )?;
            self.replace(&child_h, child_disk.clone());

            dir::add(
                &self.ctx.dev,
                &self.ctx.data_alloc,
                &mut parent_disk,
                name,
                child_inum,
                EntryType::Directory,
                txn.as_mut(),
                now,
            )?;
            parent_disk.nlink += 1;
            self.replace(&parent_h, parent_disk.clone());

            self.ctx.icache.write_back(&child_h)?;
            self.ctx.icache.write_back(&parent_h)?;
            self.commit_txn(txn)?;

            self.ctx.icache.put(child_inum);
            Ok(attr_of(child_inum, &child_disk))
        })();
        self.ctx.icache.put(parent);
        result
    }

    /// `rmdir`: resolve_parent → lookup → check `is_empty` → remove →
    /// free inode → `parent.nlink--`.
    pub fn rmdir(&self, parent: u32, name: &str) -> FsResult<()> {
        self.check_writable()?;
        if name == "." || name == ".." {
            return Err(FsError::invalid("cannot rmdir '.' or '..'"));
        }
        let now = now_secs();
        let parent_h = self.ctx.icache.get(parent)?;
        let result = (|| -> FsResult<()> {
            let mut parent_disk = self.disk_snapshot(&parent_h);
            let child_inum = dir::lookup(&self.ctx.dev, &self.ctx.data_alloc, &parent_disk, name)?;
            let child_h = self.ctx.icache.get(child_inum)?;
            let child_disk = self.disk_snapshot(&child_h);
            if child_disk.kind != FileKind::Directory {
                self.ctx.icache.put(child_inum);
                return Err(FsError::invalid(format!("{name} is not a directory")));
            }
            if !dir::is_empty(&self.ctx.dev, &self.ctx.data_alloc, &child_disk)? {
                self.ctx.icache.put(child_inum);
                return Err(FsError::NotEmpty);
            }

            let mut txn = self.begin_txn();
            dir::remove(
                &self.ctx.dev,
                &self.ctx.data_alloc,
                &mut parent_disk,
                name,
                txn.as_mut(),
                now,
            )?;
            parent_disk.nlink = parent_disk.nlink.saturating_sub(1);
            self.replace(&parent_h, parent_disk);
            self.ctx.icache.write_back(&parent_h)?;
            self.commit_txn(txn)?;

            self.ctx.icache.free(&self.ctx.data_alloc, &child_h, now)?;
            self.ctx.icache.put(child_inum);
            Ok(())
        })();
        self.ctx.icache.put(parent);
        result
    }

    /// `create`: resolve_parent → alloc file inode → add in parent.
    pub fn create(&self, parent: u32, name: &str, mode: u32) -> FsResult<Attr> {
        self.check_writable()?;
        validate_component(name)?;
        let now = now_secs();
        let parent_h = self.ctx.icache.get(parent)?;
        let result = (|| -> FsResult<Attr> {
            let mut parent_disk = self.disk_snapshot(&parent_h);
            if parent_disk.kind != FileKind::Directory {
                return Err(FsError::invalid("create inside a non-directory"));
            }
            if dir::lookup(&self.ctx.dev, &self.ctx.data_alloc, &parent_disk, name).is_ok() {
                return Err(FsError::AlreadyExists);
            }

            let inum = self.ctx.icache.alloc(FileKind::File, mode, now)?;
            let child_h = self.ctx.icache.get(inum)?;
            let mut txn = self.begin_txn();

            dir::add(
                &self.ctx.dev,
                &self.ctx.data_alloc,
                &mut parent_disk,
                name,
                inum,
                EntryType::File,
                txn.as_mut(),
                now,
            )?;
            self.replace(&parent_h, parent_disk);
            self.ctx.icache.write_back(&parent_h)?;
            self.commit_txn(txn)?;

            let attr = attr_of(inum, &child_h.lock());
            self.ctx.icache.put(inum);
            Ok(attr)
        })();
        self.ctx.icache.put(parent);
        result
    }

    /// `symlink`: same slot as `create`, but the new inode's data holds the
    /// target path string instead of file content (§3/§4.G). Not part of
    /// §6's table verbatim, but required for the path resolver's
    /// `follow_symlink` behavior to have anything to read.
    pub fn symlink(&self, parent: u32, name: &str, target: &str) -> FsResult<Attr> {
        self.check_writable()?;
        validate_component(name)?;
        if target.is_empty() {
            return Err(FsError::invalid("symlink target must not be empty"));
        }
        let now = now_secs();
        let parent_h = self.ctx.icache.get(parent)?;
        let result = (|| -> FsResult<Attr> {
            let mut parent_disk = self.disk_snapshot(&parent_h);
            if parent_disk.kind != FileKind::Directory {
                return Err(FsError::invalid("symlink inside a non-directory"));
            }
            if dir::lookup(&self.ctx.dev, &self.ctx.data_alloc, &parent_disk, name).is_ok() {
                return Err(FsError::AlreadyExists);
            }

            let inum = self.ctx.icache.alloc(FileKind::Symlink, 0o777, now)?;
            let child_h = self.ctx.icache.get(inum)?;
            let mut txn = self.begin_txn();

            let mut child_disk = self.disk_snapshot(&child_h);
            inode_write(
                &self.ctx.dev,
                &self.ctx.data_alloc,
                &mut child_disk,
                0,
                target.as_bytes(),
                txn.as_mut(),
                now,
            )?;
            self.replace(&child_h, child_disk.clone());

            dir::add(
                &self.ctx.dev,
                &self.ctx.data_alloc,
                &mut parent_disk,
                name,
                inum,
                EntryType::Symlink,
                txn.as_mut(),
                now,
            )?;
            self.replace(&parent_h, parent_disk);

            self.ctx.icache.write_back(&child_h)?;
            self.ctx.icache.write_back(&parent_h)?;
            self.commit_txn(txn)?;

            self.ctx.icache.put(inum);
            Ok(attr_of(inum, &child_disk))
        })();
        self.ctx.icache.put(parent);
        result
    }

    /// `readlink`: returns the stored target string of a symlink inode.
    pub fn readlink(&self, inum: u32) -> FsResult<String> {
        let h = self.ctx.icache.get(inum)?;
        let disk = self.disk_snapshot(&h);
        self.ctx.icache.put(inum);
        if disk.kind != FileKind::Symlink {
            return Err(FsError::invalid("readlink on a non-symlink"));
        }
        let mut buf = vec![0u8; disk.size as usize];
        inode_read(&self.ctx.dev, &self.ctx.data_alloc, &disk, 0, &mut buf)?;
        String::from_utf8(buf).map_err(|_| FsError::corruption("symlink target is not valid UTF-8"))
    }

    /// `open`: resolve → assert file. Returns the validated attributes so
    /// an adapter can size its file-handle bookkeeping without a second
    /// `getattr` round trip.
    pub fn open(&self, inum: u32) -> FsResult<Attr> {
        let h = self.ctx.icache.get(inum)?;
        let disk = self.disk_snapshot(&h);
        self.ctx.icache.put(inum);
        if disk.kind != FileKind::File {
            return Err(FsError::invalid("open on a non-regular file"));
        }
        Ok(attr_of(inum, &disk))
    }

    /// `read`: `get(inum)` → `inode_read`. Honors holes and clips to EOF;
    /// never errors on a short read. Updates `atime` (persisted lazily —
    /// see the inode layer's note on not synchronously writing back every
    /// read).
    pub fn read(&self, inum: u32, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        let h = self.ctx.icache.get(inum)?;
        let mut buf = vec![0u8; len];
        let n = {
            let mut guard = h.lock();
            if guard.kind != FileKind::File {
                self.ctx.icache.put(inum);
                return Err(FsError::invalid("read on a non-regular file"));
            }
            let n = inode_read(&self.ctx.dev, &self.ctx.data_alloc, &guard, offset, &mut buf)?;
            guard.atime = now_secs();
            n
        };
        h.mark_dirty();
        self.ctx.icache.put(inum);
        buf.truncate(n);
        Ok(buf)
    }

    /// `write`: `get(inum)` → begin txn (mount is always journaled when
    /// writable) → `inode_write` → `inode_sync` (write the inode back,
    /// since its metadata is not itself journaled) → commit → checkpoint.
    ///
    /// A single call can span far more blocks than one journal transaction
    /// can hold, so the byte range is split into chunks of at most
    /// `MAX_BLOCKS_PER_TRANSACTION - 1` blocks (the `-1` absorbs the one
    /// extra block an unaligned `offset` can add), each committed and
    /// checkpointed on its own. If a chunk runs out of space partway
    /// through, the loop stops there and the bytes written so far are
    /// returned rather than discarded.
    pub fn write(&self, inum: u32, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.check_writable()?;
        let h = self.ctx.icache.get(inum)?;
        const CHUNK_BYTES: usize = (MAX_BLOCKS_PER_TRANSACTION - 1) * BLOCK_SIZE;
        let result = (|| -> FsResult<usize> {
            let now = now_secs();
            let mut total = 0usize;
            while total < data.len() {
                let chunk_offset = offset + total as u64;
                let chunk = &data[total..(total + CHUNK_BYTES).min(data.len())];

                let mut txn = self.begin_txn();
                let n = {
                    let mut guard = h.lock();
                    if guard.kind != FileKind::File {
                        return Err(FsError::invalid("write on a non-regular file"));
                    }
                    inode_write(
                        &self.ctx.dev,
                        &self.ctx.data_alloc,
                        &mut guard,
                        chunk_offset,
                        chunk,
                        txn.as_mut(),
                        now,
                    )?
                };
                h.mark_dirty();
                self.ctx.icache.write_back(&h)?;
                if let Some(j) = &self.ctx.journal {
                    if let Some(t) = txn.take() {
                        if !t.is_empty() {
                            j.commit(t)?;
                            j.checkpoint()?;
                        }
                    }
                }
                total += n;
                if n < chunk.len() {
                    // Ran out of space mid-chunk; further chunks would too.
                    break;
                }
            }
            Ok(total)
        })();
        self.ctx.icache.put(inum);
        result
    }

    /// `unlink`: resolve_parent → lookup → assert not a directory → remove
    /// → decrement `nlink`, freeing the inode only once it reaches zero
    /// (§9's resolved open question: the prototype always frees outright).
    pub fn unlink(&self, parent: u32, name: &str) -> FsResult<()> {
        self.check_writable()?;
        let now = now_secs();
        let parent_h = self.ctx.icache.get(parent)?;
        let result = (|| -> FsResult<()> {
            let mut parent_disk = self.disk_snapshot(&parent_h);
            let child_inum = dir::lookup(&self.ctx.dev, &self.ctx.data_alloc, &parent_disk, name)?;
            let child_h = self.ctx.icache.get(child_inum)?;
            let mut child_disk = self.disk_snapshot(&child_h);
            if child_disk.kind == FileKind::Directory {
                self.ctx.icache.put(child_inum);
                return Err(FsError::invalid("unlink on a directory"));
            }

            let mut txn = self.begin_txn();
            dir::remove(
                &self.ctx.dev,
                &self.ctx.data_alloc,
                &mut parent_disk,
                name,
                txn.as_mut(),
                now,
            )?;
            self.replace(&parent_h, parent_disk);
            self.ctx.icache.write_back(&parent_h)?;
            self.commit_txn(txn)?;

            child_disk.nlink = child_disk.nlink.saturating_sub(1);
            if child_disk.nlink == 0 {
                self.replace(&child_h, child_disk);
                self.ctx.icache.free(&self.ctx.data_alloc, &child_h, now)?;
            } else {
                self.replace(&child_h, child_disk);
                self.ctx.icache.write_back(&child_h)?;
            }
            self.ctx.icache.put(child_inum);
            Ok(())
        })();
        self.ctx.icache.put(parent);
        result
    }

    /// `truncate`: resolve → assert file → `inode_truncate`. Not
    /// journaled (the block map's own bitmap frees are applied directly,
    /// matching [`inode_truncate`]'s signature), written back immediately.
    pub fn truncate(&self, inum: u32, new_size: u64) -> FsResult<()> {
        self.check_writable()?;
        let h = self.ctx.icache.get(inum)?;
        let result = (|| -> FsResult<()> {
            let now = now_secs();
            {
                let mut guard = h.lock();
                if guard.kind != FileKind::File {
                    return Err(FsError::invalid("truncate on a non-regular file"));
                }
                inode_truncate(&self.ctx.dev, &self.ctx.data_alloc, &mut guard, new_size, now)?;
            }
            h.mark_dirty();
            self.ctx.icache.write_back(&h)
        })();
        self.ctx.icache.put(inum);
        result
    }

    /// `statfs`: block size, total/free data blocks, total/free inodes.
    pub fn statfs(&self) -> FsResult<StatFs> {
        let sb: Superblock = self.ctx.superblock.lock().unwrap().clone();
        let (total_blocks, free_blocks, _) = self.ctx.data_alloc.stats();
        let (total_inodes, free_inodes) = self.ctx.icache.stats();
        Ok(StatFs {
            block_size: sb.block_size,
            total_blocks,
            free_blocks,
            total_inodes,
            free_inodes,
            namemax: NAME_MAX as u32,
        })
    }

    /// `utimens`: resolve → update `atime`/`mtime` → dirty.
    pub fn utimens(&self, inum: u32, atime: Option<u64>, mtime: Option<u64>) -> FsResult<()> {
        self.check_writable()?;
        let h = self.ctx.icache.get(inum)?;
        {
            let mut guard = h.lock();
            if let Some(a) = atime {
                guard.atime = a;
            }
            if let Some(m) = mtime {
                guard.mtime = m;
            }
            guard.ctime = now_secs();
        }
        h.mark_dirty();
        let result = self.ctx.icache.write_back(&h);
        self.ctx.icache.put(inum);
        result
    }

    /// `chmod`: resolve → update `mode` → dirty.
    pub fn chmod(&self, inum: u32, mode: u32) -> FsResult<()> {
        self.check_writable()?;
        let h = self.ctx.icache.get(inum)?;
        {
            let mut guard = h.lock();
            guard.mode = mode;
            guard.ctime = now_secs();
        }
        h.mark_dirty();
        let result = self.ctx.icache.write_back(&h);
        self.ctx.icache.put(inum);
        result
    }

    /// `chown`: resolve → update `uid`/`gid` → dirty. A `None` field
    /// leaves that attribute unchanged, matching the FUSE `setattr`
    /// contract this backs.
    pub fn chown(&self, inum: u32, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        self.check_writable()?;
        let h = self.ctx.icache.get(inum)?;
        {
            let mut guard = h.lock();
            if let Some(u) = uid {
                guard.uid = u;
            }
            if let Some(g) = gid {
                guard.gid = g;
            }
            guard.ctime = now_secs();
        }
        h.mark_dirty();
        let result = self.ctx.icache.write_back(&h);
        self.ctx.icache.put(inum);
        result
    }

    /// `fsync`: drives the mount context's full sync path (journal
    /// checkpoint → bitmap sync → inode writeback → image fsync).
    pub fn fsync(&self) -> FsResult<()> {
        self.ctx.sync()
    }

    /// Resolves a slash-separated path from the root, following symlinks,
    /// for the CLI and test-scenario callers — the FUSE adapter itself
    /// never calls this, since the kernel already walks one component at
    /// a time via repeated `lookup`.
    pub fn resolve(&self, path: &str) -> FsResult<Attr> {
        let resolved = path::resolve(self, self.root_inum, self.root_inum, path, true)?;
        let attr = attr_of(resolved.inum, &resolved.inode.lock());
        self.ctx.icache.put(resolved.inum);
        Ok(attr)
    }

    /// Resolves everything but the final component of `path`, returning
    /// the parent directory's inode number and the basename to create or
    /// remove there.
    pub fn resolve_parent(&self, path: &str) -> FsResult<(u32, String)> {
        let (resolved, base) = path::resolve_parent(self, self.root_inum, self.root_inum, path)?;
        let parent_inum = resolved.inum;
        self.ctx.icache.put(parent_inum);
        Ok((parent_inum, base))
    }
}

impl Resolver for Filesystem {
    type Handle = Arc<InodeHandle>;

    fn get(&self, inum: u32) -> FsResult<Self::Handle> {
        self.ctx.icache.get(inum)
    }

    fn put(&self, inum: u32) {
        self.ctx.icache.put(inum)
    }

    fn is_dir(&self, handle: &Self::Handle) -> bool {
        handle.lock().kind == FileKind::Directory
    }

    fn is_symlink(&self, handle: &Self::Handle) -> bool {
        handle.lock().kind == FileKind::Symlink
    }

    fn lookup_child(&self, dir_handle: &Self::Handle, name: &str) -> FsResult<u32> {
        let disk = dir_handle.lock().clone();
        dir::lookup(&self.ctx.dev, &self.ctx.data_alloc, &disk, name)
    }

    fn read_symlink(&self, handle: &Self::Handle) -> FsResult<String> {
        let disk = handle.lock().clone();
        let mut buf = vec![0u8; disk.size as usize];
        inode_read(&self.ctx.dev, &self.ctx.data_alloc, &disk, 0, &mut buf)?;
        String::from_utf8(buf).map_err(|_| FsError::corruption("symlink target is not valid UTF-8"))
    }

    fn inum_of(&self, handle: &Self::Handle) -> u32 {
        handle.inum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::format_image;
    use tempfile::NamedTempFile;

    fn mounted(mib: u64) -> (NamedTempFile, Filesystem) {
        let f = NamedTempFile::new().unwrap();
        format_image(f.path(), mib).unwrap();
        let fs = Filesystem::mount(f.path(), false).unwrap();
        (f, fs)
    }

    #[test]
    fn s1_create_write_read_small_file() {
        let (_f, fs) = mounted(16);
        let attr = fs.create(fs.root_inum, "hello.txt", 0o644).unwrap();
        let payload = b"Hello, ModernFS!";
        let n = fs.write(attr.inum, 0, payload).unwrap();
        assert_eq!(n, payload.len());
        let out = fs.read(attr.inum, 0, payload.len()).unwrap();
        assert_eq!(&out, payload);
        assert_eq!(fs.getattr(attr.inum).unwrap().size, payload.len() as u64);
    }

    #[test]
    fn s6_rmdir_requires_empty_directory() {
        let (_f, fs) = mounted(16);
        let a = fs.mkdir(fs.root_inum, "a", 0o755).unwrap();
        fs.create(a.inum, "b", 0o644).unwrap();
        fs.create(a.inum, "c", 0o644).unwrap();
        assert!(matches!(fs.rmdir(fs.root_inum, "a"), Err(FsError::NotEmpty)));
        fs.unlink(a.inum, "b").unwrap();
        fs.unlink(a.inum, "c").unwrap();
        let root_nlink_before = fs.getattr(fs.root_inum).unwrap().nlink;
        fs.rmdir(fs.root_inum, "a").unwrap();
        let root_nlink_after = fs.getattr(fs.root_inum).unwrap().nlink;
        assert_eq!(root_nlink_after, root_nlink_before - 1);
        assert!(matches!(
            fs.lookup(fs.root_inum, "a"),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn create_duplicate_name_rejected() {
        let (_f, fs) = mounted(16);
        fs.create(fs.root_inum, "dup", 0o644).unwrap();
        assert!(matches!(
            fs.create(fs.root_inum, "dup", 0o644),
            Err(FsError::AlreadyExists)
        ));
    }

    #[test]
    fn unlink_regular_file_removes_entry_and_frees_inode() {
        let (_f, fs) = mounted(16);
        let attr = fs.create(fs.root_inum, "f", 0o644).unwrap();
        fs.write(attr.inum, 0, b"data").unwrap();
        fs.unlink(fs.root_inum, "f").unwrap();
        assert!(matches!(
            fs.lookup(fs.root_inum, "f"),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn truncate_then_read_past_end_is_eof() {
        let (_f, fs) = mounted(16);
        let attr = fs.create(fs.root_inum, "t", 0o644).unwrap();
        fs.write(attr.inum, 0, &vec![7u8; 100]).unwrap();
        fs.truncate(attr.inum, 50).unwrap();
        let out = fs.read(attr.inum, 50, 10).unwrap();
        assert!(out.is_empty());
        let out2 = fs.read(attr.inum, 0, 10).unwrap();
        assert_eq!(out2, vec![7u8; 10]);
    }

    #[test]
    fn symlink_create_and_readlink_roundtrip() {
        let (_f, fs) = mounted(16);
        fs.create(fs.root_inum, "target.txt", 0o644).unwrap();
        let link = fs.symlink(fs.root_inum, "link", "target.txt").unwrap();
        assert_eq!(fs.readlink(link.inum).unwrap(), "target.txt");
        let resolved = fs.resolve("/link").unwrap();
        let direct = fs.resolve("/target.txt").unwrap();
        assert_eq!(resolved.inum, direct.inum);
    }

    #[test]
    fn readdir_lists_all_created_entries() {
        let (_f, fs) = mounted(16);
        for i in 0..5 {
            fs.create(fs.root_inum, &format!("f{i}"), 0o644).unwrap();
        }
        let entries = fs.readdir(fs.root_inum).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"."));
        assert!(names.contains(&".."));
        for i in 0..5 {
            assert!(names.contains(&format!("f{i}").as_str()));
        }
    }

    #[test]
    fn statfs_reflects_allocations() {
        let (_f, fs) = mounted(16);
        let before = fs.statfs().unwrap();
        let attr = fs.create(fs.root_inum, "big", 0o644).unwrap();
        fs.write(attr.inum, 0, &vec![1u8; 8192]).unwrap();
        let after = fs.statfs().unwrap();
        assert!(after.free_blocks < before.free_blocks);
        assert!(after.free_inodes < before.free_inodes);
    }

    #[test]
    fn read_only_mount_rejects_mutation() {
        let f = NamedTempFile::new().unwrap();
        format_image(f.path(), 16).unwrap();
        {
            let fs = Filesystem::mount(f.path(), false).unwrap();
            fs.create(fs.root_inum, "already-there", 0o644).unwrap();
        }
        let fs = Filesystem::mount(f.path(), true).unwrap();
        assert!(matches!(
            fs.create(fs.root_inum, "nope", 0o644),
            Err(FsError::ReadOnly)
        ));
        assert!(fs.lookup(fs.root_inum, "already-there").is_ok());
    }

    #[test]
    fn write_spanning_many_transactions_round_trips() {
        // Large enough to force several MAX_BLOCKS_PER_TRANSACTION-sized
        // chunks through separate journal commits.
        let (_f, fs) = mounted(64);
        let attr = fs.create(fs.root_inum, "large.dat", 0o644).unwrap();
        let len = (MAX_BLOCKS_PER_TRANSACTION * 3 + 7) * BLOCK_SIZE;
        let pattern: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let n = fs.write(attr.inum, 0, &pattern).unwrap();
        assert_eq!(n, len);
        let out = fs.read(attr.inum, 0, len).unwrap();
        assert_eq!(out, pattern);
        assert_eq!(fs.getattr(attr.inum).unwrap().size, len as u64);
    }
}
