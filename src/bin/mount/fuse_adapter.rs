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

//! Translates `fuser` callbacks into calls on [`modernfs::fs::Filesystem`].
//!
//! Inode numbers are passed through unchanged; the on-disk root inode is
//! already numbered 1, which is also the FUSE convention, so no remapping
//! table is needed. The kernel's lookup-count protocol (`lookup`/`forget`)
//! is not tracked separately: `Filesystem`'s inode cache does its own LRU
//! pinning for the duration of each call, so `forget` is a no-op here.

use std::ffi::OsStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem as FuserFilesystem, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use modernfs::dir::EntryType;
use modernfs::error::FsError;
use modernfs::fs::{Attr, Filesystem as ModernFs};
use modernfs::inode::FileKind;

const TTL: Duration = Duration::from_secs(1);

fn secs_to_systemtime(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn systemtime_to_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn file_type_of(kind: FileKind) -> FileType {
    match kind {
        FileKind::File => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
    }
}

fn entry_type_of(kind: EntryType) -> FileType {
    match kind {
        EntryType::File => FileType::RegularFile,
        EntryType::Directory => FileType::Directory,
        EntryType::Symlink => FileType::Symlink,
    }
}

fn file_attr_of(attr: &Attr) -> FileAttr {
    FileAttr {
        ino: attr.inum as u64,
        size: attr.size,
        blocks: attr.blocks as u64,
        atime: secs_to_systemtime(attr.atime),
        mtime: secs_to_systemtime(attr.mtime),
        ctime: secs_to_systemtime(attr.ctime),
        crtime: secs_to_systemtime(attr.ctime),
        kind: file_type_of(attr.kind),
        perm: (attr.mode & 0o7777) as u16,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn errno_of(e: &FsError) -> i32 {
    e.to_errno()
}

/// The `fuser::Filesystem` implementation backing the `modernfs` mount
/// binary. Owns the mounted [`ModernFs`] and nothing else; every method
/// here is a thin translation layer, not where any engine logic lives.
pub struct FuseAdapter {
    pub fs: ModernFs,
}

impl FuseAdapter {
    pub fn new(fs: ModernFs) -> Self {
        Self { fs }
    }
}

impl FuserFilesystem for FuseAdapter {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.lookup(parent as u32, name) {
            Ok(attr) => reply.entry(&TTL, &file_attr_of(&attr), 0),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.fs.getattr(ino as u32) {
            Ok(attr) => reply.attr(&TTL, &file_attr_of(&attr)),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let inum = ino as u32;
        if let Some(mode) = mode {
            if let Err(e) = self.fs.chmod(inum, mode) {
                reply.error(errno_of(&e));
                return;
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(e) = self.fs.chown(inum, uid, gid) {
                reply.error(errno_of(&e));
                return;
            }
        }
        if let Some(size) = size {
            if let Err(e) = self.fs.truncate(inum, size) {
                reply.error(errno_of(&e));
                return;
            }
        }
        if atime.is_some() || mtime.is_some() {
            let now = systemtime_to_secs(SystemTime::now());
            let a = atime.map(|t| match t {
                TimeOrNow::SpecificTime(st) => systemtime_to_secs(st),
                TimeOrNow::Now => now,
            });
            let m = mtime.map(|t| match t {
                TimeOrNow::SpecificTime(st) => systemtime_to_secs(st),
                TimeOrNow::Now => now,
            });
            if let Err(e) = self.fs.utimens(inum, a, m) {
                reply.error(errno_of(&e));
                return;
            }
        }
        match self.fs.getattr(inum) {
            Ok(attr) => reply.attr(&TTL, &file_attr_of(&attr)),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.fs.readlink(ino as u32) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.mkdir(parent as u32, name, mode) {
            Ok(attr) => reply.entry(&TTL, &file_attr_of(&attr), 0),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.rmdir(parent as u32, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.unlink(parent as u32, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let (Some(name), Some(target)) = (link_name.to_str(), target.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.symlink(parent as u32, name, target) {
            Ok(attr) => reply.entry(&TTL, &file_attr_of(&attr), 0),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.create(parent as u32, name, mode) {
            Ok(attr) => reply.created(&TTL, &file_attr_of(&attr), 0, 0, 0),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.fs.open(ino as u32) {
            Ok(_) => reply.opened(0, 0),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.fs.read(ino as u32, offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.fs.write(ino as u32, offset as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.fsync() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.fs.readdir(ino as u32) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(errno_of(&e));
                return;
            }
        };
        for (i, entry) in entries.into_iter().enumerate().skip(offset as usize) {
            let full = reply.add(
                entry.inum as u64,
                (i + 1) as i64,
                entry_type_of(entry.kind),
                &entry.name,
            );
            if full {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.fs.statfs() {
            Ok(s) => reply.statfs(
                s.total_blocks as u64,
                s.free_blocks as u64,
                s.free_blocks as u64,
                s.total_inodes as u64,
                s.free_inodes as u64,
                s.block_size,
                s.namemax,
                s.block_size,
            ),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        match self.fs.getattr(ino as u32) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, _ino: u64, _nlookup: u64) {}
}
