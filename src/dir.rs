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

//! The directory layer: §4.F. A directory is a file whose contents are
//! variable-length records, packed 8-byte aligned, never crossing a block
//! boundary. The last record in a block always extends to the block's
//! edge so the sum of `rec_len` in one block is exactly 4096.
//!
//! A record's *logical* size is `header(8) + name_len`, rounded up to 8;
//! only that many bytes are ever written — the §9 open question about
//! over-writing past the logical record is resolved by never allocating a
//! fixed 255-byte name field on disk (see `SPEC_FULL.md` §3).

use crate::alloc::ExtentAllocator;
use crate::error::{FsError, FsResult};
use crate::inode::{inode_read, inode_write, DiskInode, FileKind};
use crate::journal::Transaction;
use crate::layout::{BLOCK_SIZE, DIRENT_ALIGN, DIRENT_HEADER_LEN, NAME_MAX};

/// File-type tag carried alongside the name, mirroring [`FileKind`] so a
/// `readdir` caller doesn't need an extra inode lookup to know what kind
/// of entry it just saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    File = 1,
    Directory = 2,
    Symlink = 3,
}

impl From<FileKind> for EntryType {
    fn from(k: FileKind) -> Self {
        match k {
            FileKind::File => EntryType::File,
            FileKind::Directory => EntryType::Directory,
            FileKind::Symlink => EntryType::Symlink,
        }
    }
}

impl EntryType {
    fn from_u8(v: u8) -> FsResult<Self> {
        match v {
            1 => Ok(EntryType::File),
            2 => Ok(EntryType::Directory),
            3 => Ok(EntryType::Symlink),
            other => Err(FsError::corruption(format!("invalid directory entry type {other}"))),
        }
    }
}

/// Rounds `n` up to the next multiple of [`DIRENT_ALIGN`].
fn align8(n: usize) -> usize {
    (n + DIRENT_ALIGN - 1) & !(DIRENT_ALIGN - 1)
}

/// Logical record size for a name of `name_len` bytes: header plus name,
/// 8-byte aligned.
fn logical_len(name_len: usize) -> u16 {
    align8(DIRENT_HEADER_LEN + name_len) as u16
}

struct RawEntry {
    inum: u32,
    rec_len: u16,
    name_len: u8,
    file_type: u8,
    name: Vec<u8>,
}

impl RawEntry {
    fn tombstone(rec_len: u16) -> Self {
        Self {
            inum: 0,
            rec_len,
            name_len: 0,
            file_type: 0,
            name: Vec::new(),
        }
    }

    fn parse(buf: &[u8], at: usize) -> FsResult<Self> {
        if at + DIRENT_HEADER_LEN > buf.len() {
            return Err(FsError::corruption("directory record header runs past block"));
        }
        let inum = u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
        let rec_len = u16::from_le_bytes(buf[at + 4..at + 6].try_into().unwrap());
        let name_len = buf[at + 6];
        let file_type = buf[at + 7];
        if rec_len == 0 || at + rec_len as usize > buf.len() {
            return Err(FsError::corruption("directory record length out of range"));
        }
        let name_start = at + DIRENT_HEADER_LEN;
        let name_end = name_start + name_len as usize;
        if name_end > buf.len() || name_end > at + rec_len as usize {
            return Err(FsError::corruption("directory record name runs past rec_len"));
        }
        let name = buf[name_start..name_end].to_vec();
        Ok(Self {
            inum,
            rec_len,
            name_len,
            file_type,
            name,
        })
    }

    /// Writes only the logical record — never the full `rec_len` slack —
    /// so bytes beyond it (belonging to whatever used to occupy the slack)
    /// are left untouched.
    fn write_into(&self, buf: &mut [u8], at: usize) {
        buf[at..at + 4].copy_from_slice(&self.inum.to_le_bytes());
        buf[at + 4..at + 6].copy_from_slice(&self.rec_len.to_le_bytes());
        buf[at + 6] = self.name_len;
        buf[at + 7] = self.file_type;
        let name_start = at + DIRENT_HEADER_LEN;
        buf[name_start..name_start + self.name.len()].copy_from_slice(&self.name);
    }
}

fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(FsError::invalid(format!(
            "name length {} out of range (1..={NAME_MAX})",
            name.len()
        )));
    }
    if name.contains('\0') || name.contains('/') {
        return Err(FsError::invalid("name may not contain NUL or '/'"));
    }
    Ok(())
}

/// Reads one 4 KiB directory block from `dir`'s file contents at logical
/// block `idx`. Directories never have holes, so a missing block is a
/// corruption, not an empty read.
fn read_dir_block(
    dev: &crate::block::BlockDevice,
    bitmap: &ExtentAllocator,
    dir: &DiskInode,
    idx: u64,
) -> FsResult<[u8; BLOCK_SIZE]> {
    let mut buf = [0u8; BLOCK_SIZE];
    let n = inode_read(dev, bitmap, dir, idx * BLOCK_SIZE as u64, &mut buf)?;
    if n == 0 && idx * BLOCK_SIZE as u64 < dir.size {
        return Err(FsError::corruption("directory block missing mid-file"));
    }
    Ok(buf)
}

fn block_count(dir: &DiskInode) -> u64 {
    (dir.size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64
}

/// Looks up `name` in `dir`, returning its inode number.
pub fn lookup(
    dev: &crate::block::BlockDevice,
    bitmap: &ExtentAllocator,
    dir: &DiskInode,
    name: &str,
) -> FsResult<u32> {
    let name_bytes = name.as_bytes();
    for idx in 0..block_count(dir) {
        let buf = read_dir_block(dev, bitmap, dir, idx)?;
        let mut at = 0usize;
        while at < BLOCK_SIZE {
            let entry = RawEntry::parse(&buf, at)?;
            if entry.inum != 0 && entry.name == name_bytes {
                return Ok(entry.inum);
            }
            at += entry.rec_len as usize;
        }
    }
    Err(FsError::NotFound)
}

/// Iterates every non-tombstone entry in `dir`, calling `f(name, inum)`
/// for each. Stops early if `f` returns `false`.
pub fn iterate(
    dev: &crate::block::BlockDevice,
    bitmap: &ExtentAllocator,
    dir: &DiskInode,
    mut f: impl FnMut(&str, u32) -> bool,
) -> FsResult<()> {
    for idx in 0..block_count(dir) {
        let buf = read_dir_block(dev, bitmap, dir, idx)?;
        let mut at = 0usize;
        while at < BLOCK_SIZE {
            let entry = RawEntry::parse(&buf, at)?;
            if entry.inum != 0 {
                let name = String::from_utf8_lossy(&entry.name);
                if !f(&name, entry.inum) {
                    return Ok(());
                }
            }
            at += entry.rec_len as usize;
        }
    }
    Ok(())
}

/// True iff `dir` contains only `.` and `..`.
pub fn is_empty(
    dev: &crate::block::BlockDevice,
    bitmap: &ExtentAllocator,
    dir: &DiskInode,
) -> FsResult<bool> {
    let mut empty = true;
    iterate(dev, bitmap, dir, |name, _| {
        if name != "." && name != ".." {
            empty = false;
            false
        } else {
            true
        }
    })?;
    Ok(empty)
}

/// Adds `(name, inum, kind)` to `dir`. Rejects duplicates and malformed
/// names. Reuses a tombstone or an in-use record's trailing slack when one
/// is large enough; otherwise appends a fresh block.
pub fn add(
    dev: &crate::block::BlockDevice,
    bitmap: &ExtentAllocator,
    dir: &mut DiskInode,
    name: &str,
    inum: u32,
    kind: EntryType,
    mut txn: Option<&mut Transaction>,
    now: u64,
) -> FsResult<()> {
    validate_name(name)?;
    if lookup(dev, bitmap, dir, name).is_ok() {
        return Err(FsError::AlreadyExists);
    }

    let name_bytes = name.as_bytes().to_vec();
    let want_len = logical_len(name_bytes.len());
    let new = RawEntry {
        inum,
        rec_len: want_len,
        name_len: name_bytes.len() as u8,
        file_type: kind as u8,
        name: name_bytes,
    };

    for idx in 0..block_count(dir) {
        let mut buf = read_dir_block(dev, bitmap, dir, idx)?;
        let mut at = 0usize;
        while at < BLOCK_SIZE {
            let entry = RawEntry::parse(&buf, at)?;
            if entry.inum == 0 && entry.rec_len >= want_len {
                let mut placed = new;
                placed.rec_len = entry.rec_len;
                placed.write_into(&mut buf, at);
                return commit_block(dev, bitmap, dir, idx, buf, txn, now);
            }
            if entry.inum != 0 {
                let used = logical_len(entry.name_len as usize);
                let slack = entry.rec_len - used;
                if slack >= want_len {
                    let mut shrunk = entry;
                    let old_rec_len = shrunk.rec_len;
                    shrunk.rec_len = used;
                    shrunk.write_into(&mut buf, at);
                    let mut placed = new;
                    placed.rec_len = old_rec_len - used;
                    placed.write_into(&mut buf, at + used as usize);
                    return commit_block(dev, bitmap, dir, idx, buf, txn, now);
                }
            }
            at += entry.rec_len as usize;
        }
    }

    // No slot fit: append a fresh block with the new entry spanning it.
    let mut buf = [0u8; BLOCK_SIZE];
    let mut placed = new;
    placed.rec_len = BLOCK_SIZE as u16;
    placed.write_into(&mut buf, 0);
    let at_offset = dir.size;
    let n = inode_write(dev, bitmap, dir, at_offset, &buf, txn.as_deref_mut(), now)?;
    if n != BLOCK_SIZE {
        return Err(FsError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "short directory block append",
        )));
    }
    Ok(())
}

fn commit_block(
    dev: &crate::block::BlockDevice,
    bitmap: &ExtentAllocator,
    dir: &mut DiskInode,
    idx: u64,
    buf: [u8; BLOCK_SIZE],
    txn: Option<&mut Transaction>,
    now: u64,
) -> FsResult<()> {
    let n = inode_write(dev, bitmap, dir, idx * BLOCK_SIZE as u64, &buf, txn, now)?;
    if n != BLOCK_SIZE {
        return Err(FsError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "short directory block write",
        )));
    }
    Ok(())
}

/// Removes `name` from `dir`. If it is the first record in its block, it
/// becomes a tombstone (its space reclaimable by a later `add`);
/// otherwise the previous record's length is extended to absorb it.
pub fn remove(
    dev: &crate::block::BlockDevice,
    bitmap: &ExtentAllocator,
    dir: &mut DiskInode,
    name: &str,
    mut txn: Option<&mut Transaction>,
    now: u64,
) -> FsResult<()> {
    let name_bytes = name.as_bytes();
    for idx in 0..block_count(dir) {
        let mut buf = read_dir_block(dev, bitmap, dir, idx)?;
        let mut at = 0usize;
        let mut prev: Option<usize> = None;
        while at < BLOCK_SIZE {
            let entry = RawEntry::parse(&buf, at)?;
            if entry.inum != 0 && entry.name == name_bytes {
                if let Some(prev_at) = prev {
                    let mut prev_entry = RawEntry::parse(&buf, prev_at)?;
                    prev_entry.rec_len += entry.rec_len;
                    prev_entry.write_into(&mut buf, prev_at);
                } else {
                    let tomb = RawEntry::tombstone(entry.rec_len);
                    tomb.write_into(&mut buf, at);
                }
                return commit_block(dev, bitmap, dir, idx, buf, txn.as_deref_mut(), now);
            }
            prev = Some(at);
            at += entry.rec_len as usize;
        }
    }
    Err(FsError::NotFound)
}

/// Initializes a freshly allocated directory's first block with `.` and
/// `..`, each sized to its logical record length, `..` extended to the
/// block boundary (§4.F, `original_source/src/mkfs.c`'s `init_inode_table`
/// pattern generalized past the root directory).
pub fn init_new_directory(
    dev: &crate::block::BlockDevice,
    bitmap: &ExtentAllocator,
    dir: &mut DiskInode,
    own_inum: u32,
    parent_inum: u32,
    txn: Option<&mut Transaction>,
    now: u64,
) -> FsResult<()> {
    let mut buf = [0u8; BLOCK_SIZE];
    let dot = RawEntry {
        inum: own_inum,
        rec_len: logical_len(1),
        name_len: 1,
        file_type: EntryType::Directory as u8,
        name: b".".to_vec(),
    };
    dot.write_into(&mut buf, 0);
    let dotdot_at = dot.rec_len as usize;
    let dotdot = RawEntry {
        inum: parent_inum,
        rec_len: BLOCK_SIZE as u16 - dot.rec_len,
        name_len: 2,
        file_type: EntryType::Directory as u8,
        name: b"..".to_vec(),
    };
    dotdot.write_into(&mut buf, dotdot_at);

    let n = inode_write(dev, bitmap, dir, 0, &buf, txn, now)?;
    if n != BLOCK_SIZE {
        return Err(FsError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "short directory init write",
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockDevice;
    use crate::inode::DiskInode;
    use tempfile::NamedTempFile;

    fn make_fixture() -> (NamedTempFile, BlockDevice, ExtentAllocator, DiskInode) {
        let f = NamedTempFile::new().unwrap();
        f.as_file().set_len(4096 * 4096).unwrap();
        let dev = BlockDevice::open(f.path(), false).unwrap();
        let bitmap = ExtentAllocator::new(4000, 0);
        let mut dir = DiskInode::new(FileKind::Directory, 0o755, 1);
        init_new_directory(&dev, &bitmap, &mut dir, 2, 1, None, 1).unwrap();
        (f, dev, bitmap, dir)
    }

    #[test]
    fn fresh_directory_has_dot_and_dotdot() {
        let (_f, dev, bitmap, dir) = make_fixture();
        assert_eq!(lookup(&dev, &bitmap, &dir, ".").unwrap(), 2);
        assert_eq!(lookup(&dev, &bitmap, &dir, "..").unwrap(), 1);
        assert!(is_empty(&dev, &bitmap, &dir).unwrap());
    }

    #[test]
    fn add_then_lookup_roundtrip() {
        let (_f, dev, bitmap, mut dir) = make_fixture();
        add(&dev, &bitmap, &mut dir, "hello.txt", 5, EntryType::File, None, 2).unwrap();
        assert_eq!(lookup(&dev, &bitmap, &dir, "hello.txt").unwrap(), 5);
        assert!(!is_empty(&dev, &bitmap, &dir).unwrap());
    }

    #[test]
    fn duplicate_add_rejected() {
        let (_f, dev, bitmap, mut dir) = make_fixture();
        add(&dev, &bitmap, &mut dir, "a", 5, EntryType::File, None, 2).unwrap();
        assert!(matches!(
            add(&dev, &bitmap, &mut dir, "a", 6, EntryType::File, None, 2),
            Err(FsError::AlreadyExists)
        ));
    }

    #[test]
    fn remove_first_entry_leaves_tombstone_reusable() {
        let (_f, dev, bitmap, mut dir) = make_fixture();
        add(&dev, &bitmap, &mut dir, "a", 5, EntryType::File, None, 2).unwrap();
        remove(&dev, &bitmap, &mut dir, "a", None, 3).unwrap();
        assert!(matches!(
            lookup(&dev, &bitmap, &dir, "a"),
            Err(FsError::NotFound)
        ));
        add(&dev, &bitmap, &mut dir, "b", 6, EntryType::File, None, 3).unwrap();
        assert_eq!(lookup(&dev, &bitmap, &dir, "b").unwrap(), 6);
    }

    #[test]
    fn filling_last_block_triggers_new_block_on_next_add() {
        let (_f, dev, bitmap, mut dir) = make_fixture();
        // Each name below is 8 bytes -> 16-byte records; fill most of one
        // block, forcing the next add to spill into a second block.
        let mut i = 0;
        loop {
            let name = format!("f{i:07}");
            if add(&dev, &bitmap, &mut dir, &name, 100 + i, EntryType::File, None, 2).is_err() {
                break;
            }
            i += 1;
            if i > 400 {
                break;
            }
        }
        assert!(block_count(&dir) >= 2);
    }

    #[test]
    fn iterate_visits_every_live_entry() {
        let (_f, dev, bitmap, mut dir) = make_fixture();
        add(&dev, &bitmap, &mut dir, "x", 10, EntryType::File, None, 2).unwrap();
        add(&dev, &bitmap, &mut dir, "y", 11, EntryType::File, None, 2).unwrap();
        let mut names = Vec::new();
        iterate(&dev, &bitmap, &dir, |name, inum| {
            names.push((name.to_string(), inum));
            true
        })
        .unwrap();
        assert!(names.contains(&(".".to_string(), 2)));
        assert!(names.contains(&("..".to_string(), 1)));
        assert!(names.contains(&("x".to_string(), 10)));
        assert!(names.contains(&("y".to_string(), 11)));
    }
}
