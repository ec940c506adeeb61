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

//! The image formatter backing `mkfs.modernfs` (§6): zeroes metadata
//! regions, installs the superblock and journal superblock, and writes
//! the root directory's first block.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::dir;
use crate::error::{FsError, FsResult};
use crate::inode::{DiskInode, FileKind};
use crate::journal::Journal;
use crate::layout::BLOCK_SIZE;
use crate::superblock::Superblock;

/// Smallest and largest image sizes `mkfs.modernfs` accepts, in MiB (§6).
pub const MIN_SIZE_MIB: u64 = 1;
pub const MAX_SIZE_MIB: u64 = 16384;

/// Formats a fresh image of `size_mib` MiB at `path`, creating the file if
/// it does not exist and truncating it to the exact required length.
pub fn format_image(path: impl AsRef<Path>, size_mib: u64) -> FsResult<()> {
    if !(MIN_SIZE_MIB..=MAX_SIZE_MIB).contains(&size_mib) {
        return Err(FsError::invalid(format!(
            "image size {size_mib} MiB out of range [{MIN_SIZE_MIB}, {MAX_SIZE_MIB}]"
        )));
    }
    let total_bytes = size_mib * 1024 * 1024;
    let total_blocks = (total_bytes / BLOCK_SIZE as u64) as u32;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(total_bytes)?;

    let sb = Superblock::compute(total_blocks)?;
    zero_region(&file, 1, sb.journal_start - 1)?; // nothing before the journal besides block 0
    Journal::format(&file, sb.journal_start, sb.journal_blocks)?;
    zero_region(&file, sb.inode_bitmap_start, sb.inode_bitmap_blocks)?;
    zero_region(&file, sb.data_bitmap_start, sb.data_bitmap_blocks)?;
    zero_region(&file, sb.inode_table_start, sb.inode_table_blocks)?;

    mark_inode_bit_used(&file, sb.inode_bitmap_start, 0)?; // root inode, bit 0
    mark_data_bit_used(&file, sb.data_bitmap_start, 0)?; // root's one data block

    write_root_inode(&file, &sb)?;
    write_root_directory_block(&file, &sb)?;

    sb.store(&file)?;
    file.sync_all()?;
    Ok(())
}

fn zero_region(file: &File, start: u32, count: u32) -> FsResult<()> {
    let zero = [0u8; BLOCK_SIZE];
    for i in 0..count {
        file.write_all_at(&zero, (start + i) as u64 * BLOCK_SIZE as u64)?;
    }
    Ok(())
}

fn mark_inode_bit_used(file: &File, bitmap_start: u32, bit: u32) -> FsResult<()> {
    set_bit(file, bitmap_start, bit)
}

fn mark_data_bit_used(file: &File, bitmap_start: u32, bit: u32) -> FsResult<()> {
    set_bit(file, bitmap_start, bit)
}

fn set_bit(file: &File, bitmap_start: u32, bit: u32) -> FsResult<()> {
    let block = bitmap_start + bit / (BLOCK_SIZE as u32 * 8);
    let byte_in_block = (bit / 8) % BLOCK_SIZE as u32;
    let mut buf = [0u8; BLOCK_SIZE];
    let offset = block as u64 * BLOCK_SIZE as u64;
    file.read_exact_at(&mut buf, offset)?;
    buf[byte_in_block as usize] |= 1 << (bit % 8);
    file.write_all_at(&buf, offset)?;
    Ok(())
}

/// Initializes inode 1 (root): `mode = 0o755`, `nlink = 2`, one data
/// block at `data_start`, matching `original_source/src/mkfs.c`'s
/// `init_inode_table`.
fn write_root_inode(file: &File, sb: &Superblock) -> FsResult<()> {
    let now = now_secs();
    let mut root = DiskInode::new(FileKind::Directory, 0o755, now);
    root.nlink = 2;
    root.size = BLOCK_SIZE as u64;
    root.blocks = 1;
    root.direct[0] = sb.data_start;

    let record = root.to_bytes();
    let mut buf = [0u8; BLOCK_SIZE];
    buf[..record.len()].copy_from_slice(&record);
    file.write_all_at(&buf, sb.inode_table_start as u64 * BLOCK_SIZE as u64)?;
    Ok(())
}

fn write_root_directory_block(file: &File, sb: &Superblock) -> FsResult<()> {
    // Root is its own parent, matching `.`/`..` both pointing at inode 1.
    let mut buf = [0u8; BLOCK_SIZE];
    write_dot_entries(&mut buf, sb.root_inum, sb.root_inum);
    file.write_all_at(&buf, sb.data_start as u64 * BLOCK_SIZE as u64)?;
    Ok(())
}

/// Writes `.`/`..` into a freshly zeroed block buffer, mirroring
/// [`dir::init_new_directory`]'s on-disk layout without requiring a live
/// `BlockDevice` (mkfs writes directly to the raw file before any layer
/// above the block device exists).
fn write_dot_entries(buf: &mut [u8; BLOCK_SIZE], own_inum: u32, parent_inum: u32) {
    use crate::layout::DIRENT_ALIGN;
    let align8 = |n: usize| (n + DIRENT_ALIGN - 1) & !(DIRENT_ALIGN - 1);
    let dot_len = align8(8 + 1) as u16;
    buf[0..4].copy_from_slice(&own_inum.to_le_bytes());
    buf[4..6].copy_from_slice(&dot_len.to_le_bytes());
    buf[6] = 1;
    buf[7] = dir::EntryType::Directory as u8;
    buf[8] = b'.';

    let dotdot_at = dot_len as usize;
    let dotdot_len = BLOCK_SIZE as u16 - dot_len;
    buf[dotdot_at..dotdot_at + 4].copy_from_slice(&parent_inum.to_le_bytes());
    buf[dotdot_at + 4..dotdot_at + 6].copy_from_slice(&dotdot_len.to_le_bytes());
    buf[dotdot_at + 6] = 2;
    buf[dotdot_at + 7] = dir::EntryType::Directory as u8;
    buf[dotdot_at + 8] = b'.';
    buf[dotdot_at + 9] = b'.';
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockDevice;
    use tempfile::NamedTempFile;

    #[test]
    fn format_rejects_out_of_range_size() {
        let f = NamedTempFile::new().unwrap();
        assert!(format_image(f.path(), 0).is_err());
        assert!(format_image(f.path(), MAX_SIZE_MIB + 1).is_err());
    }

    #[test]
    fn format_produces_mountable_superblock_and_root() {
        let f = NamedTempFile::new().unwrap();
        format_image(f.path(), 16).unwrap();

        let dev = BlockDevice::open(f.path(), false).unwrap();
        let sb = Superblock::load(&dev).unwrap();
        assert_eq!(sb.root_inum, 1);
        assert!(sb.free_inodes < sb.total_inodes);
        assert!(sb.free_blocks < sb.data_blocks);
    }
}
