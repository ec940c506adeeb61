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

//! Geometry constants shared by every layer of the engine.
//!
//! These are the fixed points of the on-disk format: change one and every
//! existing image becomes unreadable.

/// Size of one block, in bytes. The whole engine assumes this value; it is
/// also recorded in the superblock and journal superblock so a mismatched
/// build refuses to mount a foreign image.
pub const BLOCK_SIZE: usize = 4096;

/// Superblock magic number: ASCII "MODF" read little-endian.
pub const SUPERBLOCK_MAGIC: u32 = 0x4D4F_4446;
/// The only superblock layout version this engine understands.
pub const SUPERBLOCK_VERSION: u32 = 1;

/// Journal superblock magic number: ASCII "JRNL" read little-endian.
pub const JOURNAL_MAGIC: u32 = 0x4A52_4E4C;
/// The only journal layout version this engine understands. Also records
/// the checksum choice: version 1 means CRC32 over payload blocks.
pub const JOURNAL_VERSION: u32 = 1;

/// Inode number of the root directory. Fixed at format time and re-checked
/// on every mount.
pub const ROOT_INUM: u32 = 1;

/// On-disk size of one inode record.
pub const INODE_SIZE: usize = 128;
/// Number of inode records packed into one block.
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

/// Number of direct block pointers carried in a disk inode.
pub const DIRECT_POINTERS: usize = 12;
/// Number of block-pointer slots that fit in one indirect block.
pub const PTRS_PER_BLOCK: usize = BLOCK_SIZE / 4;

/// One past the highest logical block index representable by the
/// direct/indirect/double-indirect map.
pub const MAX_LOGICAL_BLOCKS: u64 =
    (DIRECT_POINTERS + PTRS_PER_BLOCK + PTRS_PER_BLOCK * PTRS_PER_BLOCK) as u64;

/// Number of bits (blocks or inodes) one 4 KiB bitmap block can index.
pub const BITS_PER_BITMAP_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;

/// Maximum length of one path component, in bytes.
pub const NAME_MAX: usize = 255;
/// Directory records are packed on this byte boundary.
pub const DIRENT_ALIGN: usize = 8;

/// Fixed header size of one directory record, before the name bytes:
/// `inum(4) + rec_len(2) + name_len(1) + file_type(1)`.
pub const DIRENT_HEADER_LEN: usize = 8;

/// Interval, in seconds, between unsolicited background checkpoints.
pub const CHECKPOINT_INTERVAL_SECS: u64 = 30;

/// Returns `ceil(a / b)` for unsigned integers.
pub const fn ceil_div(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}
