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

//! The superblock: geometry, region layout, and live counters for one
//! image, always resident at block 0.
//!
//! [`Superblock::compute`] derives the whole region layout from a block
//! count alone, so `mkfs` and a fresh mount agree on where every region
//! starts without storing redundant derived fields anywhere else.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::block::BlockDevice;
use crate::error::{FsError, FsResult};
use crate::layout::{
    ceil_div, BITS_PER_BITMAP_BLOCK, BLOCK_SIZE, INODES_PER_BLOCK, INODE_SIZE, ROOT_INUM,
    SUPERBLOCK_MAGIC, SUPERBLOCK_VERSION,
};

/// Filesystem state flags, mirrored from the journal's point of view:
/// `Dirty` means "mounted, journal may hold unreplayed transactions";
/// `Error` is set (and never auto-cleared) when the mount context detects
/// corruption it cannot repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FsState {
    Clean = 0,
    Dirty = 1,
    Error = 2,
}

impl FsState {
    fn from_u32(v: u32) -> FsResult<Self> {
        match v {
            0 => Ok(FsState::Clean),
            1 => Ok(FsState::Dirty),
            2 => Ok(FsState::Error),
            other => Err(FsError::corruption(format!("invalid fs_state {other}"))),
        }
    }
}

/// Lower bound on the number of inodes a freshly formatted image carries,
/// regardless of how small the image is.
const MIN_INODES: u32 = 64;
/// Blocks reserved for metadata when estimating inode count, before the
/// journal's own size is known.
const METADATA_RESERVE: u32 = 100;
/// Journal size bounds, in blocks (1/8 of the image, clamped to [1, 8] MiB).
const JOURNAL_MIN_BLOCKS: u32 = 256;
const JOURNAL_MAX_BLOCKS: u32 = 2048;

/// The on-disk superblock, resident at block 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    pub version: u32,
    pub block_size: u32,
    pub total_blocks: u32,

    pub total_inodes: u32,
    pub inode_bitmap_blocks: u32,
    pub data_bitmap_blocks: u32,
    pub inode_table_blocks: u32,
    pub journal_blocks: u32,

    pub journal_start: u32,
    pub inode_bitmap_start: u32,
    pub data_bitmap_start: u32,
    pub inode_table_start: u32,
    pub data_start: u32,

    pub free_inodes: u32,
    pub first_inode: u32,
    pub data_blocks: u32,
    pub free_blocks: u32,

    pub state: FsState,
    pub mount_time: u64,
    pub write_time: u64,
    pub mount_count: u32,

    pub root_inum: u32,
}

impl Superblock {
    /// Derives a full region layout for an image of `total_blocks` blocks,
    /// following exactly the sizing formulas of the prototype this engine
    /// was distilled from: an inode per 1024 data blocks (min 64), bitmaps
    /// sized at 32768 bits/block, and a journal sized to 1/8 of the image
    /// clamped to [256, 2048] blocks.
    pub fn compute(total_blocks: u32) -> FsResult<Self> {
        if total_blocks <= METADATA_RESERVE {
            return Err(FsError::invalid(format!(
                "image of {total_blocks} blocks is too small to format"
            )));
        }

        let data_blocks_estimate = total_blocks - METADATA_RESERVE;
        let total_inodes = (data_blocks_estimate / 1024).max(MIN_INODES);

        let inode_bitmap_blocks = ceil_div(total_inodes, BITS_PER_BITMAP_BLOCK);
        let inode_table_blocks = ceil_div(total_inodes, INODES_PER_BLOCK as u32);

        let journal_blocks = (total_blocks / 8).clamp(JOURNAL_MIN_BLOCKS, JOURNAL_MAX_BLOCKS);

        // The data bitmap's own size depends on the data block count, which
        // depends on every other region's size including the bitmap itself.
        // Settle it the way the prototype does: an initial estimate that
        // ignores the journal and inode table, then two refinement passes
        // once the journal size is known.
        let initial_estimate = total_blocks - 1 - inode_bitmap_blocks;
        let mut data_bitmap_blocks = ceil_div(initial_estimate, BITS_PER_BITMAP_BLOCK);

        let metadata_blocks =
            1 + journal_blocks + inode_bitmap_blocks + data_bitmap_blocks + inode_table_blocks;
        let data_blocks_estimate2 = total_blocks.saturating_sub(metadata_blocks);
        data_bitmap_blocks = ceil_div(data_blocks_estimate2, BITS_PER_BITMAP_BLOCK);

        let metadata_blocks =
            1 + journal_blocks + inode_bitmap_blocks + data_bitmap_blocks + inode_table_blocks;
        if metadata_blocks >= total_blocks {
            return Err(FsError::invalid(format!(
                "image of {total_blocks} blocks has no room left for data after metadata ({metadata_blocks} blocks)"
            )));
        }
        let data_blocks = total_blocks - metadata_blocks;

        let mut current_block = 1u32;
        let journal_start = current_block;
        current_block += journal_blocks;
        let inode_bitmap_start = current_block;
        current_block += inode_bitmap_blocks;
        let data_bitmap_start = current_block;
        current_block += data_bitmap_blocks;
        let inode_table_start = current_block;
        current_block += inode_table_blocks;
        let data_start = current_block;

        let now = now_secs();

        Ok(Self {
            magic: SUPERBLOCK_MAGIC,
            version: SUPERBLOCK_VERSION,
            block_size: BLOCK_SIZE as u32,
            total_blocks,
            total_inodes,
            inode_bitmap_blocks,
            data_bitmap_blocks,
            inode_table_blocks,
            journal_blocks,
            journal_start,
            inode_bitmap_start,
            data_bitmap_start,
            inode_table_start,
            data_start,
            free_inodes: total_inodes - 1,
            first_inode: 2,
            data_blocks,
            free_blocks: data_blocks - 1,
            state: FsState::Clean,
            mount_time: now,
            write_time: now,
            mount_count: 0,
            root_inum: ROOT_INUM,
        })
    }

    /// Validates magic, version, block size, and root inode number — the
    /// four fields a foreign or corrupted image is most likely to get
    /// wrong, checked before anything else on the image is trusted.
    pub fn validate(&self) -> FsResult<()> {
        if self.magic != SUPERBLOCK_MAGIC {
            return Err(FsError::corruption(format!(
                "bad superblock magic {:#x} (expected {:#x})",
                self.magic, SUPERBLOCK_MAGIC
            )));
        }
        if self.version != SUPERBLOCK_VERSION {
            return Err(FsError::corruption(format!(
                "unsupported superblock version {}",
                self.version
            )));
        }
        if self.block_size != BLOCK_SIZE as u32 {
            return Err(FsError::corruption(format!(
                "superblock block_size {} does not match this build's {BLOCK_SIZE}",
                self.block_size
            )));
        }
        if self.root_inum != ROOT_INUM {
            return Err(FsError::corruption(format!(
                "superblock root_inum {} is not {ROOT_INUM}",
                self.root_inum
            )));
        }
        Ok(())
    }

    /// Serializes into exactly one 4096-byte block, zero-padded.
    pub fn to_block(&self) -> [u8; BLOCK_SIZE] {
        let mut buf = [0u8; BLOCK_SIZE];
        let mut w = Writer(&mut buf, 0);
        w.u32(self.magic);
        w.u32(self.version);
        w.u32(self.block_size);
        w.u32(self.total_blocks);
        w.u32(self.total_inodes);
        w.u32(self.inode_bitmap_blocks);
        w.u32(self.data_bitmap_blocks);
        w.u32(self.inode_table_blocks);
        w.u32(self.journal_blocks);
        w.u32(self.journal_start);
        w.u32(self.inode_bitmap_start);
        w.u32(self.data_bitmap_start);
        w.u32(self.inode_table_start);
        w.u32(self.data_start);
        w.u32(self.free_inodes);
        w.u32(self.first_inode);
        w.u32(self.data_blocks);
        w.u32(self.free_blocks);
        w.u32(self.state as u32);
        w.u64(self.mount_time);
        w.u64(self.write_time);
        w.u32(self.mount_count);
        w.u32(self.root_inum);
        buf
    }

    /// Parses the layout written by [`Superblock::to_block`].
    pub fn from_block(buf: &[u8; BLOCK_SIZE]) -> FsResult<Self> {
        let mut r = Reader(buf, 0);
        let sb = Self {
            magic: r.u32(),
            version: r.u32(),
            block_size: r.u32(),
            total_blocks: r.u32(),
            total_inodes: r.u32(),
            inode_bitmap_blocks: r.u32(),
            data_bitmap_blocks: r.u32(),
            inode_table_blocks: r.u32(),
            journal_blocks: r.u32(),
            journal_start: r.u32(),
            inode_bitmap_start: r.u32(),
            data_bitmap_start: r.u32(),
            inode_table_start: r.u32(),
            data_start: r.u32(),
            free_inodes: r.u32(),
            first_inode: r.u32(),
            data_blocks: r.u32(),
            free_blocks: r.u32(),
            state: FsState::from_u32(r.u32())?,
            mount_time: r.u64(),
            write_time: r.u64(),
            mount_count: r.u32(),
            root_inum: r.u32(),
        };
        Ok(sb)
    }

    /// Reads and validates the superblock from block 0 of `dev`.
    pub fn load(dev: &BlockDevice) -> FsResult<Self> {
        let block = dev.read_block(0)?;
        let sb = Self::from_block(&block)?;
        sb.validate()?;
        Ok(sb)
    }

    /// Writes the superblock to block 0 and forces it out, the only
    /// metadata write this engine makes that is not journaled — the
    /// superblock read path always re-validates before trusting it, so a
    /// torn write here is caught, not acted on.
    pub fn store(&self, dev: &BlockDevice) -> FsResult<()> {
        dev.write_block(0, &self.to_block())?;
        dev.sync()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct Writer<'a>(&'a mut [u8; BLOCK_SIZE], usize);
impl<'a> Writer<'a> {
    fn u32(&mut self, v: u32) {
        self.0[self.1..self.1 + 4].copy_from_slice(&v.to_le_bytes());
        self.1 += 4;
    }
    fn u64(&mut self, v: u64) {
        self.0[self.1..self.1 + 8].copy_from_slice(&v.to_le_bytes());
        self.1 += 8;
    }
}

struct Reader<'a>(&'a [u8; BLOCK_SIZE], usize);
impl<'a> Reader<'a> {
    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.0[self.1..self.1 + 4].try_into().unwrap());
        self.1 += 4;
        v
    }
    fn u64(&mut self) -> u64 {
        let v = u64::from_le_bytes(self.0[self.1..self.1 + 8].try_into().unwrap());
        self.1 += 8;
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_small_image_layout() {
        let sb = Superblock::compute(4096).unwrap();
        assert_eq!(sb.total_inodes, MIN_INODES);
        assert_eq!(sb.journal_start, 1);
        assert!(sb.inode_bitmap_start > sb.journal_start);
        assert!(sb.data_bitmap_start > sb.inode_bitmap_start);
        assert!(sb.inode_table_start > sb.data_bitmap_start);
        assert!(sb.data_start > sb.inode_table_start);
        assert_eq!(sb.free_inodes, sb.total_inodes - 1);
        assert_eq!(sb.free_blocks, sb.data_blocks - 1);
    }

    #[test]
    fn compute_rejects_too_small_image() {
        assert!(Superblock::compute(10).is_err());
    }

    #[test]
    fn roundtrip_through_block_bytes() {
        let sb = Superblock::compute(8192).unwrap();
        let block = sb.to_block();
        let back = Superblock::from_block(&block).unwrap();
        assert_eq!(sb, back);
    }

    #[test]
    fn validate_rejects_bad_magic() {
        let mut sb = Superblock::compute(8192).unwrap();
        sb.magic = 0xDEAD_BEEF;
        assert!(sb.validate().is_err());
    }

    #[test]
    fn journal_size_is_clamped() {
        let huge = Superblock::compute(1_000_000).unwrap();
        assert_eq!(huge.journal_blocks, JOURNAL_MAX_BLOCKS);
        let small = Superblock::compute(3000).unwrap();
        assert_eq!(small.journal_blocks, JOURNAL_MIN_BLOCKS);
    }
}
