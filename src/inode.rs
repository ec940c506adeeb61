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

//! Disk inodes, the in-memory inode cache, and the block map: §4.E.
//!
//! A disk inode is a fixed 128-byte record; 32 of them pack into one 4 KiB
//! inode-table block. The in-memory cache wraps each resident inode in a
//! [`std::sync::Mutex`] (§9's note on splitting metadata/payload locks: we
//! keep the single-mutex form the teacher uses, since this engine has no
//! hot concurrent-readers path to justify the split) and evicts by plain
//! LRU once a slot's refcount drops to zero.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::alloc::ExtentAllocator;
use crate::block::BlockDevice;
use crate::error::{FsError, FsResult};
use crate::journal::Transaction;
use crate::layout::{
    BLOCK_SIZE, DIRECT_POINTERS, INODES_PER_BLOCK, INODE_SIZE, MAX_LOGICAL_BLOCKS, PTRS_PER_BLOCK,
};

/// The three object kinds a disk inode can name (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileKind {
    File = 1,
    Directory = 2,
    Symlink = 3,
}

impl FileKind {
    fn from_u8(v: u8) -> FsResult<Self> {
        match v {
            1 => Ok(FileKind::File),
            2 => Ok(FileKind::Directory),
            3 => Ok(FileKind::Symlink),
            other => Err(FsError::corruption(format!("invalid inode type {other}"))),
        }
    }
}

/// The fixed 128-byte on-disk inode record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInode {
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
    pub direct: [u32; DIRECT_POINTERS],
    pub indirect: u32,
    pub double_indirect: u32,
}

impl DiskInode {
    pub fn new(kind: FileKind, mode: u32, now: u64) -> Self {
        Self {
            kind,
            mode,
            uid: 0,
            gid: 0,
            nlink: 1,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            direct: [0; DIRECT_POINTERS],
            indirect: 0,
            double_indirect: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; INODE_SIZE] {
        let mut buf = [0u8; INODE_SIZE];
        buf[0] = self.kind as u8;
        buf[4..8].copy_from_slice(&self.mode.to_le_bytes());
        buf[8..12].copy_from_slice(&self.uid.to_le_bytes());
        buf[12..16].copy_from_slice(&self.gid.to_le_bytes());
        buf[16..20].copy_from_slice(&self.nlink.to_le_bytes());
        buf[20..28].copy_from_slice(&self.size.to_le_bytes());
        buf[28..32].copy_from_slice(&self.blocks.to_le_bytes());
        buf[32..40].copy_from_slice(&self.atime.to_le_bytes());
        buf[40..48].copy_from_slice(&self.mtime.to_le_bytes());
        buf[48..56].copy_from_slice(&self.ctime.to_le_bytes());
        let mut off = 56;
        for p in &self.direct {
            buf[off..off + 4].copy_from_slice(&p.to_le_bytes());
            off += 4;
        }
        buf[off..off + 4].copy_from_slice(&self.indirect.to_le_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.double_indirect.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; INODE_SIZE]) -> FsResult<Self> {
        let kind = FileKind::from_u8(buf[0])?;
        let mode = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let uid = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let gid = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let nlink = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let size = u64::from_le_bytes(buf[20..28].try_into().unwrap());
        let blocks = u32::from_le_bytes(buf[28..32].try_into().unwrap());
        let atime = u64::from_le_bytes(buf[32..40].try_into().unwrap());
        let mtime = u64::from_le_bytes(buf[40..48].try_into().unwrap());
        let ctime = u64::from_le_bytes(buf[48..56].try_into().unwrap());
        let mut direct = [0u32; DIRECT_POINTERS];
        let mut off = 56;
        for p in &mut direct {
            *p = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
        }
        let indirect = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let double_indirect = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        Ok(Self {
            kind,
            mode,
            uid,
            gid,
            nlink,
            size,
            blocks,
            atime,
            mtime,
            ctime,
            direct,
            indirect,
            double_indirect,
        })
    }
}

/// Where one inode's 128-byte record lives: which inode-table block, and
/// which of the 32 slots within it.
fn inode_location(inum: u32, inode_table_start: u32) -> (u32, usize) {
    let idx = (inum - 1) as usize; // inode 0 is reserved, table starts at 1
    let block = inode_table_start + (idx / INODES_PER_BLOCK) as u32;
    let slot = (idx % INODES_PER_BLOCK) * INODE_SIZE;
    (block, slot)
}

/// One resident inode: the disk record plus cache bookkeeping. Held behind
/// an `Arc<InodeHandle>` so callers can keep a reference across a `get`
/// without holding the cache's structural lock.
pub struct InodeHandle {
    pub inum: u32,
    inner: Mutex<DiskInode>,
    dirty: std::sync::atomic::AtomicBool,
}

impl InodeHandle {
    pub fn lock(&self) -> MutexGuard<'_, DiskInode> {
        self.inner.lock().unwrap()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn clear_dirty(&self) {
        self.dirty.store(false, std::sync::atomic::Ordering::Relaxed);
    }
}

struct Slot {
    handle: Arc<InodeHandle>,
    refcount: u32,
}

/// Fixed-size pool of resident inodes, hashed by inode number with plain
/// LRU eviction of refcount-0 entries (§4.E).
struct Pool {
    slots: HashMap<u32, Slot>,
    lru: VecDeque<u32>,
    capacity: usize,
}

/// The inode layer: inode-table I/O, the in-memory pool, the inode bitmap,
/// and the block map.
pub struct InodeCache {
    dev: Arc<BlockDevice>,
    inode_table_start: u32,
    total_inodes: u32,
    bitmap: Mutex<ExtentAllocator>,
    pool: Mutex<Pool>,
}

impl InodeCache {
    pub fn new(
        dev: Arc<BlockDevice>,
        inode_table_start: u32,
        total_inodes: u32,
        bitmap: ExtentAllocator,
        capacity: usize,
    ) -> Self {
        Self {
            dev,
            inode_table_start,
            total_inodes,
            bitmap: Mutex::new(bitmap),
            pool: Mutex::new(Pool {
                slots: HashMap::new(),
                lru: VecDeque::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    fn read_disk_inode(&self, inum: u32) -> FsResult<DiskInode> {
        let (block, slot) = inode_location(inum, self.inode_table_start);
        let buf = self.dev.read_block(block)?;
        let record: [u8; INODE_SIZE] = buf[slot..slot + INODE_SIZE].try_into().unwrap();
        DiskInode::from_bytes(&record)
    }

    fn write_disk_inode(&self, inum: u32, inode: &DiskInode) -> FsResult<()> {
        let (block, slot) = inode_location(inum, self.inode_table_start);
        let mut buf = self.dev.read_block(block)?;
        buf[slot..slot + INODE_SIZE].copy_from_slice(&inode.to_bytes());
        self.dev.write_block(block, &buf)
    }

    fn evict_one(&self, pool: &mut Pool) -> FsResult<bool> {
        if let Some(pos) = pool
            .lru
            .iter()
            .position(|inum| pool.slots.get(inum).map(|s| s.refcount == 0).unwrap_or(false))
        {
            let inum = pool.lru.remove(pos).unwrap();
            if let Some(slot) = pool.slots.remove(&inum) {
                if slot.handle.is_dirty() {
                    self.write_disk_inode(inum, &slot.handle.lock())?;
                }
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Returns a handle to inode `inum`, incrementing its refcount.
    /// Reads the disk record on a cache miss, evicting the LRU tail with
    /// refcount 0 to make room if the pool is full.
    pub fn get(&self, inum: u32) -> FsResult<Arc<InodeHandle>> {
        if inum == 0 || inum > self.total_inodes {
            return Err(FsError::invalid(format!("inode number {inum} out of range")));
        }
        let mut pool = self.pool.lock().unwrap();
        if let Some(slot) = pool.slots.get_mut(&inum) {
            slot.refcount += 1;
            if let Some(pos) = pool.lru.iter().position(|i| *i == inum) {
                pool.lru.remove(pos);
            }
            pool.lru.push_back(inum);
            return Ok(slot.handle.clone());
        }
        if pool.slots.len() >= pool.capacity && !self.evict_one(&mut pool)? {
            return Err(FsError::invalid("inode cache exhausted: all entries pinned"));
        }
        let disk = self.read_disk_inode(inum)?;
        let handle = Arc::new(InodeHandle {
            inum,
            inner: Mutex::new(disk),
            dirty: std::sync::atomic::AtomicBool::new(false),
        });
        pool.slots.insert(
            inum,
            Slot {
                handle: handle.clone(),
                refcount: 1,
            },
        );
        pool.lru.push_back(inum);
        Ok(handle)
    }

    /// Decrements `inum`'s refcount. Does not evict immediately; eviction
    /// happens lazily the next time the pool needs a slot.
    pub fn put(&self, inum: u32) {
        let mut pool = self.pool.lock().unwrap();
        if let Some(slot) = pool.slots.get_mut(&inum) {
            slot.refcount = slot.refcount.saturating_sub(1);
        }
    }

    /// Writes `handle` back immediately if dirty, clearing the flag.
    /// Callers drive this before a transaction's checkpoint (§4.E).
    pub fn write_back(&self, handle: &InodeHandle) -> FsResult<()> {
        if handle.is_dirty() {
            self.write_disk_inode(handle.inum, &handle.lock())?;
            handle.clear_dirty();
        }
        Ok(())
    }

    /// Writes back every dirty resident inode.
    pub fn sync_all(&self) -> FsResult<()> {
        let pool = self.pool.lock().unwrap();
        for slot in pool.slots.values() {
            self.write_back(&slot.handle)?;
        }
        Ok(())
    }

    /// Allocates a fresh inode of `kind`, synchronously writing its
    /// initial record so no other thread can race to a garbage slot.
    pub fn alloc(&self, kind: FileKind, mode: u32, now: u64) -> FsResult<u32> {
        let inum = {
            let bitmap = self.bitmap.lock().unwrap();
            bitmap.alloc_one()? + 1 // bitmap bit 0 == inode number 1
        };
        let disk = DiskInode::new(kind, mode, now);
        self.write_disk_inode(inum, &disk)?;
        Ok(inum)
    }

    /// Releases `handle`: truncates its data to zero length (releasing
    /// every direct/indirect/double-indirect block it owns) and then
    /// clears its inode-bitmap bit. Also drops the pool slot for this
    /// inode number outright, rather than leaving it for lazy LRU
    /// eviction: the bit is about to be handed to a future `alloc`, and a
    /// stale cached slot would shadow that fresh disk record on its next
    /// `get`.
    pub fn free(&self, data_bitmap: &ExtentAllocator, handle: &InodeHandle, now: u64) -> FsResult<()> {
        {
            let mut disk = handle.lock();
            inode_truncate(&self.dev, data_bitmap, &mut disk, 0, now)?;
        }
        handle.clear_dirty();
        {
            let bitmap = self.bitmap.lock().unwrap();
            bitmap.free_one(handle.inum - 1)?;
        }
        let mut pool = self.pool.lock().unwrap();
        pool.slots.remove(&handle.inum);
        if let Some(pos) = pool.lru.iter().position(|i| *i == handle.inum) {
            pool.lru.remove(pos);
        }
        Ok(())
    }

    pub fn stats(&self) -> (u32, u32) {
        let bitmap = self.bitmap.lock().unwrap();
        let (total, free, _) = bitmap.stats();
        (total, free)
    }

    pub fn sync_bitmap(&self, bitmap_start: u32, block_count: u32) -> FsResult<()> {
        self.bitmap.lock().unwrap().sync(&self.dev, bitmap_start, block_count)
    }
}

/// Translates a logical block index to the slot that holds its pointer.
enum Slot3 {
    Direct(usize),
    Indirect(usize),
    DoubleIndirect(usize, usize),
}

fn locate(logical: u64) -> FsResult<Slot3> {
    let direct = DIRECT_POINTERS as u64;
    let p = PTRS_PER_BLOCK as u64;
    if logical >= MAX_LOGICAL_BLOCKS {
        return Err(FsError::invalid(format!(
            "logical block {logical} exceeds block-map capacity {MAX_LOGICAL_BLOCKS}"
        )));
    }
    if logical < direct {
        return Ok(Slot3::Direct(logical as usize));
    }
    let logical = logical - direct;
    if logical < p {
        return Ok(Slot3::Indirect(logical as usize));
    }
    let logical = logical - p;
    Ok(Slot3::DoubleIndirect((logical / p) as usize, (logical % p) as usize))
}

fn read_ptr_block(dev: &BlockDevice, block: u32, slot: usize) -> FsResult<u32> {
    let buf = dev.read_block(block)?;
    let off = slot * 4;
    Ok(u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()))
}

fn write_ptr_block(dev: &BlockDevice, block: u32, slot: usize, value: u32) -> FsResult<()> {
    let mut buf = dev.read_block(block)?;
    let off = slot * 4;
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
    dev.write_block(block, &buf)
}

/// Translates a logical file block index to a physical block number
/// (§4.E's table). A zero slot is a hole. When `alloc` is `Some`, missing
/// indirect/double-indirect metablocks and the leaf itself are lazily
/// created (zero-filled first), and `inode.blocks`/dirty are updated for
/// every newly allocated block.
pub fn bmap(
    dev: &BlockDevice,
    bitmap: &ExtentAllocator,
    inode: &mut DiskInode,
    logical: u64,
    alloc: Option<u32>,
) -> FsResult<u32> {
    let slot = locate(logical)?;
    match slot {
        Slot3::Direct(i) => {
            if inode.direct[i] == 0 {
                if let Some(hint) = alloc {
                    let b = bitmap.alloc_one_hinted(hint)?;
                    zero_block(dev, b)?;
                    inode.direct[i] = b;
                    inode.blocks += 1;
                } else {
                    return Ok(0);
                }
            }
            Ok(inode.direct[i])
        }
        Slot3::Indirect(i) => {
            if inode.indirect == 0 {
                let Some(hint) = alloc else { return Ok(0) };
                let b = bitmap.alloc_one_hinted(hint)?;
                zero_block(dev, b)?;
                inode.indirect = b;
                inode.blocks += 1;
            }
            let leaf = read_ptr_block(dev, inode.indirect, i)?;
            if leaf == 0 {
                let Some(hint) = alloc else { return Ok(0) };
                let b = bitmap.alloc_one_hinted(hint)?;
                zero_block(dev, b)?;
                write_ptr_block(dev, inode.indirect, i, b)?;
                inode.blocks += 1;
                return Ok(b);
            }
            Ok(leaf)
        }
        Slot3::DoubleIndirect(i, j) => {
            if inode.double_indirect == 0 {
                let Some(hint) = alloc else { return Ok(0) };
                let b = bitmap.alloc_one_hinted(hint)?;
                zero_block(dev, b)?;
                inode.double_indirect = b;
                inode.blocks += 1;
            }
            let mid = read_ptr_block(dev, inode.double_indirect, i)?;
            let mid = if mid == 0 {
                let Some(hint) = alloc else { return Ok(0) };
                let b = bitmap.alloc_one_hinted(hint)?;
                zero_block(dev, b)?;
                write_ptr_block(dev, inode.double_indirect, i, b)?;
                inode.blocks += 1;
                b
            } else {
                mid
            };
            let leaf = read_ptr_block(dev, mid, j)?;
            if leaf == 0 {
                let Some(hint) = alloc else { return Ok(0) };
                let b = bitmap.alloc_one_hinted(hint)?;
                zero_block(dev, b)?;
                write_ptr_block(dev, mid, j, b)?;
                inode.blocks += 1;
                return Ok(b);
            }
            Ok(leaf)
        }
    }
}

fn zero_block(dev: &BlockDevice, block: u32) -> FsResult<()> {
    dev.write_block(block, &[0u8; BLOCK_SIZE])
}

/// Reads up to `buf.len()` bytes starting at `offset`. Holes read as
/// zeros without I/O; the read clips to `inode.size` and never errors on
/// EOF — a short (possibly zero-length) read signals it. Does not update
/// `atime`; the caller does, since that requires marking the inode dirty.
pub fn inode_read(
    dev: &BlockDevice,
    bitmap: &ExtentAllocator,
    inode: &DiskInode,
    offset: u64,
    buf: &mut [u8],
) -> FsResult<usize> {
    if offset >= inode.size {
        return Ok(0);
    }
    let end = (offset + buf.len() as u64).min(inode.size);
    let mut pos = offset;
    let mut written = 0usize;
    // bmap() takes &mut DiskInode for the allocating path; reads never
    // allocate, so clone the handful of fields it needs to mutate.
    let mut scratch = inode.clone();
    while pos < end {
        let logical = pos / BLOCK_SIZE as u64;
        let block_off = (pos % BLOCK_SIZE as u64) as usize;
        let chunk = ((end - pos) as usize).min(BLOCK_SIZE - block_off);
        let phys = bmap(dev, bitmap, &mut scratch, logical, None)?;
        if phys == 0 {
            buf[written..written + chunk].fill(0);
        } else {
            let block = dev.read_block(phys)?;
            buf[written..written + chunk].copy_from_slice(&block[block_off..block_off + chunk]);
        }
        pos += chunk as u64;
        written += chunk;
    }
    Ok(written)
}

/// Writes `data` at `offset`, allocating as it goes, read-modify-writing
/// partial blocks, and extending `inode.size` on append. When `txn` is
/// given, every completed 4 KiB payload is funneled into it instead of
/// going straight to the cache (the caller commits); otherwise writes go
/// straight through `dev`. Bumps `mtime` and dirties the inode (the
/// caller must still call [`InodeCache::write_back`]).
pub fn inode_write(
    dev: &BlockDevice,
    bitmap: &ExtentAllocator,
    inode: &mut DiskInode,
    offset: u64,
    data: &[u8],
    txn: Option<&mut Transaction>,
    now: u64,
) -> FsResult<usize> {
    let mut pos = offset;
    let end = offset + data.len() as u64;
    let mut written = 0usize;
    let mut txn = txn;
    while pos < end {
        let logical = pos / BLOCK_SIZE as u64;
        let block_off = (pos % BLOCK_SIZE as u64) as usize;
        let chunk = ((end - pos) as usize).min(BLOCK_SIZE - block_off);
        let phys = match bmap(dev, bitmap, inode, logical, Some(logical as u32)) {
            Ok(phys) => phys,
            // Out of space partway through: stop here and report the
            // prefix actually written rather than discarding it via `?`.
            Err(FsError::NoSpace) => break,
            Err(e) => return Err(e),
        };

        let mut block = if chunk == BLOCK_SIZE {
            [0u8; BLOCK_SIZE]
        } else {
            dev.read_block(phys)?
        };
        block[block_off..block_off + chunk].copy_from_slice(&data[written..written + chunk]);

        match txn.as_deref_mut() {
            Some(t) => t.write(phys, &block),
            None => dev.write_block(phys, &block)?,
        }

        pos += chunk as u64;
        written += chunk;
    }
    if pos > inode.size {
        inode.size = pos;
    }
    if written > 0 {
        inode.mtime = now;
    }
    Ok(written)
}

/// Shrinks or extends `inode` to `new_size`. Growing only updates `size`
/// (lazy allocation materializes blocks on the next write); shrinking
/// walks released logical blocks high to low, freeing each non-zero leaf
/// and metablock once it empties out.
pub fn inode_truncate(
    dev: &BlockDevice,
    bitmap: &ExtentAllocator,
    inode: &mut DiskInode,
    new_size: u64,
    now: u64,
) -> FsResult<()> {
    if new_size >= inode.size {
        inode.size = new_size;
        inode.mtime = now;
        return Ok(());
    }

    let old_blocks = (inode.size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64;
    let new_blocks = (new_size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64;

    for logical in (new_blocks..old_blocks).rev() {
        free_logical(dev, bitmap, inode, logical)?;
    }

    // Drop indirect/double-indirect metablocks once their range is
    // entirely within the truncated-away region.
    let direct = DIRECT_POINTERS as u64;
    let p = PTRS_PER_BLOCK as u64;
    if new_blocks <= direct && inode.indirect != 0 {
        bitmap.free_one(inode.indirect)?;
        inode.indirect = 0;
        inode.blocks = inode.blocks.saturating_sub(1);
    }
    if new_blocks <= direct + p && inode.double_indirect != 0 {
        let mid_count = p as usize;
        for i in 0..mid_count {
            let mid = read_ptr_block(dev, inode.double_indirect, i).unwrap_or(0);
            if mid != 0 {
                bitmap.free_one(mid)?;
                inode.blocks = inode.blocks.saturating_sub(1);
            }
        }
        bitmap.free_one(inode.double_indirect)?;
        inode.double_indirect = 0;
        inode.blocks = inode.blocks.saturating_sub(1);
    }

    inode.size = new_size;
    inode.mtime = now;
    Ok(())
}

fn free_logical(
    dev: &BlockDevice,
    bitmap: &ExtentAllocator,
    inode: &mut DiskInode,
    logical: u64,
) -> FsResult<()> {
    let slot = locate(logical)?;
    match slot {
        Slot3::Direct(i) => {
            if inode.direct[i] != 0 {
                bitmap.free_one(inode.direct[i])?;
                inode.direct[i] = 0;
                inode.blocks = inode.blocks.saturating_sub(1);
            }
        }
        Slot3::Indirect(i) => {
            if inode.indirect != 0 {
                let leaf = read_ptr_block(dev, inode.indirect, i)?;
                if leaf != 0 {
                    bitmap.free_one(leaf)?;
                    write_ptr_block(dev, inode.indirect, i, 0)?;
                    inode.blocks = inode.blocks.saturating_sub(1);
                }
            }
        }
        Slot3::DoubleIndirect(i, j) => {
            if inode.double_indirect != 0 {
                let mid = read_ptr_block(dev, inode.double_indirect, i)?;
                if mid != 0 {
                    let leaf = read_ptr_block(dev, mid, j)?;
                    if leaf != 0 {
                        bitmap.free_one(leaf)?;
                        write_ptr_block(dev, mid, j, 0)?;
                        inode.blocks = inode.blocks.saturating_sub(1);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Extension trait so `bmap`'s allocation sites can pass a logical index
/// as an allocation hint without every caller plumbing the allocator's
/// single-block API by hand.
trait HintedAlloc {
    fn alloc_one_hinted(&self, hint: u32) -> FsResult<u32>;
}

impl HintedAlloc for ExtentAllocator {
    fn alloc_one_hinted(&self, hint: u32) -> FsResult<u32> {
        self.alloc(hint, 1, 1).map(|e| e.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn make_dev(blocks: u32) -> (NamedTempFile, BlockDevice) {
        let f = NamedTempFile::new().unwrap();
        f.as_file().set_len(blocks as u64 * BLOCK_SIZE as u64).unwrap();
        let dev = BlockDevice::open(f.path(), false).unwrap();
        (f, dev)
    }

    #[test]
    fn disk_inode_roundtrips_through_bytes() {
        let mut inode = DiskInode::new(FileKind::File, 0o644, 1000);
        inode.direct[0] = 42;
        inode.size = 123;
        let bytes = inode.to_bytes();
        let back = DiskInode::from_bytes(&bytes).unwrap();
        assert_eq!(inode, back);
    }

    #[test]
    fn bmap_allocates_direct_block_lazily() {
        let (_f, dev) = make_dev(64);
        let bitmap = ExtentAllocator::new(32, 0);
        let mut inode = DiskInode::new(FileKind::File, 0o644, 0);
        let b = bmap(&dev, &bitmap, &mut inode, 0, Some(0)).unwrap();
        assert_ne!(b, 0);
        assert_eq!(inode.blocks, 1);
        assert_eq!(inode.direct[0], b);
    }

    #[test]
    fn bmap_returns_hole_without_alloc() {
        let (_f, dev) = make_dev(64);
        let bitmap = ExtentAllocator::new(32, 0);
        let mut inode = DiskInode::new(FileKind::File, 0o644, 0);
        assert_eq!(bmap(&dev, &bitmap, &mut inode, 0, None).unwrap(), 0);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (_f, dev) = make_dev(4096);
        let bitmap = ExtentAllocator::new(4000, 0);
        let mut inode = DiskInode::new(FileKind::File, 0o644, 0);
        let payload = b"Hello, ModernFS!";
        let n = inode_write(&dev, &bitmap, &mut inode, 0, payload, None, 1).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(inode.size, payload.len() as u64);

        let mut out = vec![0u8; payload.len()];
        let r = inode_read(&dev, &bitmap, &inode, 0, &mut out).unwrap();
        assert_eq!(r, payload.len());
        assert_eq!(&out, payload);
    }

    #[test]
    fn twelve_direct_blocks_no_indirect() {
        let (_f, dev) = make_dev(4096);
        let bitmap = ExtentAllocator::new(4000, 0);
        let mut inode = DiskInode::new(FileKind::File, 0o644, 0);
        let data = vec![0xAAu8; BLOCK_SIZE * DIRECT_POINTERS];
        inode_write(&dev, &bitmap, &mut inode, 0, &data, None, 1).unwrap();
        assert_eq!(inode.blocks, DIRECT_POINTERS as u32);
        assert_eq!(inode.indirect, 0);
    }

    #[test]
    fn crossing_into_indirect_allocates_metablock() {
        let (_f, dev) = make_dev(8192);
        let bitmap = ExtentAllocator::new(8000, 0);
        let mut inode = DiskInode::new(FileKind::File, 0o644, 0);
        let data = vec![0xBBu8; BLOCK_SIZE * (DIRECT_POINTERS + 1)];
        inode_write(&dev, &bitmap, &mut inode, 0, &data, None, 1).unwrap();
        assert_ne!(inode.indirect, 0);
        assert_eq!(inode.double_indirect, 0);
        assert_eq!(inode.blocks, (DIRECT_POINTERS + 2) as u32); // 13 leaves + 1 indirect metablock
    }

    #[test]
    fn truncate_to_zero_frees_all_blocks() {
        let (_f, dev) = make_dev(4096);
        let bitmap = ExtentAllocator::new(4000, 0);
        let mut inode = DiskInode::new(FileKind::File, 0o644, 0);
        let data = vec![0xCCu8; BLOCK_SIZE * 3];
        inode_write(&dev, &bitmap, &mut inode, 0, &data, None, 1).unwrap();
        let free_before = bitmap.free_count();
        inode_truncate(&dev, &bitmap, &mut inode, 0, 2).unwrap();
        assert_eq!(inode.size, 0);
        assert_eq!(inode.blocks, 0);
        assert!(bitmap.free_count() > free_before);
    }

    #[test]
    fn truncate_then_read_past_end_is_eof() {
        let (_f, dev) = make_dev(4096);
        let bitmap = ExtentAllocator::new(4000, 0);
        let mut inode = DiskInode::new(FileKind::File, 0o644, 0);
        let data = vec![1u8; 100];
        inode_write(&dev, &bitmap, &mut inode, 0, &data, None, 1).unwrap();
        inode_truncate(&dev, &bitmap, &mut inode, 50, 2).unwrap();
        let mut out = [0u8; 10];
        assert_eq!(inode_read(&dev, &bitmap, &inode, 50, &mut out).unwrap(), 0);
        let mut out2 = [0u8; 10];
        assert_eq!(inode_read(&dev, &bitmap, &inode, 0, &mut out2).unwrap(), 10);
        assert_eq!(&out2, &data[..10]);
    }

    #[test]
    fn inode_cache_get_put_refcounts_and_alloc() {
        let (_f, dev) = make_dev(4096);
        let dev = Arc::new(dev);
        let bitmap = ExtentAllocator::new(64, 0);
        let cache = InodeCache::new(dev, 2000, 64, bitmap, 8);
        let inum = cache.alloc(FileKind::File, 0o644, 1).unwrap();
        let h = cache.get(inum).unwrap();
        assert_eq!(h.lock().kind, FileKind::File);
        cache.put(inum);
    }

    #[test]
    fn offset_beyond_capacity_is_invalid_argument() {
        let (_f, dev) = make_dev(64);
        let bitmap = ExtentAllocator::new(32, 0);
        let mut inode = DiskInode::new(FileKind::File, 0o644, 0);
        let res = bmap(&dev, &bitmap, &mut inode, MAX_LOGICAL_BLOCKS, Some(0));
        assert!(matches!(res, Err(FsError::InvalidArgument(_))));
    }

    #[test]
    fn write_running_out_of_space_returns_short_count_not_error() {
        let (_f, dev) = make_dev(64);
        // Only 3 data blocks available once the reserved leading bits are
        // skipped; a 5-block write must land just the first 3 and report
        // that prefix instead of failing outright.
        let bitmap = ExtentAllocator::new(3, 0);
        let mut inode = DiskInode::new(FileKind::File, 0o644, 0);
        let data = vec![0x7Eu8; BLOCK_SIZE * 5];
        let n = inode_write(&dev, &bitmap, &mut inode, 0, &data, None, 1).unwrap();
        assert_eq!(n, BLOCK_SIZE * 3);
        assert_eq!(inode.size, (BLOCK_SIZE * 3) as u64);
        assert_eq!(inode.blocks, 3);

        let mut out = vec![0u8; BLOCK_SIZE * 3];
        let r = inode_read(&dev, &bitmap, &inode, 0, &mut out).unwrap();
        assert_eq!(r, out.len());
        assert_eq!(out, &data[..BLOCK_SIZE * 3]);
    }
}
