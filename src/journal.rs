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

//! The write-ahead journal: §4.C of the design.
//!
//! The journal region is a ring of 4 KiB blocks: block 0 holds the journal
//! superblock, blocks `1..total_blocks` are the ring itself. A transaction
//! is recorded as descriptor block, payload blocks, commit block, written
//! in that order with an fsync barrier before and after the commit block.
//! Recovery replays every committed-but-unapplied transaction it finds
//! starting at `tail`.
//!
//! Journal writes go around the buffer cache directly onto a cloned file
//! descriptor (see [`Journal::new`]), because the journal lock must never
//! be taken while holding the cache's structural lock (§5). Whenever the
//! journal lands a block at its home location, it calls back into
//! [`CacheInvalidate`] so a stale cached copy cannot resurface.

use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Mutex;

use crc32fast::Hasher;

use crate::error::{FsError, FsResult};
use crate::layout::{BLOCK_SIZE, JOURNAL_MAGIC, JOURNAL_VERSION};

/// Callback the journal uses to invalidate a cached frame it just wrote
/// directly, bypassing the cache (§4.C "cache coherence").
pub trait CacheInvalidate: Send + Sync {
    fn invalidate(&self, block: u32);
}

/// The journal superblock, resident at block 0 of the journal region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JournalSuperblock {
    magic: u32,
    version: u32,
    block_size: u32,
    total_blocks: u32,
    sequence: u64,
    head: u32,
    tail: u32,
}

impl JournalSuperblock {
    fn fresh(total_blocks: u32) -> Self {
        Self {
            magic: JOURNAL_MAGIC,
            version: JOURNAL_VERSION,
            block_size: BLOCK_SIZE as u32,
            total_blocks,
            sequence: 0,
            head: 1,
            tail: 1,
        }
    }

    fn to_block(self) -> [u8; BLOCK_SIZE] {
        let mut buf = [0u8; BLOCK_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.block_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.total_blocks.to_le_bytes());
        buf[16..24].copy_from_slice(&self.sequence.to_le_bytes());
        buf[24..28].copy_from_slice(&self.head.to_le_bytes());
        buf[28..32].copy_from_slice(&self.tail.to_le_bytes());
        buf
    }

    fn from_block(buf: &[u8; BLOCK_SIZE]) -> FsResult<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != JOURNAL_MAGIC {
            return Err(FsError::corruption(format!(
                "bad journal magic {magic:#x} (expected {JOURNAL_MAGIC:#x})"
            )));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != JOURNAL_VERSION {
            return Err(FsError::corruption(format!(
                "unsupported journal version {version}"
            )));
        }
        let block_size = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if block_size != BLOCK_SIZE as u32 {
            return Err(FsError::corruption(format!(
                "journal block_size {block_size} does not match {BLOCK_SIZE}"
            )));
        }
        Ok(Self {
            magic,
            version,
            block_size,
            total_blocks: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            sequence: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            head: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            tail: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
        })
    }
}

const DESCRIPTOR_MAGIC: u32 = 0x4445_5343; // "DESC"
const COMMIT_MAGIC: u32 = 0x434F_4D54; // "COMT"

/// Fixed header at the front of a descriptor block: magic(4) + sequence(8)
/// + target count(4).
const DESCRIPTOR_HEADER_LEN: usize = 16;

/// Upper bound on how many target block numbers one descriptor block can
/// record (the rest of the block after its header, at 4 bytes each).
const MAX_TARGETS_PER_DESCRIPTOR: usize = (BLOCK_SIZE - DESCRIPTOR_HEADER_LEN) / 4;

/// Largest transaction [`Journal::commit`] will accept, in distinct target
/// blocks. Kept well under [`MAX_TARGETS_PER_DESCRIPTOR`] (so the descriptor
/// never needs to span more than one block) and under the smallest journal
/// region a superblock will ever allocate, so a transaction this size
/// always has room to commit once any pending transactions are checkpointed.
/// Callers writing more than this many blocks in one logical operation
/// (`Filesystem::write` on a large buffer) must split it into several
/// transactions themselves.
pub const MAX_BLOCKS_PER_TRANSACTION: usize = 128;

/// An open, in-memory transaction: target block number -> payload.
/// Building one records no I/O; only [`Journal::commit`] writes anything.
pub struct Transaction {
    writes: BTreeMap<u32, Box<[u8; BLOCK_SIZE]>>,
}

impl Transaction {
    fn new() -> Self {
        Self {
            writes: BTreeMap::new(),
        }
    }

    /// Records (or overwrites) the payload for `block` inside this
    /// transaction. No I/O happens until commit.
    pub fn write(&mut self, block: u32, data: &[u8; BLOCK_SIZE]) {
        self.writes.insert(block, Box::new(*data));
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

/// A transaction recorded in the ring, pending checkpoint.
struct PendingTxn {
    sequence: u64,
    /// Ring-relative offset, in blocks, of the descriptor block.
    start: u32,
    targets: Vec<u32>,
    /// Ring-relative offset of the block just past the commit block —
    /// where `tail` lands once this transaction is checkpointed.
    end: u32,
}

struct JournalState {
    sb: JournalSuperblock,
    pending: Vec<PendingTxn>,
}

/// The write-ahead journal manager. Holds its own file descriptor onto the
/// image so it can write around the buffer cache (§4.C, §5).
pub struct Journal {
    file: File,
    journal_start: u32,
    state: Mutex<JournalState>,
    invalidate: Box<dyn CacheInvalidate>,
}

impl Journal {
    /// Loads the journal superblock at `journal_start` (block-relative to
    /// the image) and prepares the in-memory ring state. Does not run
    /// recovery; call [`Journal::recover`] once the rest of the mount is
    /// up.
    pub fn open(
        file: File,
        journal_start: u32,
        invalidate: Box<dyn CacheInvalidate>,
    ) -> FsResult<Self> {
        let mut buf = [0u8; BLOCK_SIZE];
        file.read_exact_at(&mut buf, journal_start as u64 * BLOCK_SIZE as u64)?;
        let sb = JournalSuperblock::from_block(&buf)?;
        Ok(Self {
            file,
            journal_start,
            state: Mutex::new(JournalState {
                sb,
                pending: Vec::new(),
            }),
            invalidate,
        })
    }

    /// Formats a fresh journal superblock at `journal_start` for
    /// `total_blocks` ring blocks (including the superblock itself).
    pub fn format(file: &File, journal_start: u32, total_blocks: u32) -> FsResult<()> {
        let sb = JournalSuperblock::fresh(total_blocks);
        file.write_all_at(&sb.to_block(), journal_start as u64 * BLOCK_SIZE as u64)?;
        Ok(())
    }

    fn ring_capacity(sb: &JournalSuperblock) -> u32 {
        sb.total_blocks - 1
    }

    fn read_ring_block(&self, rel: u32) -> FsResult<[u8; BLOCK_SIZE]> {
        let mut buf = [0u8; BLOCK_SIZE];
        let abs = self.journal_start + rel;
        self.file
            .read_exact_at(&mut buf, abs as u64 * BLOCK_SIZE as u64)?;
        Ok(buf)
    }

    fn write_ring_block(&self, rel: u32, data: &[u8; BLOCK_SIZE]) -> FsResult<()> {
        let abs = self.journal_start + rel;
        self.file
            .write_all_at(data, abs as u64 * BLOCK_SIZE as u64)?;
        Ok(())
    }

    fn write_superblock(&self, sb: &JournalSuperblock) -> FsResult<()> {
        self.file
            .write_all_at(&sb.to_block(), self.journal_start as u64 * BLOCK_SIZE as u64)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Begins a new transaction. Concurrent begins are allowed; only
    /// commits are serialized (§4.C).
    pub fn begin(&self) -> Transaction {
        Transaction::new()
    }

    /// Advances `rel` by one ring slot, wrapping past the superblock slot
    /// (slot 0) back to slot 1.
    fn advance(rel: u32, capacity: u32) -> u32 {
        let next = rel + 1;
        if next > capacity {
            1
        } else {
            next
        }
    }

    fn free_ring_space(sb: &JournalSuperblock, capacity: u32) -> u32 {
        // Slots strictly between head and tail (exclusive of tail, which is
        // never overwritten) wrapping around the ring once.
        if sb.head >= sb.tail {
            capacity - (sb.head - sb.tail)
        } else {
            sb.tail - sb.head
        }
    }

    /// Commits `txn`: reserves `K+2` ring slots (descriptor + payloads +
    /// commit), running an inline checkpoint first if that does not fit.
    /// Returns the sequence number assigned to this transaction.
    pub fn commit(&self, txn: Transaction) -> FsResult<u64> {
        if txn.is_empty() {
            return Ok(0);
        }
        if txn.len() > MAX_TARGETS_PER_DESCRIPTOR {
            // Would overflow a single descriptor block. Every internal
            // caller stays under MAX_BLOCKS_PER_TRANSACTION; this only
            // guards against a transaction built some other way.
            return Err(FsError::NoSpace);
        }
        let needed = txn.len() as u32 + 2;
        let mut state = self.state.lock().unwrap();
        let capacity = Self::ring_capacity(&state.sb);
        if needed > capacity {
            return Err(FsError::NoSpace);
        }
        if Self::free_ring_space(&state.sb, capacity) < needed {
            self.checkpoint_locked(&mut state)?;
            if Self::free_ring_space(&state.sb, capacity) < needed {
                return Err(FsError::NoSpace);
            }
        }

        let sequence = state.sb.sequence + 1;
        let targets: Vec<u32> = txn.writes.keys().copied().collect();
        let descriptor_rel = state.sb.head;

        let mut desc = [0u8; BLOCK_SIZE];
        desc[0..4].copy_from_slice(&DESCRIPTOR_MAGIC.to_le_bytes());
        desc[4..12].copy_from_slice(&sequence.to_le_bytes());
        desc[12..16].copy_from_slice(&(targets.len() as u32).to_le_bytes());
        for (i, t) in targets.iter().enumerate() {
            let off = 16 + i * 4;
            desc[off..off + 4].copy_from_slice(&t.to_le_bytes());
        }
        self.write_ring_block(descriptor_rel, &desc)?;

        let mut hasher = Hasher::new();
        let mut rel = Self::advance(descriptor_rel, capacity);
        for t in &targets {
            let data = &txn.writes[t];
            hasher.update(data.as_slice());
            self.write_ring_block(rel, data)?;
            rel = Self::advance(rel, capacity);
        }
        self.file.sync_all()?;

        let checksum = hasher.finalize();
        let mut commit = [0u8; BLOCK_SIZE];
        commit[0..4].copy_from_slice(&COMMIT_MAGIC.to_le_bytes());
        commit[4..12].copy_from_slice(&sequence.to_le_bytes());
        commit[12..16].copy_from_slice(&checksum.to_le_bytes());
        self.write_ring_block(rel, &commit)?;
        self.file.sync_all()?;

        let end = Self::advance(rel, capacity);
        state.sb.head = end;
        state.sb.sequence = sequence;
        self.write_superblock(&state.sb)?;

        state.pending.push(PendingTxn {
            sequence,
            start: descriptor_rel,
            targets,
            end,
        });

        Ok(sequence)
    }

    /// Applies every committed-but-unapplied transaction to its home
    /// blocks, in sequence order, then advances `tail` past the last one
    /// applied and persists the journal superblock.
    pub fn checkpoint(&self) -> FsResult<usize> {
        let mut state = self.state.lock().unwrap();
        self.checkpoint_locked(&mut state)
    }

    fn checkpoint_locked(&self, state: &mut JournalState) -> FsResult<usize> {
        if state.pending.is_empty() {
            return Ok(0);
        }
        let pending = std::mem::take(&mut state.pending);
        let mut applied = 0usize;
        let mut last_end = state.sb.tail;
        for txn in pending {
            let capacity = Self::ring_capacity(&state.sb);
            let mut rel = Self::advance(txn.start, capacity);
            for target in &txn.targets {
                let data = self.read_ring_block(rel)?;
                self.write_ring_block_home(*target, &data)?;
                rel = Self::advance(rel, capacity);
            }
            self.file.sync_all()?;
            last_end = txn.end;
            applied += 1;
            let _ = txn.sequence;
        }
        state.sb.tail = last_end;
        self.write_superblock(&state.sb)?;
        Ok(applied)
    }

    /// Writes `data` at `target`'s home location, bypassing the buffer
    /// cache, and invalidates any cached copy so it cannot resurface stale.
    fn write_ring_block_home(&self, target: u32, data: &[u8; BLOCK_SIZE]) -> FsResult<()> {
        self.file
            .write_all_at(data, target as u64 * BLOCK_SIZE as u64)?;
        self.invalidate.invalidate(target);
        Ok(())
    }

    /// Scans the ring from `tail` forward, replaying every transaction
    /// whose commit block is valid (matching sequence and checksum),
    /// stopping at the first descriptor without one. Returns the number
    /// of transactions applied. Called once at mount, before the
    /// filesystem is exposed to callers.
    pub fn recover(&self) -> FsResult<usize> {
        let mut state = self.state.lock().unwrap();
        let capacity = Self::ring_capacity(&state.sb);
        let mut rel = state.sb.tail;
        let mut applied = 0usize;
        let mut expected_seq = state.sb.sequence + 1;

        loop {
            if rel == state.sb.head {
                break;
            }
            let desc = self.read_ring_block(rel)?;
            let magic = u32::from_le_bytes(desc[0..4].try_into().unwrap());
            if magic != DESCRIPTOR_MAGIC {
                break;
            }
            let sequence = u64::from_le_bytes(desc[4..12].try_into().unwrap());
            let count = u32::from_le_bytes(desc[12..16].try_into().unwrap()) as usize;
            if count > MAX_TARGETS_PER_DESCRIPTOR || count as u32 + 2 > capacity {
                log::warn!("journal: implausible descriptor target count {count}, stopping replay");
                break;
            }
            let mut targets = Vec::with_capacity(count);
            for i in 0..count {
                let off = 16 + i * 4;
                targets.push(u32::from_le_bytes(desc[off..off + 4].try_into().unwrap()));
            }

            let mut payload_rel = Self::advance(rel, capacity);
            let mut payloads = Vec::with_capacity(count);
            let mut hasher = Hasher::new();
            for _ in 0..count {
                let data = self.read_ring_block(payload_rel)?;
                hasher.update(&data);
                payloads.push(data);
                payload_rel = Self::advance(payload_rel, capacity);
            }
            let commit = self.read_ring_block(payload_rel)?;
            let commit_magic = u32::from_le_bytes(commit[0..4].try_into().unwrap());
            let commit_seq = u64::from_le_bytes(commit[4..12].try_into().unwrap());
            let commit_checksum = u32::from_le_bytes(commit[12..16].try_into().unwrap());
            let checksum = hasher.finalize();

            if commit_magic != COMMIT_MAGIC || commit_seq != sequence || commit_seq != expected_seq
            {
                break;
            }
            if commit_checksum != checksum {
                log::warn!("journal: checksum mismatch at sequence {sequence}, stopping replay");
                break;
            }

            for (target, data) in targets.iter().zip(payloads.iter()) {
                self.write_ring_block_home(*target, data)?;
            }
            self.file.sync_all()?;

            let end = Self::advance(payload_rel, capacity);
            state.sb.tail = end;
            rel = end;
            applied += 1;
            expected_seq = sequence + 1;
        }

        state.sb.sequence = state.sb.sequence.max(expected_seq.saturating_sub(1));
        self.write_superblock(&state.sb)?;
        Ok(applied)
    }

    /// Current head/tail, for diagnostics and the `S4`-style test that
    /// wants to assert recovery made progress.
    pub fn head_tail(&self) -> (u32, u32) {
        let state = self.state.lock().unwrap();
        (state.sb.head, state.sb.tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    struct NullInvalidate;
    impl CacheInvalidate for NullInvalidate {
        fn invalidate(&self, _block: u32) {}
    }

    struct RecordingInvalidate(Mutex<Vec<u32>>);
    impl CacheInvalidate for RecordingInvalidate {
        fn invalidate(&self, block: u32) {
            self.0.lock().unwrap().push(block);
        }
    }

    fn make_image(blocks: u32) -> (NamedTempFile, File) {
        let f = NamedTempFile::new().unwrap();
        f.as_file().set_len(blocks as u64 * BLOCK_SIZE as u64).unwrap();
        let file = File::open(f.path()).unwrap();
        (f, file)
    }

    fn open_rw(path: &std::path::Path) -> File {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .unwrap()
    }

    #[test]
    fn format_then_open_roundtrips_superblock() {
        let (f, _ro) = make_image(64);
        let rw = open_rw(f.path());
        Journal::format(&rw, 0, 64).unwrap();
        let j = Journal::open(open_rw(f.path()), 0, Box::new(NullInvalidate)).unwrap();
        assert_eq!(j.head_tail(), (1, 1));
    }

    #[test]
    fn commit_then_checkpoint_lands_payload_at_home() {
        let (f, _ro) = make_image(64);
        let rw = open_rw(f.path());
        Journal::format(&rw, 0, 64).unwrap();
        let j = Journal::open(rw, 0, Box::new(NullInvalidate)).unwrap();

        let mut txn = j.begin();
        let mut data = [0xABu8; BLOCK_SIZE];
        data[..5].copy_from_slice(b"hello");
        txn.write(40, &data);
        let seq = j.commit(txn).unwrap();
        assert_eq!(seq, 1);

        let applied = j.checkpoint().unwrap();
        assert_eq!(applied, 1);

        let verify = open_rw(f.path());
        let mut buf = [0u8; BLOCK_SIZE];
        verify.read_exact_at(&mut buf, 40 * BLOCK_SIZE as u64).unwrap();
        assert_eq!(&buf[..5], b"hello");

        let (head, tail) = j.head_tail();
        assert_eq!(head, tail, "checkpoint must catch tail up to head");
    }

    #[test]
    fn checkpoint_invalidates_cache_frame() {
        let (f, _ro) = make_image(64);
        let rw = open_rw(f.path());
        Journal::format(&rw, 0, 64).unwrap();
        let inval = Arc::new(RecordingInvalidate(Mutex::new(Vec::new())));
        struct Forward(Arc<RecordingInvalidate>);
        impl CacheInvalidate for Forward {
            fn invalidate(&self, block: u32) {
                self.0.invalidate(block)
            }
        }
        let j = Journal::open(rw, 0, Box::new(Forward(inval.clone()))).unwrap();

        let mut txn = j.begin();
        txn.write(10, &[1u8; BLOCK_SIZE]);
        j.commit(txn).unwrap();
        j.checkpoint().unwrap();

        assert_eq!(inval.0.lock().unwrap().as_slice(), &[10]);
    }

    #[test]
    fn recover_replays_committed_transaction() {
        let (f, _ro) = make_image(64);
        let rw = open_rw(f.path());
        Journal::format(&rw, 0, 64).unwrap();
        {
            let j = Journal::open(open_rw(f.path()), 0, Box::new(NullInvalidate)).unwrap();
            let mut txn = j.begin();
            let mut data = [0xCCu8; BLOCK_SIZE];
            data[..15].copy_from_slice(b"CRASH_TEST_DATA");
            txn.write(50, &data);
            j.commit(txn).unwrap();
            // No checkpoint: simulate a crash before the background
            // checkpointer ever ran.
        }

        let j2 = Journal::open(open_rw(f.path()), 0, Box::new(NullInvalidate)).unwrap();
        let applied = j2.recover().unwrap();
        assert_eq!(applied, 1);

        let verify = open_rw(f.path());
        let mut buf = [0u8; BLOCK_SIZE];
        verify.read_exact_at(&mut buf, 50 * BLOCK_SIZE as u64).unwrap();
        assert_eq!(&buf[..15], b"CRASH_TEST_DATA");
    }

    #[test]
    fn uncommitted_writes_never_reach_home_blocks() {
        let (f, _ro) = make_image(64);
        let rw = open_rw(f.path());
        Journal::format(&rw, 0, 64).unwrap();
        let j = Journal::open(rw, 0, Box::new(NullInvalidate)).unwrap();

        let mut txn = j.begin();
        txn.write(30, &[0x11u8; BLOCK_SIZE]);
        drop(txn); // abort: dropped without commit

        let verify = open_rw(f.path());
        let mut buf = [0u8; BLOCK_SIZE];
        verify.read_exact_at(&mut buf, 30 * BLOCK_SIZE as u64).unwrap();
        assert_eq!(buf, [0u8; BLOCK_SIZE]);
    }

    #[test]
    fn commit_rejects_transaction_too_large_for_one_descriptor() {
        // commit() must reject before it ever indexes into the descriptor
        // block, so the image only needs to exist, not be large enough to
        // hold these (never written) target blocks.
        let (f, _ro) = make_image(64);
        let rw = open_rw(f.path());
        Journal::format(&rw, 0, 64).unwrap();
        let j = Journal::open(rw, 0, Box::new(NullInvalidate)).unwrap();

        let mut txn = j.begin();
        for block in 0..(MAX_TARGETS_PER_DESCRIPTOR as u32 + 1) {
            txn.write(block, &[0u8; BLOCK_SIZE]);
        }
        assert!(matches!(j.commit(txn), Err(FsError::NoSpace)));
    }
}
