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

//! End-to-end scenarios exercising the mounted file system as a whole,
//! seeded directly from the six concrete walkthroughs this engine is
//! expected to satisfy.

use std::mem;

use modernfs::alloc::ExtentAllocator;
use modernfs::error::FsError;
use modernfs::format::format_image;
use modernfs::fs::Filesystem;
use modernfs::mount::MountContext;
use tempfile::NamedTempFile;

fn fresh_image(mib: u64) -> NamedTempFile {
    let f = NamedTempFile::new().unwrap();
    format_image(f.path(), mib).unwrap();
    f
}

/// S1: format 16 MiB, mount RW, create `/hello.txt`, write 16 bytes at
/// offset 0, read them back, expect the original bytes and size 16.
#[test]
fn s1_small_file_write_read_roundtrip() {
    let f = fresh_image(16);
    let fs = Filesystem::mount(f.path(), false).unwrap();

    let attr = fs.create(fs.root_inum, "hello.txt", 0o644).unwrap();
    let payload = b"Hello, ModernFS!";
    assert_eq!(payload.len(), 16);
    let n = fs.write(attr.inum, 0, payload).unwrap();
    assert_eq!(n, 16);

    let out = fs.read(attr.inum, 0, 16).unwrap();
    assert_eq!(&out, payload);
    assert_eq!(fs.getattr(attr.inum).unwrap().size, 16);
}

/// S2: format 64 MiB, create 1000 small files, list root, expect every
/// name present plus `.` and `..`.
#[test]
fn s2_thousand_small_files_readdir() {
    let f = fresh_image(64);
    let fs = Filesystem::mount(f.path(), false).unwrap();

    for i in 0..1000 {
        let name = format!("small{i:04}.txt");
        let attr = fs.create(fs.root_inum, &name, 0o644).unwrap();
        fs.write(attr.inum, 0, b"small file content").unwrap();
    }

    let entries = fs.readdir(fs.root_inum).unwrap();
    let names: std::collections::HashSet<_> = entries.iter().map(|e| e.name.clone()).collect();
    assert!(names.contains("."));
    assert!(names.contains(".."));
    for i in 0..1000 {
        let name = format!("small{i:04}.txt");
        assert!(names.contains(&name), "missing {name}");
    }
    assert_eq!(names.len(), 1002);
}

/// S3: format 256 MiB, write 10 MiB of `i mod 256` pattern bytes, read it
/// back byte-exact, expect `blocks == 2560`.
#[test]
fn s3_large_pattern_write_matches_block_count() {
    let f = fresh_image(256);
    let fs = Filesystem::mount(f.path(), false).unwrap();

    let attr = fs.create(fs.root_inum, "large.dat", 0o644).unwrap();
    let len = 10 * 1024 * 1024usize;
    let pattern: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
    let n = fs.write(attr.inum, 0, &pattern).unwrap();
    assert_eq!(n, len);

    let out = fs.read(attr.inum, 0, len).unwrap();
    assert_eq!(out, pattern);

    let final_attr = fs.getattr(attr.inum).unwrap();
    assert_eq!(final_attr.size, len as u64);
    assert_eq!(final_attr.blocks, 2560);
}

/// S4: commit a transaction directly against block 6000 without ever
/// checkpointing or syncing, then simulate a crash (the process dying
/// before `Drop` runs) via `mem::forget`. A fresh mount must replay the
/// transaction during recovery.
#[test]
fn s4_crash_recovery_replays_committed_transaction() {
    let f = fresh_image(32);

    let ctx = MountContext::mount(f.path(), false).unwrap();
    let journal = ctx.journal.as_ref().expect("writable mount has a journal");

    let mut payload = [0xCCu8; 4096];
    let prefix = b"CRASH_TEST_DATA";
    payload[..prefix.len()].copy_from_slice(prefix);

    let mut txn = journal.begin();
    txn.write(6000, &payload);
    journal.commit(txn).unwrap();

    // Simulate a crash: skip checkpoint, skip the graceful Drop-time sync.
    mem::forget(ctx);

    let ctx2 = MountContext::mount(f.path(), false).unwrap();
    let block = ctx2.dev.read_block(6000).unwrap();
    assert_eq!(&block[..prefix.len()], prefix);
    assert!(block[prefix.len()..].iter().all(|&b| b == 0xCC));
}

/// S5: allocate five 50-block extents from hint 0, free #1, #3, #5 (the
/// odd ones), then request `[min 100, max 200]`; expect success only when
/// a contiguous free run of at least 100 blocks remains.
#[test]
fn s5_fragmentation_then_large_allocation() {
    let total = 2000u32;
    let alloc = ExtentAllocator::new(total, 0);

    let mut extents = Vec::new();
    let mut hint = 0u32;
    for _ in 0..5 {
        let extent = alloc.alloc(hint, 50, 50).unwrap();
        assert_eq!(extent.len, 50);
        hint = extent.start + extent.len;
        extents.push(extent);
    }

    // Free #1, #3, #5 (1-indexed in the scenario, 0/2/4 here), leaving
    // #2 and #4 allocated between them and fragmenting the freed region
    // into runs no larger than 50 blocks.
    alloc.free(extents[0].start, extents[0].len).unwrap();
    alloc.free(extents[2].start, extents[2].len).unwrap();
    alloc.free(extents[4].start, extents[4].len).unwrap();

    match alloc.alloc(0, 100, 200) {
        Ok(extent) => {
            assert!(extent.len >= 100 && extent.len <= 200);
            assert!(extent.start + extent.len <= total);
        }
        Err(FsError::NoSpace) => {
            // Acceptable: the freed runs fragment below 100 contiguous
            // blocks once #2/#4 remain allocated between them.
        }
        Err(e) => panic!("unexpected error: {e}"),
    }

    // The untouched tail past all five extents is still one contiguous
    // run of at least `total - 5*50` blocks, so a generous request from
    // a fresh hint must succeed somewhere.
    let extent = alloc.alloc(1000, 100, 200).unwrap();
    assert!(extent.len >= 100);
    assert!(extent.start + extent.len <= total);
}

/// S6: `rmdir` on a non-empty directory fails with `NotEmpty`; once
/// emptied, it succeeds and the parent's `nlink` drops by one.
#[test]
fn s6_rmdir_requires_empty_then_decrements_parent_nlink() {
    let f = fresh_image(16);
    let fs = Filesystem::mount(f.path(), false).unwrap();

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
    assert!(matches!(fs.lookup(fs.root_inum, "a"), Err(FsError::NotFound)));
}

/// Exercises the resolver on a nested path with a symlink in the middle,
/// covering the round-trip law "resolve(p) == resolve(normalize(p))" for
/// a path that actually touches the directory and symlink layers.
#[test]
fn resolve_handles_nested_paths_and_symlinks() {
    let f = fresh_image(16);
    let fs = Filesystem::mount(f.path(), false).unwrap();

    let a = fs.mkdir(fs.root_inum, "a", 0o755).unwrap();
    let file = fs.create(a.inum, "f.txt", 0o644).unwrap();
    fs.write(file.inum, 0, b"contents").unwrap();
    fs.symlink(fs.root_inum, "shortcut", "a/f.txt").unwrap();

    let direct = fs.resolve("/a/f.txt").unwrap();
    let via_link = fs.resolve("/shortcut").unwrap();
    assert_eq!(direct.inum, via_link.inum);
    assert_eq!(direct.inum, file.inum);

    let messy = fs.resolve("/a/../a/./f.txt").unwrap();
    assert_eq!(messy.inum, file.inum);
}

/// Remounting after a clean unmount preserves file contents and
/// directory structure (exercises `MountContext::sync` via `Drop`).
#[test]
fn clean_remount_preserves_data() {
    let f = fresh_image(16);
    {
        let fs = Filesystem::mount(f.path(), false).unwrap();
        let attr = fs.create(fs.root_inum, "persisted.txt", 0o644).unwrap();
        fs.write(attr.inum, 0, b"still here after remount").unwrap();
    }
    let fs = Filesystem::mount(f.path(), false).unwrap();
    let attr = fs.lookup(fs.root_inum, "persisted.txt").unwrap();
    let out = fs.read(attr.inum, 0, 64).unwrap();
    assert_eq!(&out, b"still here after remount");
}
