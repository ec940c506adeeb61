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

//! ModernFS: a journaled, POSIX-style file system backed by a single disk
//! image file, exposed through FUSE.
//!
//! This crate is the on-disk engine only (block device, buffer cache,
//! write-ahead journal, extent allocator, inode/directory layer, path
//! resolver, and mount context); [`fs::Filesystem`] composes them into the
//! VFS-shaped operations an adapter calls. The FUSE bridge and the
//! `mkfs`/mount CLIs live in `src/bin/` as thin callers of this library.

pub mod alloc;
pub mod block;
pub mod dir;
pub mod error;
pub mod format;
pub mod fs;
pub mod inode;
pub mod journal;
pub mod layout;
pub mod mount;
pub mod path;
pub mod superblock;

pub use error::{FsError, FsResult};
