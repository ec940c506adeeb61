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

//! The uniform error taxonomy returned by every public entry point of the
//! on-disk engine.
//!
//! Every layer — block device, journal, allocator, inode, directory, path
//! resolver, mount context — returns [`FsResult`]. No panics escape across
//! a public boundary except on an unrecoverable allocation failure.

use std::fmt;

/// The single error type shared by the whole engine.
///
/// Adapters (the FUSE bridge, the CLIs) translate this at the boundary to
/// their host's error representation via [`FsError::to_errno`].
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    /// Bad parameters: malformed paths, over-length names, a non-directory
    /// in the middle of a path, an offset beyond the block map's capacity.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A directory entry or inode that should exist does not.
    #[error("not found")]
    NotFound,
    /// `add` found an entry with that name already present.
    #[error("already exists")]
    AlreadyExists,
    /// `rmdir` on a directory containing more than `.` and `..`.
    #[error("directory not empty")]
    NotEmpty,
    /// The bitmap, journal, or inode table is exhausted.
    #[error("no space left on device")]
    NoSpace,
    /// A `pread`/`pwrite`/`fsync`-equivalent call failed or was short.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Superblock magic/version mismatch, journal sequence gap, checksum
    /// mismatch, or a double-free caught by the allocator.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// A mutation was attempted against a read-only mount.
    #[error("read-only file system")]
    ReadOnly,
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    /// Maps this error to the `libc` errno an adapter should report to its
    /// caller.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NoSpace => libc::ENOSPC,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            FsError::Corruption(_) => libc::EUCLEAN,
            FsError::ReadOnly => libc::EROFS,
        }
    }

    pub(crate) fn invalid(msg: impl fmt::Display) -> Self {
        FsError::InvalidArgument(msg.to_string())
    }

    pub(crate) fn corruption(msg: impl fmt::Display) -> Self {
        FsError::Corruption(msg.to_string())
    }
}
