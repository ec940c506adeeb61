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

//! The path resolver: §4.G. Pure textual normalization plus a component
//! walk driven by callbacks into the inode and directory layers (kept as
//! callbacks rather than a direct dependency so this module stays testable
//! without a disk image).

use crate::error::{FsError, FsResult};

/// Maximum symlink indirection depth before `resolve` gives up and reports
/// a loop as corruption — the spec leaves the bound to implementers; 32
/// matches the conventional POSIX `ELOOP` depth.
pub const MAX_SYMLINK_DEPTH: u32 = 32;

/// Expands `.`/`..` and collapses repeated `/`. Preserves absolute-ness:
/// an absolute input normalizes to an absolute path: a relative input
/// (with no leading `..` able to escape) normalizes to a relative one,
/// using `.` for the empty result.
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if matches!(stack.last(), Some(&top) if top != "..") {
                    stack.pop();
                } else if !absolute {
                    stack.push("..");
                }
                // Absolute paths silently drop a `..` that would escape
                // root, matching POSIX chroot-style normalization.
            }
            other => stack.push(other),
        }
    }
    let joined = stack.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// The final path component, textual only (no filesystem access).
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.rfind('/') {
        Some(i) => &trimmed[i + 1..],
        None => trimmed,
    }
}

/// Every component but the last, textual only.
pub fn dirname(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => trimmed[..i].to_string(),
        None => ".".to_string(),
    }
}

/// Splits a normalized absolute or relative path into its components,
/// stripping the leading `/` marker (callers track "started absolute"
/// separately via [`normalize`]'s contract if they need it).
fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".").collect()
}

/// What [`resolve`] found at the end of the walk: the inode it stopped
/// on, held open with the caller's `get`/`put` discipline (see the
/// `Resolver` trait).
pub struct Resolved<H> {
    pub inode: H,
    pub inum: u32,
}

/// The directory/inode operations `resolve` needs, factored out so this
/// module has no direct dependency on the disk image — `crate::fs`
/// supplies the concrete implementation.
pub trait Resolver {
    type Handle: Clone;

    fn get(&self, inum: u32) -> FsResult<Self::Handle>;
    fn put(&self, inum: u32);
    fn is_dir(&self, handle: &Self::Handle) -> bool;
    fn is_symlink(&self, handle: &Self::Handle) -> bool;
    fn lookup_child(&self, dir: &Self::Handle, name: &str) -> FsResult<u32>;
    fn read_symlink(&self, handle: &Self::Handle) -> FsResult<String>;
    fn inum_of(&self, handle: &Self::Handle) -> u32;
}

/// Walks `path` starting at `root` (if absolute) or `cwd` (if relative),
/// following symlinks when `follow_symlink` is set, capped at
/// [`MAX_SYMLINK_DEPTH`]. Returns the final inode, held open.
pub fn resolve<R: Resolver>(
    r: &R,
    root: u32,
    cwd: u32,
    path: &str,
    follow_symlink: bool,
) -> FsResult<Resolved<R::Handle>> {
    resolve_depth(r, root, cwd, path, follow_symlink, 0)
}

fn resolve_depth<R: Resolver>(
    r: &R,
    root: u32,
    cwd: u32,
    path: &str,
    follow_symlink: bool,
    depth: u32,
) -> FsResult<Resolved<R::Handle>> {
    if depth > MAX_SYMLINK_DEPTH {
        return Err(FsError::corruption("symlink resolution exceeded depth limit"));
    }
    let normalized = normalize(path);
    let start_inum = if normalized.starts_with('/') { root } else { cwd };
    let mut current_inum = start_inum;
    let mut current = r.get(current_inum)?;

    let parts = components(&normalized);
    for (i, part) in parts.iter().enumerate() {
        if !r.is_dir(&current) {
            r.put(current_inum);
            return Err(FsError::invalid(format!(
                "{} is not a directory",
                part
            )));
        }
        let child_inum = match r.lookup_child(&current, part) {
            Ok(inum) => inum,
            Err(e) => {
                r.put(current_inum);
                return Err(e);
            }
        };
        r.put(current_inum);
        let mut child = r.get(child_inum)?;
        current_inum = child_inum;

        let is_last = i + 1 == parts.len();
        if r.is_symlink(&child) && (follow_symlink || !is_last) {
            let target = r.read_symlink(&child)?;
            r.put(current_inum);
            let resolved = resolve_depth(r, root, cwd, &target, follow_symlink, depth + 1)?;
            child = resolved.inode;
            current_inum = resolved.inum;
        }
        current = child;
    }

    Ok(Resolved {
        inum: current_inum,
        inode: current,
    })
}

/// Resolves everything but the final component, returning the parent
/// directory's inode (held open) and the basename to create/remove there.
pub fn resolve_parent<R: Resolver>(
    r: &R,
    root: u32,
    cwd: u32,
    path: &str,
) -> FsResult<(Resolved<R::Handle>, String)> {
    let normalized = normalize(path);
    let parent = dirname(&normalized);
    let base = basename(&normalized).to_string();
    if base == "/" || base.is_empty() {
        return Err(FsError::invalid("path has no final component to target"));
    }
    let resolved = resolve(r, root, cwd, &parent, true)?;
    if !r.is_dir(&resolved.inode) {
        r.put(resolved.inum);
        return Err(FsError::invalid(format!("{parent} is not a directory")));
    }
    Ok((resolved, base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dots_and_slashes() {
        assert_eq!(normalize("/a//b/./c/"), "/a/b/c");
        assert_eq!(normalize("/a/b/../c"), "/a/c");
        assert_eq!(normalize("a/b/../../c"), "c");
        assert_eq!(normalize(""), ".");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("/.."), "/");
    }

    #[test]
    fn normalize_is_idempotent() {
        for p in ["/a//b/./c/", "a/b/../../c", "/", "", "/a/b/c/../../.."] {
            let once = normalize(p);
            let twice = normalize(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn basename_and_dirname_recombine() {
        for p in ["/a/b/c", "/a", "/a/b/"] {
            let norm = normalize(p);
            let recombined = if dirname(&norm) == "/" {
                format!("/{}", basename(&norm))
            } else {
                format!("{}/{}", dirname(&norm), basename(&norm))
            };
            assert_eq!(normalize(&recombined), norm);
        }
    }

    #[test]
    fn basename_of_root_is_root() {
        assert_eq!(basename("/"), "/");
    }

    // A minimal in-memory Resolver for exercising the walk without a disk.
    struct FakeFs {
        dirs: std::collections::HashMap<u32, std::collections::HashMap<String, u32>>,
        symlinks: std::collections::HashMap<u32, String>,
    }

    impl Resolver for FakeFs {
        type Handle = u32;
        fn get(&self, inum: u32) -> FsResult<u32> {
            Ok(inum)
        }
        fn put(&self, _inum: u32) {}
        fn is_dir(&self, handle: &u32) -> bool {
            self.dirs.contains_key(handle)
        }
        fn is_symlink(&self, handle: &u32) -> bool {
            self.symlinks.contains_key(handle)
        }
        fn lookup_child(&self, dir: &u32, name: &str) -> FsResult<u32> {
            self.dirs
                .get(dir)
                .and_then(|m| m.get(name))
                .copied()
                .ok_or(FsError::NotFound)
        }
        fn read_symlink(&self, handle: &u32) -> FsResult<String> {
            self.symlinks.get(handle).cloned().ok_or(FsError::NotFound)
        }
        fn inum_of(&self, handle: &u32) -> u32 {
            *handle
        }
    }

    #[test]
    fn resolve_walks_nested_directories() {
        let mut root_entries = std::collections::HashMap::new();
        root_entries.insert("a".to_string(), 2);
        let mut a_entries = std::collections::HashMap::new();
        a_entries.insert("b".to_string(), 3);
        let mut dirs = std::collections::HashMap::new();
        dirs.insert(1, root_entries);
        dirs.insert(2, a_entries);
        let fs = FakeFs {
            dirs,
            symlinks: std::collections::HashMap::new(),
        };
        let resolved = resolve(&fs, 1, 1, "/a/b", false).unwrap();
        assert_eq!(resolved.inum, 3);
    }

    #[test]
    fn resolve_equals_resolve_of_normalized_form() {
        let mut root_entries = std::collections::HashMap::new();
        root_entries.insert("a".to_string(), 2);
        let mut dirs = std::collections::HashMap::new();
        dirs.insert(1, root_entries);
        let fs = FakeFs {
            dirs,
            symlinks: std::collections::HashMap::new(),
        };
        let r1 = resolve(&fs, 1, 1, "/./a/../a", false).unwrap();
        let r2 = resolve(&fs, 1, 1, &normalize("/./a/../a"), false).unwrap();
        assert_eq!(r1.inum, r2.inum);
    }
}
