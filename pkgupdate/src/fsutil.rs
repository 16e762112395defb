// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

//! Filesystem primitives used by the transaction engine.
//!
//! Every operation records a thread-local descriptor of the last failure
//! (operation, path and OS error) so callers anywhere up the stack can
//! render one uniform error line via [`last_error`].

use std::cell::RefCell;
use std::fs;
use std::io;
use std::os::unix::fs::{symlink, FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use log::warn;
use nix::sys::stat::{mknod, Mode, SFlag};
use nix::unistd::{chown, Gid, Uid};
use thiserror::Error;

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

#[derive(Debug, Error)]
#[error("{operation} failed for path: {}: {source}", path.display())]
pub struct Error {
    operation: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
}

impl Error {
    fn record(operation: &'static str, path: &Path, source: io::Error) -> Self {
        let error = Self {
            operation,
            path: path.to_path_buf(),
            source,
        };
        LAST_ERROR.with(|last| *last.borrow_mut() = Some(error.to_string()));
        error
    }
}

/// Rendered descriptor of the most recent failure on this thread
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|last| last.borrow().clone())
}

/// File type selection for [`dir_tree_list`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeFilter {
    pub regular: bool,
    pub directory: bool,
    pub symlink: bool,
    pub other: bool,
}

impl TypeFilter {
    /// Everything except directories, matching `find -not -type d`
    pub const FILES: Self = Self {
        regular: true,
        directory: false,
        symlink: true,
        other: true,
    };

    pub const DIRS: Self = Self {
        regular: false,
        directory: true,
        symlink: false,
        other: false,
    };

    fn matches(&self, kind: &fs::FileType) -> bool {
        if kind.is_dir() {
            self.directory
        } else if kind.is_file() {
            self.regular
        } else if kind.is_symlink() {
            self.symlink
        } else {
            self.other
        }
    }
}

/// Move `src` to `dst`.
///
/// Attempts a rename first; a cross-device failure falls back to a
/// recursive copy followed by recursive removal of the source. A target
/// of mismatched type (file over directory or vice versa) is removed
/// and the move retried.
pub fn move_path(src: &Path, dst: &Path) -> Result<(), Error> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(error) => match error.raw_os_error() {
            Some(code) if code == nix::libc::EXDEV => {
                copy_path(src, dst)?;
                remove_recursive(src)
            }
            Some(code) if code == nix::libc::EISDIR || code == nix::libc::ENOTDIR => {
                remove_recursive(dst)?;
                move_path(src, dst)
            }
            _ => Err(Error::record("Move", src, error)),
        },
    }
}

/// Recursively copy `src` to `dst`, replacing any previous target.
///
/// Dispatches on the source type: regular files are stream-copied with
/// mode, ownership and mtime carried over, symlinks are recreated,
/// directories recursed into and device nodes recreated with `mknod`.
/// FIFOs and sockets are warned about and skipped.
pub fn copy_path(src: &Path, dst: &Path) -> Result<(), Error> {
    remove_recursive(dst)?;
    copy_path_inner(src, dst)
}

fn copy_path_inner(src: &Path, dst: &Path) -> Result<(), Error> {
    let meta = fs::symlink_metadata(src).map_err(|e| Error::record("Copy", src, e))?;
    let kind = meta.file_type();

    if kind.is_file() {
        copy_file(src, &meta, dst)
    } else if kind.is_symlink() {
        copy_link(src, &meta, dst)
    } else if kind.is_dir() {
        copy_directory(src, &meta, dst)
    } else if kind.is_block_device() || kind.is_char_device() {
        let sflag = SFlag::from_bits_truncate(meta.mode());
        let mode = Mode::from_bits_truncate(meta.mode());
        mknod(dst, sflag, mode, meta.rdev()).map_err(|e| Error::record("Copy", dst, e.into()))?;
        preserve_owner(dst, &meta);
        Ok(())
    } else if kind.is_fifo() {
        warn!("copy_path: FIFO (named pipe) is not supported: {}", src.display());
        Ok(())
    } else if kind.is_socket() {
        warn!("copy_path: UNIX domain socket is not supported: {}", src.display());
        Ok(())
    } else {
        unreachable!("copy_path: unknown node type: {:o}", meta.mode())
    }
}

fn copy_file(src: &Path, meta: &fs::Metadata, dst: &Path) -> Result<(), Error> {
    let mut reader = fs::File::open(src).map_err(|e| Error::record("Copy", src, e))?;
    let mut writer = fs::File::create(dst).map_err(|e| Error::record("Copy", dst, e))?;

    io::copy(&mut reader, &mut writer).map_err(|e| Error::record("Copy", dst, e))?;

    if let Err(error) = writer.set_permissions(fs::Permissions::from_mode(meta.mode())) {
        warn!("Failed to set permissions for file: {}: {error}", dst.display());
    }
    preserve_owner(dst, meta);
    let mtime = FileTime::from_last_modification_time(meta);
    if let Err(error) = filetime::set_file_mtime(dst, mtime) {
        warn!("Failed to set mtime for file: {}: {error}", dst.display());
    }

    Ok(())
}

fn copy_link(src: &Path, meta: &fs::Metadata, dst: &Path) -> Result<(), Error> {
    let target = fs::read_link(src).map_err(|e| Error::record("Copy", src, e))?;
    symlink(&target, dst).map_err(|e| Error::record("Copy", dst, e))?;

    if let Err(error) = nix::unistd::fchownat(
        None,
        dst,
        Some(Uid::from_raw(meta.uid())),
        Some(Gid::from_raw(meta.gid())),
        nix::unistd::FchownatFlags::NoFollowSymlink,
    ) {
        warn!("Failed to set ownership for symlink: {}: {error}", dst.display());
    }

    Ok(())
}

fn copy_directory(src: &Path, meta: &fs::Metadata, dst: &Path) -> Result<(), Error> {
    fs::create_dir(dst).map_err(|e| Error::record("Copy", dst, e))?;
    if let Err(error) = fs::set_permissions(dst, fs::Permissions::from_mode(meta.mode())) {
        warn!("Failed to set permissions for directory: {}: {error}", dst.display());
    }
    preserve_owner(dst, meta);

    let entries = fs::read_dir(src).map_err(|e| Error::record("Copy", src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::record("Copy", src, e))?;
        copy_path_inner(&entry.path(), &dst.join(entry.file_name()))?;
    }

    Ok(())
}

fn preserve_owner(path: &Path, meta: &fs::Metadata) {
    let uid = Some(Uid::from_raw(meta.uid()));
    let gid = Some(Gid::from_raw(meta.gid()));
    if let Err(error) = chown(path, uid, gid) {
        warn!("Failed to set ownership for: {}: {error}", path.display());
    }
}

/// Remove a path and everything below it. A missing path is success.
pub fn remove_recursive(path: &Path) -> Result<(), Error> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(Error::record("Recursive removal", path, error)),
    };

    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    result.map_err(|e| Error::record("Recursive removal", path, e))
}

/// Create a directory and all parents. An existing directory is
/// success; an existing non-directory is an error.
pub fn mkdir_p(path: &Path) -> Result<(), Error> {
    // Intentionally follows symlinks, same as the directory creation itself
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => {
            return Err(Error::record(
                "Recursive directory creation",
                path,
                io::Error::from_raw_os_error(nix::libc::ENOTDIR),
            ))
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(Error::record("Recursive directory creation", path, error)),
    }

    fs::create_dir_all(path).map_err(|e| Error::record("Recursive directory creation", path, e))
}

/// Alphabetized recursive listing of `path`, filtered by file type
pub fn dir_tree_list(path: &Path, filter: TypeFilter) -> Result<Vec<PathBuf>, Error> {
    let mut list = Vec::new();
    dir_tree_walk(path, filter, &mut list)?;
    list.sort();
    Ok(list)
}

fn dir_tree_walk(path: &Path, filter: TypeFilter, list: &mut Vec<PathBuf>) -> Result<(), Error> {
    let entries = fs::read_dir(path).map_err(|e| Error::record("Directory listing", path, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| Error::record("Directory listing", path, e))?;
        let sub = entry.path();
        let kind = entry
            .file_type()
            .map_err(|e| Error::record("Directory listing", &sub, e))?;

        if filter.matches(&kind) {
            list.push(sub.clone());
        }
        if kind.is_dir() {
            dir_tree_walk(&sub, filter, list)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mkdir_p_nested_and_existing() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");

        mkdir_p(&nested).unwrap();
        assert!(nested.is_dir());
        mkdir_p(&nested).unwrap();

        let file = dir.path().join("occupied");
        fs::write(&file, b"x").unwrap();
        assert!(mkdir_p(&file).is_err());
        assert!(last_error().unwrap().contains("Recursive directory creation"));
    }

    #[test]
    fn remove_recursive_missing_is_success() {
        let dir = tempfile::tempdir().unwrap();
        remove_recursive(&dir.path().join("not-there")).unwrap();
    }

    #[test]
    fn remove_recursive_tree() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("sub")).unwrap();
        fs::write(tree.join("sub/file"), b"x").unwrap();

        remove_recursive(&tree).unwrap();
        assert!(!tree.exists());
    }

    #[test]
    fn move_file_preserves_content_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::write(&src, b"payload").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o750)).unwrap();

        move_path(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
        assert_eq!(fs::metadata(&dst).unwrap().permissions().mode() & 0o777, 0o750);
    }

    #[test]
    fn move_directory_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("inner"), b"x").unwrap();
        fs::write(&dst, b"previous").unwrap();

        move_path(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(dst.join("inner")).unwrap(), b"x");
    }

    #[test]
    fn copy_path_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("link");
        let dst = dir.path().join("copied");
        symlink("target-elsewhere", &src).unwrap();

        copy_path(&src, &dst).unwrap();

        assert_eq!(fs::read_link(&dst).unwrap().to_str(), Some("target-elsewhere"));
    }

    #[test]
    fn tree_listing_is_alphabetized() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("zeta")).unwrap();
        fs::write(dir.path().join("zeta/2"), b"").unwrap();
        fs::write(dir.path().join("zeta/1"), b"").unwrap();
        fs::write(dir.path().join("alpha"), b"").unwrap();

        let files = dir_tree_list(dir.path(), TypeFilter::FILES).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, ["alpha", "zeta/1", "zeta/2"]);

        let dirs = dir_tree_list(dir.path(), TypeFilter::DIRS).unwrap();
        assert_eq!(dirs, [dir.path().join("zeta")]);
    }
}
