// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use fs_err as fs;
use log::{error, trace, warn};
use nix::unistd::{access, AccessFlags, Uid};

pub use self::lockfile::Lock;

pub mod lockfile;

/// System mutability - do we have readwrite?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    /// We only have readonly access
    ReadOnly,
    /// We have read-write access
    ReadWrite,
}

impl fmt::Display for Mutability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutability::ReadOnly => "read-only".fmt(f),
            Mutability::ReadWrite => "read-write".fmt(f),
        }
    }
}

/// Hook directories under `etc/updater/`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    PreUpdate,
    PostUpdate,
    RebootRequired,
}

impl Hook {
    fn dir_name(&self) -> &'static str {
        match self {
            Hook::PreUpdate => "hook_preupdate",
            Hook::PostUpdate => "hook_postupdate",
            Hook::RebootRequired => "hook_reboot_required",
        }
    }
}

/// The filesystem subtree the updater considers to be the target system.
///
/// All paths the engine writes live under `root`; the accessors below are
/// the single source of truth for the on-disk layout.
#[derive(Debug, Clone)]
pub struct Installation {
    pub root: PathBuf,
    pub mutability: Mutability,
    /// `etc/os-release` of the target root
    pub os_release: OsRelease,
    /// `/etc/os-release` of the system we are running on
    pub host_os_release: OsRelease,
}

impl Installation {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();

        let mutability = if Uid::effective().is_root() {
            Mutability::ReadWrite
        } else if access(&root, AccessFlags::W_OK).is_ok() {
            Mutability::ReadWrite
        } else {
            Mutability::ReadOnly
        };

        trace!("Mutability: {mutability}");
        trace!("Root dir: {root:?}");

        let host_os_release = OsRelease::read(Path::new("/etc/os-release"));
        let os_release = if root == Path::new("/") {
            host_os_release.clone()
        } else {
            OsRelease::read(&root.join("etc/os-release"))
        };

        let installation = Self {
            root,
            mutability,
            os_release,
            host_os_release,
        };

        if matches!(installation.mutability, Mutability::ReadWrite) {
            installation.ensure_dirs_exist();
        }

        installation
    }

    pub fn read_only(&self) -> bool {
        matches!(self.mutability, Mutability::ReadOnly)
    }

    pub fn is_system_root(&self) -> bool {
        self.root == Path::new("/")
    }

    /// Installed-package database
    pub fn status_file(&self) -> PathBuf {
        self.root.join("usr/lib/opkg/status")
    }

    /// Per-package file lists, conffile lists and maintainer scripts
    pub fn info_dir(&self) -> PathBuf {
        self.root.join("usr/lib/opkg/info")
    }

    /// Staging areas for in-progress transactions
    pub fn unpacked_dir(&self) -> PathBuf {
        self.root.join("usr/share/updater/unpacked")
    }

    /// Downloaded package cache
    pub fn download_dir(&self) -> PathBuf {
        self.root.join("usr/share/updater/download")
    }

    /// Quarantined files from resolved collisions
    pub fn collided_dir(&self) -> PathBuf {
        self.root.join("usr/share/updater/collided")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.root.join("usr/share/updater/journal")
    }

    pub fn changelog_path(&self) -> PathBuf {
        self.root.join("usr/share/updater/changelog")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("var/lock/opkg.lock")
    }

    pub fn repositories_config(&self) -> PathBuf {
        self.root.join("etc/updater/repositories.yaml")
    }

    pub fn hook_dir(&self, hook: Hook) -> PathBuf {
        self.root.join("etc/updater").join(hook.dir_name())
    }

    fn ensure_dirs_exist(&self) {
        for path in [
            self.info_dir(),
            self.unpacked_dir(),
            self.download_dir(),
            self.collided_dir(),
            self.root.join("usr/share/updater"),
            self.root.join("var/lock"),
        ] {
            let _ = fs::create_dir_all(path);
        }
    }
}

/// Parsed `os-release` content, queried for the User-Agent string
#[derive(Debug, Clone, Default)]
pub struct OsRelease(HashMap<String, String>);

impl OsRelease {
    pub fn read(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                warn!("Unable to open os-release ({}): {err}", path.display());
                return Self::default();
            }
        };
        trace!("Parsing os-release: {}", path.display());

        let mut fields = HashMap::new();
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            match line.split_once('=') {
                Some((field, value)) => {
                    let value = value
                        .strip_prefix('"')
                        .and_then(|v| v.strip_suffix('"'))
                        .unwrap_or(value);
                    fields.insert(field.to_string(), value.to_string());
                }
                None => error!("Unable to parse os-release ({}) line: {line}", path.display()),
            }
        }

        Self(fields)
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn pretty_name(&self) -> Option<&str> {
        self.get("PRETTY_NAME")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn os_release_quote_stripping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("os-release");
        std::fs::write(
            &path,
            "NAME=\"Router OS\"\nPRETTY_NAME=\"Router OS 6.0\"\nID=router\n",
        )
        .unwrap();

        let parsed = OsRelease::read(&path);
        assert_eq!(parsed.pretty_name(), Some("Router OS 6.0"));
        assert_eq!(parsed.get("ID"), Some("router"));
        assert_eq!(parsed.get("MISSING"), None);
    }

    #[test]
    fn layout_paths() {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open(dir.path());

        assert_eq!(
            installation.status_file(),
            dir.path().join("usr/lib/opkg/status")
        );
        assert_eq!(
            installation.journal_path(),
            dir.path().join("usr/share/updater/journal")
        );
        assert!(installation.unpacked_dir().is_dir());
        assert!(!installation.is_system_root());
    }
}
