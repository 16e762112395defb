// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

//! The installed-package database.
//!
//! The authoritative record lives in the text status file under the
//! root; per-package file lists, conffile lists and maintainer scripts
//! live in the info directory beside it. The database is only mutated
//! through journaled transaction steps and every rewrite is atomic.

use std::collections::BTreeMap;
use std::io;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use fs_err as fs;
use log::warn;
use thiserror::Error;

use crate::package::{Meta, Name, Phase, State};
use crate::Installation;

pub mod stanza;

/// One installed package
#[derive(Debug, Clone)]
pub struct Entry {
    pub meta: Meta,
    pub state: State,
    /// Conffile paths as declared (`/etc/config`) with their recorded
    /// content hash at install time
    pub conffiles: Vec<(PathBuf, String)>,
    /// Owned paths relative to the root (`usr/bin/tool`)
    pub files: Vec<PathBuf>,
}

/// Mapping from package name to its installed state and owned files
#[derive(Debug, Default)]
pub struct Database {
    packages: BTreeMap<Name, Entry>,
}

impl Database {
    /// Load the status file and per-package file lists. A missing status
    /// file yields an empty database (fresh root).
    pub fn open(installation: &Installation) -> Result<Self, Error> {
        let status_path = installation.status_file();
        let content = match fs::read_to_string(&status_path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => String::new(),
            Err(error) => return Err(Error::Io(error)),
        };

        let mut packages = BTreeMap::new();
        for stanza in stanza::parse(&content)? {
            let meta = Meta::from_stanza(&stanza)?;
            let state = parse_status(stanza.get("Status").unwrap_or_default())?;
            let conffiles = parse_conffiles(stanza.get("Conffiles").unwrap_or_default());
            let files = read_list(installation, &meta.name);

            packages.insert(
                meta.name.clone(),
                Entry {
                    meta,
                    state,
                    conffiles,
                    files,
                },
            );
        }

        Ok(Self { packages })
    }

    pub fn get(&self, name: &Name) -> Option<&Entry> {
        self.packages.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.packages.values()
    }

    /// The installed package owning `path` (relative to the root)
    pub fn owner_of(&self, path: &Path) -> Option<&Name> {
        self.packages
            .values()
            .find(|entry| entry.files.iter().any(|file| file == path))
            .map(|entry| &entry.meta.name)
    }

    pub fn insert(&mut self, entry: Entry) {
        self.packages.insert(entry.meta.name.clone(), entry);
    }

    pub fn set_state(&mut self, name: &Name, state: State) {
        if let Some(entry) = self.packages.get_mut(name) {
            entry.state = state;
        }
    }

    pub fn remove(&mut self, name: &Name) -> Option<Entry> {
        self.packages.remove(name)
    }

    /// Atomically rewrite the status file
    pub fn write(&self, installation: &Installation) -> Result<(), Error> {
        let status_path = installation.status_file();
        let dir = status_path.parent().expect("status file has a parent");
        fs::create_dir_all(dir)?;

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        for entry in self.packages.values() {
            write_stanza(temp.as_file_mut(), entry).map_err(|e| Error::Io(e.into()))?;
        }
        temp.as_file_mut().sync_data().map_err(|e| Error::Io(e.into()))?;
        temp.persist(&status_path).map_err(|e| Error::Io(e.error.into()))?;

        Ok(())
    }
}

fn parse_status(status: &str) -> Result<State, Error> {
    let state = status
        .split_whitespace()
        .last()
        .ok_or_else(|| Error::MalformedStatus(status.to_string()))?;
    state
        .parse()
        .map_err(|_| Error::MalformedStatus(status.to_string()))
}

fn parse_conffiles(value: &str) -> Vec<(PathBuf, String)> {
    value
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let path = parts.next()?;
            let hash = parts.next()?;
            Some((PathBuf::from(path), hash.to_string()))
        })
        .collect()
}

fn read_list(installation: &Installation, name: &Name) -> Vec<PathBuf> {
    let path = installation.info_dir().join(format!("{name}.list"));
    match fs::read_to_string(&path) {
        Ok(content) => content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| PathBuf::from(line.trim_start_matches('/')))
            .collect(),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(error) => {
            warn!("Unable to read file list for {name}: {error}");
            Vec::new()
        }
    }
}

fn write_stanza(out: &mut std::fs::File, entry: &Entry) -> io::Result<()> {
    let meta = &entry.meta;
    writeln!(out, "Package: {}", meta.name)?;
    writeln!(out, "Version: {}", meta.version)?;
    writeln!(out, "Architecture: {}", meta.architecture)?;
    if !meta.depends.is_empty() {
        let rendered: Vec<_> = meta.depends.iter().map(ToString::to_string).collect();
        writeln!(out, "Depends: {}", rendered.join(", "))?;
    }
    if !meta.conflicts.is_empty() {
        let rendered: Vec<_> = meta.conflicts.iter().map(ToString::to_string).collect();
        writeln!(out, "Conflicts: {}", rendered.join(", "))?;
    }
    writeln!(out, "Status: install user {}", entry.state)?;
    if !entry.conffiles.is_empty() {
        writeln!(out, "Conffiles:")?;
        for (path, hash) in &entry.conffiles {
            writeln!(out, " {} {hash}", path.display())?;
        }
    }
    writeln!(out)?;
    Ok(())
}

/// Write the per-package info files: the owned-file list and, when any
/// conffiles are declared, the conffile list.
pub fn write_info(
    installation: &Installation,
    name: &Name,
    files: &[PathBuf],
    conffiles: &[PathBuf],
) -> Result<(), Error> {
    let info = installation.info_dir();
    fs::create_dir_all(&info)?;

    let mut listing = String::new();
    for file in files {
        listing.push('/');
        listing.push_str(&file.to_string_lossy());
        listing.push('\n');
    }
    fs::write(info.join(format!("{name}.list")), listing)?;

    if conffiles.is_empty() {
        let _ = fs::remove_file(info.join(format!("{name}.conffiles")));
    } else {
        let mut listing = String::new();
        for conffile in conffiles {
            listing.push_str(&conffile.to_string_lossy());
            listing.push('\n');
        }
        fs::write(info.join(format!("{name}.conffiles")), listing)?;
    }

    Ok(())
}

/// Install a maintainer script from an unpacked control tree into the
/// info directory, marking it executable.
pub fn install_script(
    installation: &Installation,
    name: &Name,
    phase: Phase,
    control_dir: &Path,
) -> Result<bool, Error> {
    let source = control_dir.join(phase.to_string());
    if !source.is_file() {
        return Ok(false);
    }

    let target = script_path(installation, name, phase);
    fs::create_dir_all(installation.info_dir())?;
    fs::copy(&source, &target)?;
    fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))?;

    Ok(true)
}

/// On-disk path of an installed maintainer script
pub fn script_path(installation: &Installation, name: &Name, phase: Phase) -> PathBuf {
    installation.info_dir().join(format!("{name}.{phase}"))
}

/// Drop every info file belonging to a package
pub fn remove_info(installation: &Installation, name: &Name) -> Result<(), Error> {
    let info = installation.info_dir();
    let mut doomed = vec![
        info.join(format!("{name}.list")),
        info.join(format!("{name}.conffiles")),
    ];
    for phase in [
        Phase::PreInstall,
        Phase::PostInstall,
        Phase::PreRemove,
        Phase::PostRemove,
    ] {
        doomed.push(script_path(installation, name, phase));
    }

    for path in doomed {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(Error::Io(error)),
        }
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("stanza syntax")]
    Stanza(#[from] stanza::Error),
    #[error("package metadata")]
    Meta(#[from] crate::package::meta::Error),
    #[error("malformed Status field: {0}")]
    MalformedStatus(String),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_entry(name: &str, state: State) -> Entry {
        Entry {
            meta: Meta {
                name: Name::from(name),
                version: "1.0-r1".to_string(),
                architecture: "all".to_string(),
                depends: vec!["libc".parse().unwrap()],
                conflicts: vec![],
                filename: None,
                sha256: None,
                size: None,
            },
            state,
            conffiles: vec![(PathBuf::from("/etc/demo.conf"), "ab12".to_string())],
            files: vec![PathBuf::from("usr/bin/demo"), PathBuf::from("etc/demo.conf")],
        }
    }

    #[test]
    fn status_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open(dir.path());

        let mut db = Database::default();
        db.insert(sample_entry("demo", State::Installed));
        db.insert(sample_entry("aux", State::HalfInstalled));
        write_info(
            &installation,
            &Name::from("demo"),
            &[PathBuf::from("usr/bin/demo"), PathBuf::from("etc/demo.conf")],
            &[PathBuf::from("/etc/demo.conf")],
        )
        .unwrap();
        db.write(&installation).unwrap();

        let reloaded = Database::open(&installation).unwrap();
        let demo = reloaded.get(&Name::from("demo")).unwrap();
        assert_eq!(demo.state, State::Installed);
        assert_eq!(demo.meta.version, "1.0-r1");
        assert_eq!(demo.conffiles, vec![(PathBuf::from("/etc/demo.conf"), "ab12".into())]);
        assert_eq!(
            demo.files,
            vec![PathBuf::from("usr/bin/demo"), PathBuf::from("etc/demo.conf")]
        );
        assert_eq!(
            reloaded.get(&Name::from("aux")).unwrap().state,
            State::HalfInstalled
        );
    }

    #[test]
    fn owner_lookup() {
        let mut db = Database::default();
        db.insert(sample_entry("demo", State::Installed));

        assert_eq!(
            db.owner_of(Path::new("usr/bin/demo")),
            Some(&Name::from("demo"))
        );
        assert_eq!(db.owner_of(Path::new("usr/bin/other")), None);
    }

    #[test]
    fn missing_status_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open(dir.path());

        let db = Database::open(&installation).unwrap();
        assert_eq!(db.iter().count(), 0);
    }
}
