// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::{Path, PathBuf};

use derive_more::{Display, From, Into};
use thiserror::Error;

pub use self::meta::{Dependency, Meta};

pub mod meta;

/// The name of a [`Package`], unique within a transaction
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into, Display)]
pub struct Name(String);

impl From<&str> for Name {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Recorded state of an installed package
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum State {
    #[strum(serialize = "installed")]
    Installed,
    #[strum(serialize = "half-installed")]
    HalfInstalled,
    #[strum(serialize = "half-removed")]
    HalfRemoved,
}

/// Maintainer script lifecycle phases, named by their on-disk script files
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum Phase {
    #[strum(serialize = "preinst")]
    PreInstall,
    #[strum(serialize = "postinst")]
    PostInstall,
    #[strum(serialize = "prerm")]
    PreRemove,
    #[strum(serialize = "postrm")]
    PostRemove,
}

/// A package staged for installation: parsed control metadata bound to
/// the archive it was read from.
#[derive(Debug, Clone)]
pub struct Package {
    pub meta: Meta,
    /// The downloaded archive on disk
    pub archive: PathBuf,
    /// Paths the data tree installs, relative to the root (`usr/bin/tool`)
    pub files: Vec<PathBuf>,
    /// Declared configuration files, as written in the control archive (`/etc/config`)
    pub conffiles: Vec<PathBuf>,
}

impl Package {
    /// Parse a package archive's control metadata and data-file manifest
    pub fn from_archive(archive: impl Into<PathBuf>) -> Result<Self, Error> {
        let archive = archive.into();

        let control = ipk::extract_to_memory(&archive, ipk::Inner::Control, "control")?;
        let control = String::from_utf8_lossy(&control);
        let meta = Meta::from_control(&control)?;

        let conffiles = match ipk::extract_to_memory(&archive, ipk::Inner::Control, "conffiles") {
            Ok(listing) => String::from_utf8_lossy(&listing)
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| PathBuf::from(line.trim()))
                .collect(),
            Err(ipk::Error::MissingMember(_)) => Vec::new(),
            Err(error) => return Err(error.into()),
        };

        let files = ipk::list(&archive, ipk::Inner::Data)?
            .into_iter()
            .filter(|member| member.kind != ipk::MemberKind::Directory)
            .map(|member| PathBuf::from(member.name.trim_start_matches("./")))
            .collect();

        Ok(Self {
            meta,
            archive,
            files,
            conffiles,
        })
    }

    /// Whether `path` (relative to the root) is one of this package's conffiles
    pub fn is_conffile(&self, path: &Path) -> bool {
        let absolute = Path::new("/").join(path);
        self.conffiles.iter().any(|conffile| conffile == &absolute)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("package archive")]
    Archive(#[from] ipk::Error),
    #[error("control metadata")]
    Meta(#[from] meta::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_and_phase_names() {
        assert_eq!(State::Installed.to_string(), "installed");
        assert_eq!(State::HalfInstalled.to_string(), "half-installed");
        assert_eq!("half-removed".parse::<State>().unwrap(), State::HalfRemoved);

        assert_eq!(Phase::PreInstall.to_string(), "preinst");
        assert_eq!(Phase::PostRemove.to_string(), "postrm");
    }
}
