// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

//! Reader for the nested package archive format.
//!
//! A package is an outer tape archive carrying two compressed sub-archives:
//! `control.tar.*` with the package metadata and maintainer scripts, and
//! `data.tar.*` with the files to be installed. Compression of the outer
//! archive and of each sub-archive is autodetected independently.

use std::io;

use thiserror::Error;

pub use self::decompress::{decompress, Decompress};
pub use self::read::{extract_to_memory, file_size, hash_file, list, sanitize_name, unpack, Member, MemberKind};

pub mod decompress;
pub mod read;

/// The two sub-archives every package carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inner {
    Control,
    Data,
}

impl Inner {
    /// Sanitized member name prefix inside the outer archive
    fn stem(&self) -> &'static str {
        match self {
            Inner::Control => "./control.tar",
            Inner::Data => "./data.tar",
        }
    }

    /// Directory name used when unpacking below a destination root
    pub fn dir_name(&self) -> &'static str {
        match self {
            Inner::Control => "control",
            Inner::Data => "data",
        }
    }

    /// Match a sanitized member name, with or without a compression suffix
    fn matches(&self, sanitized: &str) -> bool {
        match sanitized.strip_prefix(self.stem()) {
            Some("") => true,
            Some(rest) => rest.starts_with('.'),
            None => false,
        }
    }
}

/// Digest selection for [`hash_file`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Md5,
    Sha256,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsafe member path: {0}")]
    UnsafePath(String),
    #[error("missing sub-archive: {0}")]
    MissingInner(&'static str),
    #[error("no such member: {0}")]
    MissingMember(String),
    #[error("io")]
    Io(#[from] io::Error),
}
