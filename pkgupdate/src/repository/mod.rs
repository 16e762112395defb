// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::io;
use std::path::Path;

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub use self::manager::{Download, Manager};

pub mod manager;

/// A unique [`Repository`] identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From, Display)]
#[serde(from = "String")]
pub struct Id(String);

impl Id {
    pub fn new(identifier: String) -> Self {
        Self(
            identifier
                .chars()
                .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
                .collect(),
        )
    }
}

/// Repository configuration data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub description: String,
    /// Base URI package downloads resolve against
    pub uri: Url,
    /// Index URI; `<uri>/Packages` when not set
    #[serde(default)]
    pub index: Option<String>,
    /// Local URIs of public keys authorized to sign the index
    #[serde(default)]
    pub pubkeys: Vec<String>,
    /// Local URIs of pinned certificate material (CAs, CRLs)
    #[serde(default)]
    pub pems: Vec<String>,
    /// Exclude system CA bundles from the trust store
    #[serde(default)]
    pub ca_pin: bool,
    #[serde(default)]
    pub priority: Priority,
}

/// The selection priority of a [`Repository`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Into)]
pub struct Priority(u64);

impl Priority {
    pub fn new(priority: u64) -> Self {
        Self(priority)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(50)
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0).reverse()
    }
}

/// A map of repositories, loaded from the declarative configuration
/// under the root
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Map(HashMap<Id, Repository>);

impl Map {
    pub fn with(items: impl IntoIterator<Item = (Id, Repository)>) -> Self {
        Self(items.into_iter().collect())
    }

    /// Load the repository configuration; a missing file is an empty map
    pub fn load(path: &Path) -> Result<Self, Error> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(serde_yaml::from_str(&content)?),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(Error::Io(error)),
        }
    }

    pub fn get(&self, id: &Id) -> Option<&Repository> {
        self.0.get(id)
    }

    pub fn add(&mut self, id: Id, repo: Repository) {
        self.0.insert(id, repo);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Id, &Repository)> {
        self.0.iter()
    }
}

impl IntoIterator for Map {
    type Item = (Id, Repository);
    type IntoIter = std::collections::hash_map::IntoIter<Id, Repository>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("repository configuration")]
    Config(#[from] serde_yaml::Error),
    #[error("io")]
    Io(#[from] io::Error),
}
