// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::db::stanza::Stanza;
use crate::package::Name;

/// The metadata of a package, parsed from a control file or a
/// repository index stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub name: Name,
    pub version: String,
    pub architecture: String,
    pub depends: Vec<Dependency>,
    pub conflicts: Vec<Dependency>,
    /// Index only: download path relative to the repository base
    pub filename: Option<String>,
    /// Index only: expected content hash of the archive
    pub sha256: Option<String>,
    /// Index only: download size in bytes
    pub size: Option<u64>,
}

impl Meta {
    pub fn from_stanza(stanza: &Stanza) -> Result<Self, Error> {
        Ok(Self {
            name: Name::from(required(stanza, "Package")?),
            version: required(stanza, "Version")?.to_string(),
            architecture: required(stanza, "Architecture")?.to_string(),
            depends: dependency_list(stanza.get("Depends"))?,
            conflicts: dependency_list(stanza.get("Conflicts"))?,
            filename: stanza.get("Filename").map(str::to_string),
            sha256: stanza.get("SHA256sum").map(str::to_string),
            size: stanza
                .get("Size")
                .map(|size| size.parse().map_err(|_| Error::MalformedField("Size")))
                .transpose()?,
        })
    }

    /// Parse the single stanza of a `control` file
    pub fn from_control(content: &str) -> Result<Self, Error> {
        let stanzas = crate::db::stanza::parse(content).map_err(Error::Stanza)?;
        let stanza = stanzas.first().ok_or(Error::Empty)?;
        Self::from_stanza(stanza)
    }
}

fn required<'a>(stanza: &'a Stanza, field: &'static str) -> Result<&'a str, Error> {
    stanza.get(field).ok_or(Error::MissingField(field))
}

fn dependency_list(value: Option<&str>) -> Result<Vec<Dependency>, Error> {
    value
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(Dependency::from_str)
                .collect()
        })
        .unwrap_or_else(|| Ok(Vec::new()))
}

/// A declared relation to another package, with an optional version
/// constraint: `name (>= 1.0)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub name: Name,
    pub constraint: Option<String>,
}

impl FromStr for Dependency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('(') {
            Some((name, rest)) => {
                let constraint = rest
                    .strip_suffix(')')
                    .ok_or_else(|| Error::MalformedDependency(s.to_string()))?;
                let name = name.trim();
                if name.is_empty() {
                    return Err(Error::MalformedDependency(s.to_string()));
                }
                Ok(Self {
                    name: Name::from(name),
                    constraint: Some(constraint.trim().to_string()),
                })
            }
            None => Ok(Self {
                name: Name::from(s.trim()),
                constraint: None,
            }),
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            Some(constraint) => write!(f, "{} ({constraint})", self.name),
            None => self.name.fmt(f),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no stanza present")]
    Empty,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("malformed field: {0}")]
    MalformedField(&'static str),
    #[error("malformed dependency: {0}")]
    MalformedDependency(String),
    #[error("stanza syntax")]
    Stanza(#[source] crate::db::stanza::Error),
}
