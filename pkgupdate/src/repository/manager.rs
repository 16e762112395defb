// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

//! Repository index retrieval and package downloads.
//!
//! Every index is fetched with the repository's verification policy and
//! parsed into candidate metadata. Package archives land in the
//! download cache and are checked against the content hash the index
//! declared for them.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;

use log::{debug, info};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::environment;
use crate::fetch::{self, DownloadOpts, Downloader, Uri};
use crate::package::{Meta, Name};
use crate::repository::{Id, Map, Repository};
use crate::{db::stanza, Installation};

/// An active repository whose index has been fetched and parsed
#[derive(Debug)]
pub struct Active {
    pub id: Id,
    pub repository: Repository,
    index: HashMap<Name, Meta>,
}

/// All configured repositories, ready for candidate lookup
#[derive(Debug, Default)]
pub struct Manager {
    repositories: Vec<Active>,
}

impl Manager {
    /// Fetch and verify every configured repository index
    pub fn fetch(installation: &Installation, map: Map, parallel: usize) -> Result<Self, Error> {
        let mut downloader = Downloader::with_opts(
            parallel,
            DownloadOpts {
                user_agent: environment::user_agent(installation),
                ..Default::default()
            },
        );

        let mut pending = Vec::new();
        for (id, repository) in map {
            let base = base_uri(&repository)?;
            let index = match &repository.index {
                Some(explicit) => Uri::new(explicit, Some(&base))?,
                None => Uri::new("Packages", Some(&base))?,
            };
            index
                .register(&mut downloader)
                .map_err(|source| Error::Fetch {
                    uri: index.canonical(),
                    source,
                })?;

            pending.push((id, repository, index));
        }

        if let Some(failed) = downloader.run() {
            let source = failed.finish().expect_err("reported as failed");
            return Err(Error::Fetch {
                uri: failed.canonical(),
                source,
            });
        }

        let mut repositories = Vec::new();
        for (id, repository, index) in pending {
            let content = index.finish().map_err(|source| Error::Fetch {
                uri: index.canonical(),
                source,
            })?;
            let bytes = content.into_buffer().expect("index uses a buffer sink");

            let parsed = parse_index(&bytes)?;
            info!("Repository {id}: {} candidate packages", parsed.len());
            repositories.push(Active {
                id,
                repository,
                index: parsed,
            });
        }

        // Higher priority first, alias as the tie break
        repositories.sort_by(|a, b| {
            a.repository
                .priority
                .cmp(&b.repository.priority)
                .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
        });

        Ok(Self { repositories })
    }

    pub fn repositories(&self) -> impl Iterator<Item = &Active> {
        self.repositories.iter()
    }

    /// Best candidate for `name` across repositories, in priority order
    pub fn lookup(&self, name: &Name) -> Option<(&Active, &Meta)> {
        self.repositories
            .iter()
            .find_map(|active| active.index.get(name).map(|meta| (active, meta)))
    }

    /// Download the archives for the requested packages into the cache,
    /// reusing cached files whose content hash still matches.
    pub fn fetch_packages(
        &self,
        installation: &Installation,
        names: &[Name],
        parallel: usize,
    ) -> Result<Vec<Download>, Error> {
        let mut downloader = Downloader::with_opts(
            parallel,
            DownloadOpts {
                user_agent: environment::user_agent(installation),
                ..Default::default()
            },
        );

        let mut downloads = Vec::new();
        let mut transfers = Vec::new();

        for name in names {
            let (active, meta) = self.lookup(name).ok_or_else(|| Error::NoCandidate(name.clone()))?;
            let filename = meta
                .filename
                .clone()
                .ok_or_else(|| Error::NoDownloadUri(name.clone()))?;
            let expected = meta
                .sha256
                .clone()
                .ok_or_else(|| Error::NoHash(name.clone()))?;

            let path = installation
                .download_dir()
                .join(format!("{}_{}.ipk", meta.name, meta.version));

            if path.is_file() && sha256_hex(&path)? == expected {
                debug!("Using cached archive for {name}");
                downloads.push(Download {
                    meta: meta.clone(),
                    path,
                    was_cached: true,
                });
                continue;
            }

            let uri = Uri::new(&filename, Some(&base_uri(&active.repository)?))?;
            // The index vouched for the content hash, no per-file signature
            uri.clear_pubkeys();
            uri.set_output_file(&path)?;
            uri.register(&mut downloader).map_err(|source| Error::Fetch {
                uri: uri.canonical(),
                source,
            })?;

            transfers.push((meta.clone(), path, expected, uri));
        }

        if let Some(failed) = downloader.run() {
            let source = failed.finish().expect_err("reported as failed");
            return Err(Error::Fetch {
                uri: failed.canonical(),
                source,
            });
        }

        for (meta, path, expected, uri) in transfers {
            uri.finish().map_err(|source| Error::Fetch {
                uri: uri.canonical(),
                source,
            })?;

            let got = sha256_hex(&path)?;
            if got != expected {
                let _ = std::fs::remove_file(&path);
                return Err(Error::Integrity {
                    package: meta.name.clone(),
                    expected,
                    got,
                });
            }

            downloads.push(Download {
                meta,
                path,
                was_cached: false,
            });
        }

        Ok(downloads)
    }
}

/// A package archive present in the download cache
#[derive(Debug, Clone)]
pub struct Download {
    pub meta: Meta,
    pub path: PathBuf,
    pub was_cached: bool,
}

/// Base URI carrying the repository's verification policy
fn base_uri(repository: &Repository) -> Result<Uri, fetch::Error> {
    let mut base_str = repository.uri.to_string();
    if !base_str.ends_with('/') {
        base_str.push('/');
    }

    let base = Uri::new(&base_str, None)?;
    base.set_ca_pin(repository.ca_pin);
    for pem in &repository.pems {
        base.add_pem(pem)?;
    }
    for pubkey in &repository.pubkeys {
        base.add_pubkey(pubkey)?;
    }

    Ok(base)
}

fn parse_index(bytes: &[u8]) -> Result<HashMap<Name, Meta>, Error> {
    let content = String::from_utf8_lossy(bytes);
    let mut index = HashMap::new();

    for stanza in stanza::parse(&content)? {
        let meta = Meta::from_stanza(&stanza)?;
        index.insert(meta.name.clone(), meta);
    }

    Ok(index)
}

fn sha256_hex(path: &std::path::Path) -> Result<String, Error> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("uri")]
    Uri(#[from] fetch::Error),
    #[error("fetching {uri}")]
    Fetch {
        uri: String,
        #[source]
        source: fetch::Error,
    },
    #[error("index syntax")]
    Index(#[from] stanza::Error),
    #[error("index metadata")]
    Meta(#[from] crate::package::meta::Error),
    #[error("no repository provides package {0}")]
    NoCandidate(Name),
    #[error("package {0} has no download location in the index")]
    NoDownloadUri(Name),
    #[error("package {0} has no content hash in the index")]
    NoHash(Name),
    #[error("content hash mismatch for {package}: expected {expected}, got {got}")]
    Integrity {
        package: Name,
        expected: String,
        got: String,
    },
    #[error("io")]
    Io(#[from] std::io::Error),
}
