// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use fs_err::{self as fs, File};
use log::debug;
use nix::fcntl::{flock, FlockArg};
use thiserror::Error;

/// An acquired file lock guaranteeing exclusive access to the root
/// filesystem for the lifetime of a transaction.
///
/// The lock is released once all instances of this ref counted lock
/// are dropped.
#[derive(Debug, Clone)]
#[allow(unused)]
pub struct Lock(Arc<File>);

/// Acquire the advisory exclusive lock at `path` without blocking.
///
/// Another live holder means another transaction is running against the
/// same root; acquisition failure aborts before any state change.
pub fn acquire(path: impl Into<PathBuf>) -> Result<Lock, Error> {
    let path = path.into();
    debug!("Trying to get a lock at {}", path.display());

    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)?;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(_) => Ok(Lock(Arc::new(file))),
        Err(nix::errno::Errno::EWOULDBLOCK) => Err(Error::Held(path)),
        Err(e) => Err(Error::Flock(e)),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("another transaction holds the lock at {}", .0.display())]
    Held(PathBuf),
    #[error("obtaining exclusive file lock")]
    Flock(#[from] nix::Error),
}
