// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::{ArgMatches, Command};
use log::info;
use thiserror::Error;

use pkgupdate::transaction;
use pkgupdate::{db, Database, Installation};

pub fn command() -> Command {
    Command::new("recover").about("Replay the journal of an interrupted transaction")
}

pub fn handle(args: &ArgMatches) -> Result<(), Error> {
    let root = args.get_one::<String>("root").expect("has default");

    let installation = Installation::open(root);
    if installation.read_only() {
        return Err(Error::ReadOnly);
    }

    let mut database = Database::open(&installation)?;
    let summary = transaction::recover(&installation, &mut database)?;

    if summary.installed.is_empty() && summary.removed.is_empty() {
        info!("Nothing to recover");
    }
    for name in &summary.installed {
        info!("Recovered install: {name}");
    }
    for name in &summary.removed {
        info!("Recovered removal: {name}");
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("root directory is not writable")]
    ReadOnly,
    #[error("database")]
    Db(#[from] db::Error),
    #[error("recovery")]
    Recovery(#[from] transaction::Error),
}
