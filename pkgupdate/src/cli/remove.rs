// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::{arg, ArgMatches, Command};
use log::info;
use thiserror::Error;

use pkgupdate::package::Name;
use pkgupdate::transaction::{self, Options, Transaction};
use pkgupdate::{db, Database, Installation};

pub fn command() -> Command {
    Command::new("remove")
        .about("Remove installed packages")
        .arg(arg!(<NAME> ... "Packages to remove"))
}

pub fn handle(args: &ArgMatches) -> Result<(), Error> {
    let root = args.get_one::<String>("root").expect("has default");

    let installation = Installation::open(root);
    if installation.read_only() {
        return Err(Error::ReadOnly);
    }

    let mut database = Database::open(&installation)?;
    let removes: Vec<Name> = args
        .get_many::<String>("NAME")
        .expect("required argument")
        .map(|name| Name::from(name.as_str()))
        .collect();

    let transaction = Transaction::new(
        &installation,
        &mut database,
        Vec::new(),
        removes,
        Options::default(),
    )?;
    let summary = transaction.apply()?;

    for name in &summary.removed {
        info!("Removed: {name}");
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("root directory is not writable")]
    ReadOnly,
    #[error("database")]
    Db(#[from] db::Error),
    #[error("transaction")]
    Transaction(#[from] transaction::Error),
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Transaction(error) => error.exit_code(),
            _ => 1,
        }
    }
}
