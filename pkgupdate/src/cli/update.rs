// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::{arg, ArgMatches, Command};
use log::info;
use thiserror::Error;

use pkgupdate::package::{Name, Package};
use pkgupdate::repository::{self, Manager};
use pkgupdate::transaction::{self, Options, Transaction};
use pkgupdate::{db, Database, Installation};

pub fn command() -> Command {
    Command::new("update")
        .about("Install or upgrade packages from the configured repositories")
        .arg(arg!(<NAME> ... "Packages to install or upgrade"))
        .arg(arg!(--remove <NAME> ... "Packages to remove in the same transaction").required(false))
        .arg(
            arg!(--parallel <N> "Concurrent downloads")
                .required(false)
                .default_value("5")
                .value_parser(clap::value_parser!(usize)),
        )
}

pub fn handle(args: &ArgMatches) -> Result<(), Error> {
    let root = args.get_one::<String>("root").expect("has default");
    let parallel = *args.get_one::<usize>("parallel").expect("has default");

    let installation = Installation::open(root);
    if installation.read_only() {
        return Err(Error::ReadOnly);
    }

    let mut database = Database::open(&installation)?;

    let map = repository::Map::load(&installation.repositories_config())?;
    let manager = Manager::fetch(&installation, map, parallel)?;

    let names: Vec<Name> = args
        .get_many::<String>("NAME")
        .expect("required argument")
        .map(|name| Name::from(name.as_str()))
        .collect();
    let removes: Vec<Name> = args
        .get_many::<String>("remove")
        .unwrap_or_default()
        .map(|name| Name::from(name.as_str()))
        .collect();

    let downloads = manager.fetch_packages(&installation, &names, parallel)?;
    let packages = downloads
        .iter()
        .map(|download| Package::from_archive(&download.path))
        .collect::<Result<Vec<_>, _>>()?;

    let transaction = Transaction::new(&installation, &mut database, packages, removes, Options::default())?;
    let summary = transaction.apply()?;

    for name in &summary.installed {
        info!("Installed: {name}");
    }
    for name in &summary.removed {
        info!("Removed: {name}");
    }
    if summary.reboot_needed {
        info!("Reboot is required to finish this update");
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("root directory is not writable")]
    ReadOnly,
    #[error("database")]
    Db(#[from] db::Error),
    #[error("repository configuration")]
    Config(#[from] repository::Error),
    #[error("repository")]
    Repository(#[from] repository::manager::Error),
    #[error("package")]
    Package(#[from] pkgupdate::package::Error),
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
