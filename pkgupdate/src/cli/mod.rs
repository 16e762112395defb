// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::{Arg, ArgAction, Command};
use thiserror::Error;

use pkgupdate::runtime;

mod recover;
mod remove;
mod update;
mod version;

/// Generate the CLI command structure
fn command() -> Command {
    Command::new("pkgupdate")
        .about("Transactional package updater for embedded roots")
        .arg(
            Arg::new("version")
                .short('V')
                .long("version")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("root")
                .short('R')
                .long("root")
                .global(true)
                .help("Root directory of the target system")
                .action(ArgAction::Set)
                .default_value("/"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .help("Increase log verbosity, can be repeated")
                .action(ArgAction::Count),
        )
        .arg_required_else_help(true)
        .subcommand(update::command())
        .subcommand(remove::command())
        .subcommand(recover::command())
        .subcommand(version::command())
}

/// Process all CLI arguments
pub fn process() -> Result<(), Error> {
    let matches = command().get_matches();

    let level = match matches.get_count("verbose") {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if matches.get_flag("version") {
        version::print();
        return Ok(());
    }

    let _runtime = runtime::init();

    match matches.subcommand() {
        Some(("update", args)) => update::handle(args).map_err(Error::Update),
        Some(("remove", args)) => remove::handle(args).map_err(Error::Remove),
        Some(("recover", args)) => recover::handle(args).map_err(Error::Recover),
        Some(("version", _)) => {
            version::print();
            Ok(())
        }
        _ => unreachable!(),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("error handling update: {0}")]
    Update(#[source] update::Error),

    #[error("error handling remove: {0}")]
    Remove(#[source] remove::Error),

    #[error("error handling recover: {0}")]
    Recover(#[source] recover::Error),
}

impl Error {
    /// 1 for fatal errors, 2 when the journal demands recovery
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Update(error) => error.exit_code(),
            Error::Remove(error) => error.exit_code(),
            Error::Recover(_) => 1,
        }
    }
}
