// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Command;

use pkgupdate::environment;

pub fn command() -> Command {
    Command::new("version").about("Print version info and exit")
}

pub fn print() {
    println!("{} {}", environment::NAME, environment::VERSION);
}
