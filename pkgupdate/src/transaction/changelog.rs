// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

//! Human-readable audit log written in parallel to the journal.
//!
//! Tab-separated, newline-terminated records. Script output follows its
//! `SCRIPT` record as pipe-prefixed lines. A changelog that cannot be
//! opened degrades to a warning; auditing never blocks an update.

use std::fs::{File, OpenOptions};
use std::io::Write;

use chrono::Utc;
use log::{debug, warn};

use crate::package::Phase;
use crate::Installation;

#[derive(Debug)]
pub struct Changelog {
    file: Option<File>,
}

impl Changelog {
    pub fn open(installation: &Installation) -> Self {
        let path = installation.changelog_path();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|error| {
                warn!("Unable to open changelog file ({}): {error}", path.display());
            })
            .ok();

        Self { file }
    }

    /// A changelog that records nothing, for abort paths that never
    /// reached the transaction proper
    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub fn transaction_start(&mut self) {
        let now = Utc::now().timestamp();
        debug!("Transaction start (at {now})");
        self.line(format_args!("START\t{now}"));
    }

    pub fn transaction_end(&mut self) {
        let now = Utc::now().timestamp();
        debug!("Transaction end (at {now})");
        self.line(format_args!("END\t{now}"));
    }

    /// Record a per-package version transition; empty strings stand in
    /// for "not installed" on either side.
    pub fn package(&mut self, name: &str, old_version: Option<&str>, new_version: Option<&str>) {
        debug!(
            "Package {name} ('{}' -> '{}')",
            old_version.unwrap_or_default(),
            new_version.unwrap_or_default()
        );
        self.line(format_args!(
            "PKG\t{name}\t{}\t{}",
            old_version.unwrap_or_default(),
            new_version.unwrap_or_default()
        ));
    }

    /// Record a maintainer-script failure with its captured output
    pub fn script_fail(&mut self, package: &str, phase: Phase, exit_code: i32, output: &str) {
        debug!("Script {phase} for package {package} exited with {exit_code}:\n{output}");
        self.line(format_args!("SCRIPT\t{package}\t{phase}\t{exit_code}"));
        for line in output.lines() {
            self.line(format_args!("|{line}"));
        }
    }

    pub fn sync(&mut self) {
        if let Some(file) = &mut self.file {
            let _ = file.flush();
            let _ = file.sync_data();
        }
    }

    fn line(&mut self, args: std::fmt::Arguments<'_>) {
        if let Some(file) = &mut self.file {
            let _ = writeln!(file, "{args}");
        }
    }
}
