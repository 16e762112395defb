// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

//! User hook execution.
//!
//! Hooks are executable files in well-known directories under the root,
//! run in alphabetical order at defined lifecycle points. Hook output
//! goes to the unified log; a failing hook is reported, never fatal.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use log::{info, warn};
use thiserror::Error;

use crate::installation::Hook;
use crate::subprocess::Runner;
use crate::Installation;

/// Run every executable in the hook directory, exporting `ROOT_DIR` and
/// any extra environment provided.
pub async fn run(
    installation: &Installation,
    hook: Hook,
    extra_env: &[(&str, &str)],
) -> Result<(), Error> {
    let dir = installation.hook_dir(hook);
    if !dir.is_dir() {
        return Ok(());
    }

    for path in executables(&dir)? {
        info!("Running hook: {}", path.display());

        let mut runner = Runner::new(&path).env("ROOT_DIR", &installation.root);
        for (key, value) in extra_env {
            runner = runner.env(key, value);
        }

        match runner.run().await {
            Ok(output) => {
                let text = output.combined();
                for line in text.lines() {
                    info!("{}: {line}", path.display());
                }
                if !output.termination.success() {
                    warn!(
                        "Hook {} exited with code {}",
                        path.display(),
                        output.termination.code()
                    );
                }
            }
            Err(error) => warn!("Hook {} failed to run: {error}", path.display()),
        }
    }

    Ok(())
}

/// Executable regular files in `dir`, alphabetized
fn executables(dir: &Path) -> Result<Vec<std::path::PathBuf>, Error> {
    let mut paths = Vec::new();

    for entry in std::fs::read_dir(dir).map_err(|e| Error::List(dir.to_path_buf(), e))? {
        let entry = entry.map_err(|e| Error::List(dir.to_path_buf(), e))?;
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
            paths.push(entry.path());
        }
    }

    paths.sort();
    Ok(paths)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("listing hook directory {}", .0.display())]
    List(std::path::PathBuf, #[source] std::io::Error),
}
