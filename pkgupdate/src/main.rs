// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

use log::error;

mod cli;

fn main() {
    let code = match cli::process() {
        Ok(()) => 0,
        Err(error) => {
            error!("{}", render(&error));
            error.exit_code()
        }
    };
    std::process::exit(code);
}

/// Single-line error summary including the source chain
fn render(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
