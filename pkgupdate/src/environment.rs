// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

use crate::Installation;

pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Render the User-Agent reported to repository servers.
///
/// When updating a root other than `/` the host system is named first so
/// server side statistics can tell build hosts from live devices.
pub fn user_agent(installation: &Installation) -> String {
    let target = installation.os_release.pretty_name().unwrap_or("unknown");

    if installation.is_system_root() {
        format!("{NAME}/{VERSION} ({target})")
    } else {
        let host = installation.host_os_release.pretty_name().unwrap_or("unknown");
        format!("{NAME}/{VERSION} ({host}; {target})")
    }
}
