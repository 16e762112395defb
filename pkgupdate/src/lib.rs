// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

pub use self::db::Database;
pub use self::fetch::{Downloader, Uri};
pub use self::installation::Installation;
pub use self::package::Package;
pub use self::repository::Repository;
pub use self::transaction::Transaction;

pub mod db;
pub mod environment;
pub mod fetch;
pub mod fsutil;
pub mod hooks;
pub mod installation;
pub mod package;
pub mod repository;
pub mod runtime;
pub mod signal;
pub mod subprocess;
pub mod transaction;
