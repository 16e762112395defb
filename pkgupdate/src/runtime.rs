// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

//! Single-threaded cooperative scheduling.
//!
//! All concurrency in the updater comes from multiplexed I/O: parallel
//! network transfers and child-process pipes. Both are driven by one
//! current-thread reactor; there are no worker threads.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{OnceLock, RwLock};

use tokio::runtime;

static RUNTIME: OnceLock<RwLock<Option<Runtime>>> = OnceLock::new();
static HOLDERS: AtomicUsize = AtomicUsize::new(0);

/// Initialise the reactor, or join an already running one.
///
/// The reactor lives until the last [`Guard`] is dropped.
pub fn init() -> Guard {
    let lock = RUNTIME.get_or_init(Default::default);

    HOLDERS.fetch_add(1, Ordering::SeqCst);
    let mut slot = lock.write().unwrap();
    if slot.is_none() {
        *slot = Some(Runtime::new().expect("build runtime"));
    }

    Guard
}

/// The Guard provides a scoped token to utilise the reactor
#[must_use = "runtime is dropped with guard"]
pub struct Guard;

impl Drop for Guard {
    fn drop(&mut self) {
        if HOLDERS.fetch_sub(1, Ordering::SeqCst) == 1 {
            let rt = RUNTIME.get().unwrap().write().unwrap().take();
            drop(rt);
        }
    }
}

struct Runtime(runtime::Runtime);

impl Runtime {
    fn new() -> io::Result<Self> {
        Ok(Self(runtime::Builder::new_current_thread().enable_all().build()?))
    }
}

/// Run the provided future to completion on the reactor
pub fn block_on<T, F>(task: F) -> T
where
    F: Future<Output = T>,
{
    let guard = RUNTIME.get().expect("runtime initialized").read().unwrap();
    let rt = guard.as_ref().expect("runtime initialized");
    rt.0.block_on(task)
}
