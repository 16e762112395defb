// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

//! Signal handling
//!
//! Interrupts received inside the transaction critical section must not
//! kill the process mid-step. The handlers installed here only note the
//! request; the engine polls [`interrupted`] between steps and aborts at
//! the next step boundary.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet};
use thiserror::Error;

pub use nix::sys::signal::Signal;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn note_interrupt(_signal: i32) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Defer the provided signals until [`Guard`] is dropped
pub fn defer(signals: impl IntoIterator<Item = Signal>) -> Result<Guard, Error> {
    INTERRUPTED.store(false, Ordering::SeqCst);

    Ok(Guard(
        signals
            .into_iter()
            .map(|signal| unsafe {
                let action = sigaction(
                    signal,
                    &SigAction::new(
                        SigHandler::Handler(note_interrupt),
                        SaFlags::SA_RESTART,
                        SigSet::empty(),
                    ),
                )
                .map_err(Error::Defer)?;

                Ok(PrevHandler { signal, action })
            })
            .collect::<Result<_, Error>>()?,
    ))
}

/// Whether a deferred signal has arrived since [`defer`] was called
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// A guard which restores the previous signal
/// handlers when dropped
pub struct Guard(Vec<PrevHandler>);

impl Drop for Guard {
    fn drop(&mut self) {
        for PrevHandler { signal, action } in &self.0 {
            unsafe {
                let _ = sigaction(*signal, action);
            };
        }
    }
}

struct PrevHandler {
    signal: Signal,
    action: SigAction,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("defer signal")]
    Defer(#[source] nix::Error),
}
