//! Cooperative shutdown.
//!
//! Termination requests (SIGINT/SIGTERM) set a single shared flag. Workers
//! check it at loop boundaries; nothing is preempted. A blocking frame read
//! therefore delays shutdown by at most that read's own timeout.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared, atomically observed stop flag.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sets the flag. Returns `true` only for the call that flipped it.
    fn raise(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

/// Owns the stop flag and turns external termination requests into it.
#[derive(Clone, Debug, Default)]
pub struct ShutdownController {
    stop: StopFlag,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle handed to supervisors.
    pub fn flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Requests shutdown. Idempotent: only the first call has any effect and
    /// returns `true`.
    ///
    /// Only the flag is raised here; the handler never touches the relay
    /// process. That process is owned by the relay loop, which sees the flag
    /// within one poll interval and terminates it exactly once.
    pub fn request_stop(&self) -> bool {
        if self.stop.raise() {
            log::info!("shutdown requested; stopping after current operation");
            true
        } else {
            log::debug!("shutdown already requested; ignoring repeated signal");
            false
        }
    }

    /// Routes SIGINT and SIGTERM to [`request_stop`](Self::request_stop).
    ///
    /// Can only be installed once per process.
    pub fn install_signal_handler(&self) -> Result<()> {
        let controller = self.clone();
        ctrlc::set_handler(move || {
            controller.request_stop();
        })
        .context("install SIGINT/SIGTERM handler")
    }
}
