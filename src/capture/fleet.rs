//! Starts one capture supervisor thread per camera.
//!
//! Cameras share nothing: each thread owns its supervisor, frame source and
//! segment sink. A panic that escapes a supervisor is caught and logged at
//! that camera's thread boundary and never reaches the runner or a sibling.

use anyhow::{anyhow, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Duration;

use super::{panic_message, CameraSession, CaptureSupervisor};
use crate::clock::{Clock, SystemClock};
use crate::ingest::FrameSource;
use crate::lifecycle::StopFlag;
use crate::record::SegmentSink;

/// Delay between camera starts. Only keeps start-up logs readable.
pub const DEFAULT_STAGGER: Duration = Duration::from_millis(500);

pub struct FleetHandle {
    workers: Vec<(String, JoinHandle<()>)>,
}

impl FleetHandle {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn camera_ids(&self) -> Vec<&str> {
        self.workers.iter().map(|(id, _)| id.as_str()).collect()
    }

    /// Waits for every camera thread. Returns once the stop flag has been
    /// observed by all supervisors.
    pub fn join(self) {
        for (id, worker) in self.workers {
            if worker.join().is_err() {
                log::error!("cam {}: thread terminated abnormally", id);
            }
        }
    }
}

/// Builds and starts a supervisor for every session.
///
/// `build` runs on the calling thread; each supervisor then moves onto its
/// own named thread (`cam-{id}`). A camera whose thread cannot be spawned is
/// logged and skipped. Fails only if no camera could be started.
pub fn start_fleet<S, K, C, F>(
    sessions: Vec<CameraSession>,
    stop: &StopFlag,
    stagger: Duration,
    mut build: F,
) -> Result<FleetHandle>
where
    S: FrameSource + 'static,
    K: SegmentSink + 'static,
    C: Clock + 'static,
    F: FnMut(CameraSession) -> CaptureSupervisor<S, K, C>,
{
    let total = sessions.len();
    let mut workers = Vec::with_capacity(total);

    for (index, session) in sessions.into_iter().enumerate() {
        if stop.is_set() {
            break;
        }
        if index > 0 && !stagger.is_zero() && !SystemClock.pause(stagger, stop) {
            break;
        }

        let id = session.id.clone();
        log::info!("initializing camera {} with url {}", id, session.url);
        let mut supervisor = build(session);
        let thread_id = id.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("cam-{}", id))
            .spawn(move || {
                log::info!("cam {}: thread starting", thread_id);
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| supervisor.run())) {
                    log::error!(
                        "cam {}: thread encountered an error: {}",
                        thread_id,
                        panic_message(payload.as_ref())
                    );
                }
                log::info!("cam {}: thread exiting", thread_id);
            });
        match spawned {
            Ok(worker) => workers.push((id, worker)),
            Err(err) => log::error!("cam {}: failed to start capture thread: {}", id, err),
        }
    }

    if workers.is_empty() && total > 0 && !stop.is_set() {
        return Err(anyhow!("none of {} capture threads could be started", total));
    }
    Ok(FleetHandle { workers })
}
