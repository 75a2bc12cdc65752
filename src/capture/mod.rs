//! Per-camera capture: one supervisor per camera, run by the fleet.

use std::any::Any;
use std::path::PathBuf;
use std::time::Duration;

use crate::record::FourCc;

pub mod fleet;
pub mod supervisor;

pub use fleet::{start_fleet, FleetHandle};
pub use supervisor::{CapturePhase, CaptureSupervisor};

/// Immutable description of one camera's capture session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraSession {
    pub id: String,
    pub url: String,
    pub station: String,
    pub frame_rate: u32,
    /// Frames per segment (`frame_rate * segment_minutes * 60`).
    pub segment_frames: u64,
    pub output_dir: PathBuf,
}

impl CameraSession {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        station: impl Into<String>,
        frame_rate: u32,
        segment_minutes: u32,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            station: station.into(),
            frame_rate,
            segment_frames: segment_frames(frame_rate, segment_minutes),
            output_dir: output_dir.into(),
        }
    }
}

/// Segment length in frames. Rotation counts frames, not wall-clock time, so
/// a camera delivering below its nominal rate produces longer segments.
pub fn segment_frames(frame_rate: u32, segment_minutes: u32) -> u64 {
    (frame_rate as u64 * segment_minutes as u64 * 60).max(1)
}

/// Delays and limits of the capture state machine.
#[derive(Clone, Debug)]
pub struct CapturePolicy {
    /// Wait between failed connection attempts. Retried forever.
    pub reconnect_delay: Duration,
    /// Reads allowed to find a frame with usable geometry.
    pub validation_attempts: u32,
    pub validation_interval: Duration,
    /// Wait before retrying directory creation, writer creation or after a
    /// crash inside the state machine.
    pub retry_delay: Duration,
    pub codec: FourCc,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            validation_attempts: 5,
            validation_interval: Duration::from_secs(1),
            retry_delay: Duration::from_secs(5),
            codec: FourCc::MP4V,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub connects: u64,
    pub reconnects: u64,
    pub segments_opened: u64,
    pub frames_written: u64,
    pub recoveries: u64,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
