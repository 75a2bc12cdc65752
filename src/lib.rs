//! VCR supervisor
//!
//! Keeps long-running media sessions alive without operator intervention.
//!
//! # Architecture
//!
//! Two independent daemons share this library:
//!
//! - **Capture** (`vcrd`): one [`CaptureSupervisor`] per camera, each on its
//!   own thread, pulls frames from an RTSP source and writes them into
//!   rotating, timestamped MP4 segments. A camera that fails reconnects on
//!   its own; siblings are unaffected.
//! - **Relay** (`vcr_relay`): a single [`RelaySupervisor`] loops the stored
//!   segments through an external ffmpeg process as an RTSP stream and
//!   restarts it with exponential backoff.
//!
//! Both observe one cooperative [`StopFlag`] driven by SIGINT/SIGTERM.
//!
//! # Module Structure
//!
//! - `capture`: camera sessions, the per-camera state machine and the fleet runner
//! - `ingest`: frame sources (synthetic, GStreamer, FFmpeg)
//! - `record`: segment naming and segment writers (ffmpeg encoder pipe)
//! - `relay`: playlist, transport process, backoff and the relay loop
//! - `lifecycle`, `clock`: shutdown flag and time, shared by both daemons
//! - `config`: file + environment configuration
//! - `testing`: scripted collaborators for exercising the supervisors

pub mod capture;
pub mod clock;
pub mod config;
pub mod error;
pub mod ingest;
pub mod lifecycle;
pub mod record;
pub mod relay;
pub mod testing;

mod subprocess;

pub use capture::{
    start_fleet, CameraSession, CapturePhase, CapturePolicy, CaptureStats, CaptureSupervisor,
    FleetHandle,
};
pub use clock::{Clock, SystemClock};
pub use config::{CaptureConfig, RelayConfig};
pub use error::SupervisorError;
pub use ingest::{Frame, FrameSource, Geometry, RtspConfig, RtspSource, StreamHandle};
pub use lifecycle::{ShutdownController, StopFlag};
pub use record::{FfmpegSegmentSink, FourCc, SegmentSink, SegmentWriter};
pub use relay::{
    Backoff, CommandLauncher, RelayOutcome, RelayPhase, RelaySettings, RelaySupervisor,
};
