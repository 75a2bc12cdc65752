//! Relay of stored segments back out as a looping RTSP stream.
//!
//! The relay shells out to an external transport (ffmpeg's concat demuxer)
//! and supervises it with exponential backoff. See [`RelaySupervisor`].

pub mod backoff;
pub mod playlist;
pub mod process;
pub mod supervisor;

pub use backoff::Backoff;
pub use playlist::{collect_media, manifest_entry, Playlist};
pub use process::{
    relay_argv, CommandLauncher, CommandProcess, ProcessState, TransportLauncher,
    TransportProcess,
};
pub use supervisor::{
    RelayAttempt, RelayOutcome, RelayPhase, RelaySettings, RelaySupervisor, DEFAULT_RELAY_URL,
};
