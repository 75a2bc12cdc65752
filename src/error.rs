//! Failure taxonomy for the capture and relay supervisors.
//!
//! Collaborators (frame sources, segment writers, transport processes) report
//! failures as `anyhow::Error`; the supervisors classify them into
//! [`SupervisorError`] so every log line names the failure class and the retry
//! policy that applies to it.
//!
//! - **Fatal**: [`Config`](SupervisorError::Config), raised before any worker
//!   starts or while building a relay playlist. Never retried.
//! - **Recoverable, fixed delay**: [`Connection`](SupervisorError::Connection),
//!   [`Write`](SupervisorError::Write).
//! - **Recoverable, bounded**: [`StreamValidation`](SupervisorError::StreamValidation)
//!   escalates to a full reconnect once its attempts run out.
//! - **Recoverable, exponential backoff**: [`ProcessExit`](SupervisorError::ProcessExit),
//!   [`Spawn`](SupervisorError::Spawn).
//!
//! Operator-requested shutdown is not an error; it surfaces as
//! [`RelayOutcome::Stopped`](crate::relay::RelayOutcome::Stopped).

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Missing or invalid configuration, including an unusable relay source directory.
    #[error("configuration error: {0}")]
    Config(String),

    /// The frame source could not be opened.
    #[error("connection to {url} failed: {reason}")]
    Connection { url: String, reason: String },

    /// No frame with usable geometry arrived within the validation window.
    #[error("no valid frame after {attempts} attempts")]
    StreamValidation { attempts: u32 },

    /// A segment writer could not be opened or rejected a frame.
    #[error("segment write failed for {path}: {reason}")]
    Write { path: String, reason: String },

    /// The relay transport could not be started.
    #[error("relay attempt {attempt} could not start: {reason}")]
    Spawn { attempt: u32, reason: String },

    /// The relay transport exited with a failure status.
    #[error("relay attempt {attempt} exited with {}", exit_label(.code))]
    ProcessExit { attempt: u32, code: Option<i32> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Only configuration failures stop a supervisor outright.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "no status (terminated by signal)".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
