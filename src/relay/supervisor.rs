//! Relay loop: publish the stored segments as a looping RTSP stream and keep
//! the transport alive.
//!
//! ```text
//! Idle -> BuildingPlaylist -> Streaming -> Backoff -> BuildingPlaylist ...
//!                                             \-> Terminated
//! ```
//!
//! The playlist is rebuilt for every attempt so newly recorded segments are
//! picked up on restart. Only one transport process exists at a time; it is
//! owned by [`RelayAttempt`] on this loop's stack and is terminated exactly
//! once when the stop flag is observed.

use std::path::PathBuf;
use std::time::Duration;

use super::backoff::Backoff;
use super::playlist::Playlist;
use super::process::{relay_argv, ProcessState, TransportLauncher, TransportProcess};
use crate::clock::Clock;
use crate::error::SupervisorError;
use crate::lifecycle::StopFlag;
use crate::record::SEGMENT_EXTENSION;

pub const DEFAULT_RELAY_URL: &str = "rtsp://localhost:8554/mystream";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Log target for lines the transport writes to stderr.
pub const DIAGNOSTICS_TARGET: &str = "vcr_relay::ffmpeg";

#[derive(Clone, Debug)]
pub struct RelaySettings {
    pub source_dir: PathBuf,
    pub url: String,
    pub ffmpeg: PathBuf,
    /// File extension (without the dot) of the media to relay.
    pub extension: String,
    pub backoff: Backoff,
    pub poll_interval: Duration,
}

impl RelaySettings {
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            url: DEFAULT_RELAY_URL.to_string(),
            ffmpeg: PathBuf::from("ffmpeg"),
            extension: SEGMENT_EXTENSION.to_string(),
            backoff: Backoff::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayPhase {
    Idle,
    BuildingPlaylist,
    Streaming,
    Backoff,
    Terminated,
}

/// How the relay loop ended.
#[derive(Debug)]
pub enum RelayOutcome {
    /// The transport exited with status 0.
    Clean,
    /// Operator-requested shutdown.
    Stopped,
    /// The retry cap was reached; `attempts` counts every launch.
    RetriesExhausted { attempts: u32 },
    /// The playlist could not be built. Nothing was launched for this attempt.
    ConfigFailed(SupervisorError),
}

impl RelayOutcome {
    /// Process exit status for the relay daemon.
    pub fn exit_code(&self) -> i32 {
        match self {
            RelayOutcome::Clean | RelayOutcome::Stopped => 0,
            RelayOutcome::RetriesExhausted { .. } | RelayOutcome::ConfigFailed(_) => 1,
        }
    }
}

/// One launch of the transport.
pub struct RelayAttempt<P> {
    pub index: u32,
    /// Backoff that preceded this launch.
    pub delay: Duration,
    pub process: P,
}

enum Streamed {
    Clean,
    Stopped,
    Failed(SupervisorError),
}

pub struct RelaySupervisor<L, C>
where
    L: TransportLauncher,
    C: Clock,
{
    settings: RelaySettings,
    launcher: L,
    clock: C,
    stop: StopFlag,
    attempt: u32,
    phase: RelayPhase,
}

impl<L, C> RelaySupervisor<L, C>
where
    L: TransportLauncher,
    C: Clock,
{
    pub fn new(settings: RelaySettings, launcher: L, clock: C, stop: StopFlag) -> Self {
        Self {
            settings,
            launcher,
            clock,
            stop,
            attempt: 0,
            phase: RelayPhase::Idle,
        }
    }

    /// Index of the current (or last) launch attempt, starting at 0.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn phase(&self) -> RelayPhase {
        self.phase
    }

    pub fn run(&mut self) -> RelayOutcome {
        log::info!(
            "relaying {}/*.{} to {}",
            self.settings.source_dir.display(),
            self.settings.extension,
            self.settings.url
        );
        let mut delay = Duration::ZERO;
        loop {
            if self.stop.is_set() {
                return self.finish(RelayOutcome::Stopped);
            }

            self.phase = RelayPhase::BuildingPlaylist;
            let playlist = match Playlist::build(&self.settings.source_dir, &self.settings.extension)
            {
                Ok(playlist) => playlist,
                Err(err) if err.is_fatal() => {
                    log::error!("attempt {}: {}", self.attempt, err);
                    return self.finish(RelayOutcome::ConfigFailed(err));
                }
                Err(err) => {
                    log::error!("attempt {}: could not write playlist: {}", self.attempt, err);
                    return self.finish(RelayOutcome::ConfigFailed(SupervisorError::config(
                        err.to_string(),
                    )));
                }
            };
            log::info!(
                "attempt {}: playlist of {} files at {}",
                self.attempt,
                playlist.files().len(),
                playlist.manifest_path().display()
            );

            self.phase = RelayPhase::Streaming;
            let argv = relay_argv(&self.settings.ffmpeg, playlist.manifest_path(), &self.settings.url);
            let streamed = self.stream(&argv, delay);

            self.phase = RelayPhase::Backoff;
            if let Err(err) = playlist.discard() {
                log::warn!("attempt {}: could not remove playlist: {}", self.attempt, err);
            }

            let failure = match streamed {
                Streamed::Clean => {
                    log::info!("attempt {}: relay finished cleanly", self.attempt);
                    return self.finish(RelayOutcome::Clean);
                }
                Streamed::Stopped => return self.finish(RelayOutcome::Stopped),
                Streamed::Failed(err) => err,
            };

            if self.stop.is_set() {
                return self.finish(RelayOutcome::Stopped);
            }
            if self.settings.backoff.exhausted(self.attempt) {
                log::error!(
                    "{}; giving up after {} attempts",
                    failure,
                    self.attempt + 1
                );
                return self.finish(RelayOutcome::RetriesExhausted {
                    attempts: self.attempt + 1,
                });
            }

            delay = self.settings.backoff.delay(self.attempt);
            log::warn!("{}; restarting in {:?}", failure, delay);
            if !self.clock.pause(delay, &self.stop) {
                return self.finish(RelayOutcome::Stopped);
            }
            self.attempt = self.attempt.saturating_add(1);
        }
    }

    fn stream(&mut self, argv: &[String], delay: Duration) -> Streamed {
        let index = self.attempt;
        let process = match self.launcher.spawn(argv) {
            Ok(process) => process,
            Err(err) => {
                return Streamed::Failed(SupervisorError::Spawn {
                    attempt: index,
                    reason: format!("{:#}", err),
                })
            }
        };
        let mut attempt = RelayAttempt {
            index,
            delay,
            process,
        };
        if attempt.delay.is_zero() {
            log::info!("attempt {}: relay started", attempt.index);
        } else {
            log::info!(
                "attempt {}: relay restarted after {:?} backoff",
                attempt.index,
                attempt.delay
            );
        }

        loop {
            self.drain_diagnostics(&mut attempt.process);
            match attempt.process.poll() {
                Ok(ProcessState::Running) => {}
                Ok(ProcessState::Exited(Some(0))) => {
                    self.drain_diagnostics(&mut attempt.process);
                    return Streamed::Clean;
                }
                Ok(ProcessState::Exited(code)) => {
                    self.drain_diagnostics(&mut attempt.process);
                    return Streamed::Failed(SupervisorError::ProcessExit {
                        attempt: attempt.index,
                        code,
                    });
                }
                Err(err) => {
                    log::error!("attempt {}: lost track of relay process: {:#}", attempt.index, err);
                    let code = self.shut_down(&mut attempt);
                    return Streamed::Failed(SupervisorError::ProcessExit {
                        attempt: attempt.index,
                        code,
                    });
                }
            }

            if self.stop.is_set() {
                log::info!("attempt {}: stopping relay process", attempt.index);
                self.shut_down(&mut attempt);
                return Streamed::Stopped;
            }
            self.clock.sleep(self.settings.poll_interval);
        }
    }

    fn shut_down(&self, attempt: &mut RelayAttempt<L::Process>) -> Option<i32> {
        if let Err(err) = attempt.process.terminate() {
            log::warn!("attempt {}: terminate failed: {:#}", attempt.index, err);
        }
        let code = match attempt.process.wait() {
            Ok(code) => code,
            Err(err) => {
                log::warn!("attempt {}: wait failed: {:#}", attempt.index, err);
                None
            }
        };
        self.drain_diagnostics(&mut attempt.process);
        code
    }

    fn drain_diagnostics(&self, process: &mut L::Process) {
        while let Some(line) = process.read_diagnostic_line() {
            log::info!(target: DIAGNOSTICS_TARGET, "{}", line);
        }
    }

    fn finish(&mut self, outcome: RelayOutcome) -> RelayOutcome {
        self.phase = RelayPhase::Terminated;
        log::info!("relay terminated: {:?} (exit {})", outcome, outcome.exit_code());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ShutdownController;
    use crate::testing::{FakeLauncher, FakeRun, ManualClock};
    use chrono::NaiveDate;

    fn clock() -> ManualClock {
        ManualClock::starting_at(
            NaiveDate::from_ymd_opt(2026, 3, 7)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
        )
    }

    fn media_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ST01-1-20260307_120000.mp4"), b"").unwrap();
        dir
    }

    #[test]
    fn spawn_failures_back_off_like_exits() {
        let dir = media_dir();
        let (launcher, probe) = FakeLauncher::new(vec![
            FakeRun::fails_to_spawn(),
            FakeRun::exits_after(0, Some(0)),
        ]);
        let clock = clock();
        let mut settings = RelaySettings::new(dir.path());
        settings.backoff.base = Duration::from_secs(2);

        let mut relay = RelaySupervisor::new(settings, launcher, clock.clone(), StopFlag::new());
        assert_eq!(relay.phase(), RelayPhase::Idle);
        let outcome = relay.run();

        assert!(matches!(outcome, RelayOutcome::Clean));
        assert_eq!(relay.phase(), RelayPhase::Terminated);
        assert_eq!(relay.attempt(), 1);
        assert_eq!(probe.spawns().len(), 2);
        assert_eq!(clock.pauses(), vec![Duration::from_secs(2)]);
    }

    #[test]
    fn stop_during_backoff_ends_the_loop() {
        let dir = media_dir();
        let controller = ShutdownController::new();
        let (launcher, probe) = FakeLauncher::new(vec![
            FakeRun::exits_after(0, Some(1)).signal_at(0, controller.clone()),
            FakeRun::exits_after(0, Some(0)),
        ]);
        let clock = clock();

        let mut relay = RelaySupervisor::new(
            RelaySettings::new(dir.path()),
            launcher,
            clock.clone(),
            controller.flag(),
        );
        let outcome = relay.run();

        assert!(matches!(outcome, RelayOutcome::Stopped));
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(probe.spawns().len(), 1);
        assert_eq!(probe.terminations(), 0);
        assert!(clock.pauses().is_empty());
    }

    #[test]
    fn poll_interval_paces_the_streaming_loop() {
        let dir = media_dir();
        let (launcher, _probe) = FakeLauncher::new(vec![FakeRun::exits_after(3, Some(0))]);
        let clock = clock();

        let mut relay = RelaySupervisor::new(
            RelaySettings::new(dir.path()),
            launcher,
            clock.clone(),
            StopFlag::new(),
        );
        relay.run();

        assert_eq!(clock.sleeps(), vec![DEFAULT_POLL_INTERVAL; 3]);
    }

    #[test]
    fn exit_codes_follow_the_outcome() {
        assert_eq!(RelayOutcome::Clean.exit_code(), 0);
        assert_eq!(RelayOutcome::Stopped.exit_code(), 0);
        assert_eq!(RelayOutcome::RetriesExhausted { attempts: 4 }.exit_code(), 1);
        assert_eq!(
            RelayOutcome::ConfigFailed(SupervisorError::config("empty")).exit_code(),
            1
        );
    }
}
