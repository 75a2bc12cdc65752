//! Capture state machine for a single camera.
//!
//! ```text
//! Connecting -> Validating -> Recording (rotating) -> Disconnected -> Connecting ...
//! ```
//!
//! Every failure path leads back to `Connecting`; the supervisor only leaves
//! the loop when the stop flag is raised. Each call to [`CaptureSupervisor::step`]
//! performs one transition (one connect attempt, one validation read or one
//! recorded frame), which keeps the stop flag observed at frame granularity.
//!
//! Resources are released before any retry delay. The stream handle and the
//! segment writer stay inside `self.state` while a transition runs, so the
//! panic boundary in [`CaptureSupervisor::run`] can still release them.

use std::panic::{catch_unwind, AssertUnwindSafe};

use super::{panic_message, CameraSession, CapturePolicy, CaptureStats};
use crate::clock::Clock;
use crate::error::SupervisorError;
use crate::ingest::{FrameSource, Geometry, StreamHandle};
use crate::lifecycle::StopFlag;
use crate::record::{SegmentFile, SegmentNamer, SegmentSink, SegmentWriter};

/// Observable phase of a capture supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapturePhase {
    Connecting,
    Validating,
    Recording,
    Disconnected,
    Stopped,
}

enum State<H, W> {
    Connecting {
        attempt: u64,
    },
    Validating {
        stream: H,
        attempt: u32,
    },
    Recording {
        stream: H,
        geometry: Geometry,
        segment: Option<ActiveSegment<W>>,
    },
    Disconnected,
    Stopped,
}

impl<H, W> State<H, W> {
    fn phase(&self) -> CapturePhase {
        match self {
            State::Connecting { .. } => CapturePhase::Connecting,
            State::Validating { .. } => CapturePhase::Validating,
            State::Recording { .. } => CapturePhase::Recording,
            State::Disconnected => CapturePhase::Disconnected,
            State::Stopped => CapturePhase::Stopped,
        }
    }
}

struct ActiveSegment<W> {
    file: SegmentFile,
    writer: W,
}

pub struct CaptureSupervisor<S, K, C>
where
    S: FrameSource,
    K: SegmentSink,
    C: Clock,
{
    session: CameraSession,
    source: S,
    sink: K,
    clock: C,
    policy: CapturePolicy,
    stop: StopFlag,
    namer: SegmentNamer,
    state: State<S::Stream, K::Writer>,
    stats: CaptureStats,
}

impl<S, K, C> CaptureSupervisor<S, K, C>
where
    S: FrameSource,
    K: SegmentSink,
    C: Clock,
{
    pub fn new(session: CameraSession, source: S, sink: K, clock: C, stop: StopFlag) -> Self {
        let namer = SegmentNamer::new(&session.output_dir, &session.station, &session.id);
        Self {
            session,
            source,
            sink,
            clock,
            policy: CapturePolicy::default(),
            stop,
            namer,
            state: State::Connecting { attempt: 0 },
            stats: CaptureStats::default(),
        }
    }

    pub fn with_policy(mut self, policy: CapturePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn phase(&self) -> CapturePhase {
        self.state.phase()
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    /// Runs until the stop flag is raised.
    ///
    /// A panic inside a transition is caught here: whatever the state held is
    /// released, the supervisor waits `retry_delay` and starts over from
    /// `Connecting`.
    pub fn run(&mut self) {
        log::info!(
            "cam {}: supervising {} (segment = {} frames @ {} fps)",
            self.session.id,
            self.session.url,
            self.session.segment_frames,
            self.session.frame_rate
        );
        while self.phase() != CapturePhase::Stopped {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.step())) {
                log::error!(
                    "cam {}: critical error: {}; restarting in {:?}",
                    self.session.id,
                    panic_message(payload.as_ref()),
                    self.policy.retry_delay
                );
                self.recover();
            }
        }
        log::info!(
            "cam {}: stopped after {} segments, {} frames, {} reconnects",
            self.session.id,
            self.stats.segments_opened,
            self.stats.frames_written,
            self.stats.reconnects
        );
    }

    /// Performs one transition and returns the resulting phase.
    pub fn step(&mut self) -> CapturePhase {
        if self.stop.is_set() {
            self.shutdown();
            return CapturePhase::Stopped;
        }
        match self.state {
            State::Connecting { attempt } => self.connect(attempt),
            State::Validating { attempt, .. } => self.validate(attempt),
            State::Recording {
                geometry,
                segment: None,
                ..
            } => self.begin_recording(geometry),
            State::Recording {
                geometry,
                segment: Some(_),
                ..
            } => self.record_frame(geometry),
            State::Disconnected => {
                self.stats.reconnects += 1;
                log::info!("cam {}: disconnected, reinitializing connection", self.session.id);
                self.state = State::Connecting { attempt: 0 };
            }
            State::Stopped => {}
        }
        self.phase()
    }

    fn connect(&mut self, attempt: u64) {
        log::info!(
            "cam {}: attempting to connect to {} (attempt {})",
            self.session.id,
            self.session.url,
            attempt + 1
        );
        let reason = match self.source.open(&self.session.url) {
            Ok(stream) => {
                self.state = State::Validating { stream, attempt: 0 };
                if self.stream_is_open() {
                    self.stats.connects += 1;
                    log::info!("cam {}: connected to stream", self.session.id);
                    return;
                }
                self.release_held();
                "stream closed right after opening".to_string()
            }
            Err(err) => format!("{:#}", err),
        };
        let err = SupervisorError::Connection {
            url: self.session.url.clone(),
            reason,
        };
        log::error!(
            "cam {}: {}; retrying in {:?}",
            self.session.id,
            err,
            self.policy.reconnect_delay
        );
        self.clock.pause(self.policy.reconnect_delay, &self.stop);
        self.state = State::Connecting {
            attempt: attempt + 1,
        };
    }

    fn validate(&mut self, attempt: u32) {
        let read = match &mut self.state {
            State::Validating { stream, .. } => stream.read(),
            _ => return,
        };
        let problem = match read {
            Ok(frame) if frame.geometry().is_valid() => {
                let geometry = frame.geometry();
                log::info!(
                    "cam {}: stream resolution confirmed: {}",
                    self.session.id,
                    geometry
                );
                if let State::Validating { stream, .. } =
                    std::mem::replace(&mut self.state, State::Disconnected)
                {
                    self.state = State::Recording {
                        stream,
                        geometry,
                        segment: None,
                    };
                }
                return;
            }
            Ok(frame) => format!("frame has no usable size ({})", frame.geometry()),
            Err(err) => format!("{:#}", err),
        };

        let attempt = attempt + 1;
        let remaining = self.policy.validation_attempts.saturating_sub(attempt);
        if remaining == 0 {
            let err = SupervisorError::StreamValidation { attempts: attempt };
            log::error!(
                "cam {}: {} ({}); reinitializing connection",
                self.session.id,
                err,
                problem
            );
            self.release_held();
            self.state = State::Connecting { attempt: 0 };
            return;
        }
        log::warn!(
            "cam {}: waiting for valid video stream ({}; {} retries left)",
            self.session.id,
            problem,
            remaining
        );
        self.clock
            .pause(self.policy.validation_interval, &self.stop);
        if let State::Validating { attempt: count, .. } = &mut self.state {
            *count = attempt;
        }
    }

    /// Ensures the output directory and opens the first segment on a
    /// validated stream. Failures here retry in place without touching the
    /// stream.
    fn begin_recording(&mut self, geometry: Geometry) {
        if let Err(err) = self.ensure_output_dir() {
            log::error!(
                "cam {}: directory creation failed for {}: {}; retrying in {:?}",
                self.session.id,
                self.session.output_dir.display(),
                err,
                self.policy.retry_delay
            );
            self.clock.pause(self.policy.retry_delay, &self.stop);
            return;
        }

        match self.open_segment(geometry) {
            Ok(segment) => self.hold_segment(segment),
            Err(err) => {
                log::error!(
                    "cam {}: failed to initialize video writer: {}; retrying in {:?}",
                    self.session.id,
                    err,
                    self.policy.retry_delay
                );
                self.clock.pause(self.policy.retry_delay, &self.stop);
            }
        }
    }

    fn record_frame(&mut self, geometry: Geometry) {
        let read = match &mut self.state {
            State::Recording { stream, .. } => stream.read(),
            _ => return,
        };
        let frame = match read {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!(
                    "cam {}: frame read error ({:#}), reinitializing connection",
                    self.session.id,
                    err
                );
                self.release_held();
                return;
            }
        };

        let segment = match &mut self.state {
            State::Recording {
                segment: Some(segment),
                ..
            } => segment,
            _ => return,
        };
        if let Err(err) = segment.writer.write(&frame) {
            let err = SupervisorError::Write {
                path: segment.file.path.display().to_string(),
                reason: format!("{:#}", err),
            };
            log::error!(
                "cam {}: {}; reopening segment in {:?}",
                self.session.id,
                err,
                self.policy.retry_delay
            );
            self.close_held_segment();
            if frame.geometry().is_valid() && frame.geometry() != geometry {
                log::warn!(
                    "cam {}: stream geometry changed {} -> {}",
                    self.session.id,
                    geometry,
                    frame.geometry()
                );
                if let State::Recording { geometry: held, .. } = &mut self.state {
                    *held = frame.geometry();
                }
            }
            self.clock.pause(self.policy.retry_delay, &self.stop);
            return;
        }
        segment.file.frames_written += 1;
        let full = segment.file.frames_written >= self.session.segment_frames;
        self.stats.frames_written += 1;
        if !full {
            return;
        }

        self.close_held_segment();
        match self.open_segment(geometry) {
            Ok(next) => self.hold_segment(next),
            Err(err) => {
                log::error!(
                    "cam {}: failed to create new video writer: {}; reinitializing connection",
                    self.session.id,
                    err
                );
                self.release_held();
            }
        }
    }

    fn stream_is_open(&self) -> bool {
        match &self.state {
            State::Validating { stream, .. } | State::Recording { stream, .. } => stream.is_open(),
            _ => false,
        }
    }

    fn hold_segment(&mut self, segment: ActiveSegment<K::Writer>) {
        if let State::Recording { segment: slot, .. } = &mut self.state {
            *slot = Some(segment);
        }
    }

    fn ensure_output_dir(&self) -> std::io::Result<()> {
        let dir = &self.session.output_dir;
        if !dir.is_dir() {
            log::info!(
                "cam {}: creating video directory: {}",
                self.session.id,
                dir.display()
            );
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    fn open_segment(
        &mut self,
        geometry: Geometry,
    ) -> Result<ActiveSegment<K::Writer>, SupervisorError> {
        let path = self.namer.next_path(self.clock.now());
        let write_error = |reason: String| SupervisorError::Write {
            path: path.display().to_string(),
            reason,
        };
        let writer = match self.sink.open(
            &path,
            self.policy.codec,
            self.session.frame_rate,
            geometry,
        ) {
            Ok(writer) if writer.is_open() => writer,
            Ok(mut writer) => {
                if let Err(err) = writer.release() {
                    log::debug!("cam {}: releasing unopened writer: {:#}", self.session.id, err);
                }
                return Err(write_error("writer did not open".to_string()));
            }
            Err(err) => return Err(write_error(format!("{:#}", err))),
        };
        self.stats.segments_opened += 1;
        log::info!("cam {}: recording segment {}", self.session.id, path.display());
        Ok(ActiveSegment {
            file: SegmentFile::new(path, geometry, self.session.frame_rate),
            writer,
        })
    }

    /// Finalizes the open segment, if any. The writer leaves the state only
    /// after its release returned.
    fn close_held_segment(&mut self) {
        if let State::Recording { segment: slot, .. } = &mut self.state {
            if let Some(segment) = slot.as_mut() {
                close_segment(&self.session.id, segment);
            }
            *slot = None;
        }
    }

    /// Releases whatever the current state holds and parks in `Stopped`.
    fn shutdown(&mut self) {
        if self.phase() == CapturePhase::Stopped {
            return;
        }
        self.release_held();
        self.state = State::Stopped;
    }

    fn recover(&mut self) {
        self.stats.recoveries += 1;
        let released = catch_unwind(AssertUnwindSafe(|| self.release_held()));
        if released.is_err() {
            log::warn!(
                "cam {}: ignoring failure while releasing resources",
                self.session.id
            );
        }
        self.clock.pause(self.policy.retry_delay, &self.stop);
        self.state = State::Connecting { attempt: 0 };
    }

    /// Closes the open segment, then the stream, and leaves the state
    /// `Disconnected`. Works on the live state, so after a panic it still
    /// sees everything the interrupted transition was holding.
    fn release_held(&mut self) {
        let camera = &self.session.id;
        match &mut self.state {
            State::Validating { stream, .. } => release_stream(camera, stream),
            State::Recording {
                stream, segment, ..
            } => {
                if let Some(segment) = segment.as_mut() {
                    close_segment(camera, segment);
                }
                release_stream(camera, stream);
            }
            State::Connecting { .. } | State::Disconnected | State::Stopped => {}
        }
        self.state = State::Disconnected;
    }
}

fn close_segment<W: SegmentWriter>(camera: &str, segment: &mut ActiveSegment<W>) {
    match segment.writer.release() {
        Ok(()) => log::info!(
            "cam {}: saved video segment: {} ({} frames)",
            camera,
            segment.file.path.display(),
            segment.file.frames_written
        ),
        Err(err) => log::warn!(
            "cam {}: closing {} failed: {:#}",
            camera,
            segment.file.path.display(),
            err
        ),
    }
}

fn release_stream<H: StreamHandle>(camera: &str, stream: &mut H) {
    stream.release();
    log::info!("cam {}: released capture resources", camera);
}
