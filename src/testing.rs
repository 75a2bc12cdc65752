//! Scripted collaborators for driving the supervisors without cameras,
//! encoders or an ffmpeg binary.
//!
//! Each double records what the supervisor did to it (opens, releases,
//! sleeps, launches) so tests can assert on ordering and timing. State is
//! shared behind `Arc<Mutex<_>>`; clones observe the same recording.

use anyhow::{anyhow, bail, Result};
use chrono::NaiveDateTime;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::Clock;
use crate::ingest::{Frame, FrameSource, Geometry, StreamHandle};
use crate::lifecycle::{ShutdownController, StopFlag};
use crate::record::{FourCc, SegmentSink, SegmentWriter};
use crate::relay::{ProcessState, TransportLauncher, TransportProcess};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resource events, in the order they happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Open(String),
    ReleaseStream,
    OpenWriter(PathBuf),
    ReleaseWriter(PathBuf),
}

#[derive(Clone, Debug, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.0).clone()
    }

    fn push(&self, call: Call) {
        lock(&self.0).push(call);
    }
}

// ----------------------------------------------------------------------------
// Frame source
// ----------------------------------------------------------------------------

/// What one `open` call does.
#[derive(Clone, Debug)]
pub enum Connection {
    Refuse,
    /// Panics inside `open`.
    Panic,
    /// Opens a stream that yields these reads, then fails.
    Stream(Vec<ReadOutcome>),
    /// Opens a stream that yields frames of this size forever.
    Endless(Geometry),
}

#[derive(Clone, Debug)]
pub enum ReadOutcome {
    Frame(Geometry),
    /// A frame with zero width and height.
    Invalid,
    Fail,
    /// Panics inside `read`.
    Panic,
}

pub struct ScriptedSource {
    log: CallLog,
    script: VecDeque<Connection>,
    stop_when_exhausted: Option<ShutdownController>,
}

impl ScriptedSource {
    pub fn new(log: CallLog, script: Vec<Connection>) -> Self {
        Self {
            log,
            script: script.into(),
            stop_when_exhausted: None,
        }
    }

    /// Requests shutdown once every scripted connection has been used, so
    /// `run()` returns instead of reconnecting forever.
    pub fn stop_when_exhausted(mut self, controller: ShutdownController) -> Self {
        self.stop_when_exhausted = Some(controller);
        self
    }
}

impl FrameSource for ScriptedSource {
    type Stream = ScriptedStream;

    fn open(&mut self, url: &str) -> Result<ScriptedStream> {
        self.log.push(Call::Open(url.to_string()));
        match self.script.pop_front() {
            None => {
                if let Some(controller) = &self.stop_when_exhausted {
                    controller.request_stop();
                }
                bail!("no scripted connection left for {}", url)
            }
            Some(Connection::Refuse) => bail!("connection refused by {}", url),
            Some(Connection::Panic) => panic!("scripted panic while opening {}", url),
            Some(Connection::Stream(reads)) => Ok(ScriptedStream {
                log: self.log.clone(),
                reads: reads.into(),
                endless: None,
                open: true,
            }),
            Some(Connection::Endless(geometry)) => Ok(ScriptedStream {
                log: self.log.clone(),
                reads: VecDeque::new(),
                endless: Some(geometry),
                open: true,
            }),
        }
    }
}

pub struct ScriptedStream {
    log: CallLog,
    reads: VecDeque<ReadOutcome>,
    endless: Option<Geometry>,
    open: bool,
}

impl StreamHandle for ScriptedStream {
    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self) -> Result<Frame> {
        if !self.open {
            bail!("stream released");
        }
        if let Some(geometry) = self.endless {
            return Ok(Frame::new(Vec::new(), geometry.width, geometry.height));
        }
        match self.reads.pop_front() {
            Some(ReadOutcome::Frame(geometry)) => {
                Ok(Frame::new(Vec::new(), geometry.width, geometry.height))
            }
            Some(ReadOutcome::Invalid) => Ok(Frame::new(Vec::new(), 0, 0)),
            Some(ReadOutcome::Fail) => bail!("scripted read failure"),
            Some(ReadOutcome::Panic) => panic!("scripted panic while reading"),
            None => bail!("scripted stream ended"),
        }
    }

    fn release(&mut self) {
        if self.open {
            self.open = false;
            self.log.push(Call::ReleaseStream);
        }
    }
}

// ----------------------------------------------------------------------------
// Segment sink
// ----------------------------------------------------------------------------

/// A segment the sink opened successfully.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenedSegment {
    pub path: PathBuf,
    pub codec: FourCc,
    pub frame_rate: u32,
    pub geometry: Geometry,
    pub frames: u64,
    pub released: bool,
}

#[derive(Default)]
struct SinkState {
    open_attempts: usize,
    fail_opens: Vec<usize>,
    fail_writes: Vec<(usize, u64)>,
    segments: Vec<OpenedSegment>,
}

/// Records segments in memory instead of encoding them.
#[derive(Clone)]
pub struct RecordingSink {
    log: CallLog,
    state: Arc<Mutex<SinkState>>,
}

impl RecordingSink {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            state: Arc::default(),
        }
    }

    /// Fails the open attempt with this 0-based index.
    pub fn fail_open(self, attempt: usize) -> Self {
        lock(&self.state).fail_opens.push(attempt);
        self
    }

    /// Fails the `frame`-th (1-based) write to the `writer`-th (0-based)
    /// successfully opened segment.
    pub fn fail_write(self, writer: usize, frame: u64) -> Self {
        lock(&self.state).fail_writes.push((writer, frame));
        self
    }

    pub fn segments(&self) -> Vec<OpenedSegment> {
        lock(&self.state).segments.clone()
    }
}

impl SegmentSink for RecordingSink {
    type Writer = RecordingWriter;

    fn open(
        &mut self,
        path: &Path,
        codec: FourCc,
        frame_rate: u32,
        geometry: Geometry,
    ) -> Result<RecordingWriter> {
        let mut state = lock(&self.state);
        let attempt = state.open_attempts;
        state.open_attempts += 1;
        if state.fail_opens.contains(&attempt) {
            bail!("scripted writer failure for {}", path.display());
        }
        let index = state.segments.len();
        state.segments.push(OpenedSegment {
            path: path.to_path_buf(),
            codec,
            frame_rate,
            geometry,
            frames: 0,
            released: false,
        });
        drop(state);

        self.log.push(Call::OpenWriter(path.to_path_buf()));
        Ok(RecordingWriter {
            log: self.log.clone(),
            state: Arc::clone(&self.state),
            index,
            path: path.to_path_buf(),
            writes: 0,
            released: false,
        })
    }
}

pub struct RecordingWriter {
    log: CallLog,
    state: Arc<Mutex<SinkState>>,
    index: usize,
    path: PathBuf,
    writes: u64,
    released: bool,
}

impl SegmentWriter for RecordingWriter {
    fn is_open(&self) -> bool {
        !self.released
    }

    fn write(&mut self, _frame: &Frame) -> Result<()> {
        if self.released {
            bail!("writer for {} already released", self.path.display());
        }
        self.writes += 1;
        let mut state = lock(&self.state);
        if state.fail_writes.contains(&(self.index, self.writes)) {
            bail!("scripted write failure on {}", self.path.display());
        }
        state.segments[self.index].frames += 1;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            lock(&self.state).segments[self.index].released = true;
            self.log.push(Call::ReleaseWriter(self.path.clone()));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Clock
// ----------------------------------------------------------------------------

struct ClockState {
    now: NaiveDateTime,
    tick: Duration,
    sleeps: Vec<Duration>,
    pauses: Vec<Duration>,
}

impl ClockState {
    fn advance(&mut self, by: Duration) {
        if let Ok(delta) = chrono::Duration::from_std(by) {
            if let Some(next) = self.now.checked_add_signed(delta) {
                self.now = next;
            }
        }
    }
}

/// A clock that never blocks. Sleeps and pauses are recorded and move time
/// forward instantly.
#[derive(Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ClockState>>,
}

impl ManualClock {
    pub fn starting_at(now: NaiveDateTime) -> Self {
        Self::ticking(now, Duration::ZERO)
    }

    /// Every `now()` call returns the current time and then advances it by
    /// `tick`.
    pub fn ticking(now: NaiveDateTime, tick: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState {
                now,
                tick,
                sleeps: Vec::new(),
                pauses: Vec::new(),
            })),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.state).sleeps.clone()
    }

    pub fn pauses(&self) -> Vec<Duration> {
        lock(&self.state).pauses.clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        let mut state = lock(&self.state);
        let now = state.now;
        let tick = state.tick;
        state.advance(tick);
        now
    }

    fn sleep(&self, duration: Duration) {
        let mut state = lock(&self.state);
        state.sleeps.push(duration);
        state.advance(duration);
    }

    fn pause(&self, duration: Duration, stop: &StopFlag) -> bool {
        let mut state = lock(&self.state);
        state.pauses.push(duration);
        state.advance(duration);
        !stop.is_set()
    }
}

// ----------------------------------------------------------------------------
// Relay transport
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
enum FakeExit {
    SpawnFailure,
    After { polls: u32, code: Option<i32> },
    UntilTerminated,
}

/// Behavior of one scripted transport launch.
#[derive(Clone, Debug)]
pub struct FakeRun {
    exit: FakeExit,
    diagnostics: Vec<String>,
    signal: Option<(u32, ShutdownController)>,
}

impl FakeRun {
    fn with_exit(exit: FakeExit) -> Self {
        Self {
            exit,
            diagnostics: Vec::new(),
            signal: None,
        }
    }

    pub fn fails_to_spawn() -> Self {
        Self::with_exit(FakeExit::SpawnFailure)
    }

    /// Reports `Running` for `polls` polls, then exits with `code`.
    pub fn exits_after(polls: u32, code: Option<i32>) -> Self {
        Self::with_exit(FakeExit::After { polls, code })
    }

    pub fn runs_until_terminated() -> Self {
        Self::with_exit(FakeExit::UntilTerminated)
    }

    /// Lines the process has written to stderr by the time it is first read.
    pub fn diagnostics(mut self, lines: &[&str]) -> Self {
        self.diagnostics = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    /// Delivers two termination requests (a double Ctrl-C) during the
    /// `poll`-th (0-based) poll.
    pub fn signal_at(mut self, poll: u32, controller: ShutdownController) -> Self {
        self.signal = Some((poll, controller));
        self
    }
}

#[derive(Default)]
struct LauncherState {
    spawns: Vec<Vec<String>>,
    manifests: Vec<Option<String>>,
    terminations: usize,
    waits: usize,
    undrained: usize,
}

/// Read side of a [`FakeLauncher`].
#[derive(Clone, Default)]
pub struct LauncherProbe(Arc<Mutex<LauncherState>>);

impl LauncherProbe {
    /// Every argv passed to `spawn`, including failed launches.
    pub fn spawns(&self) -> Vec<Vec<String>> {
        lock(&self.0).spawns.clone()
    }

    /// Manifest contents as they were at each spawn (`None` if unreadable).
    pub fn manifests(&self) -> Vec<Option<String>> {
        lock(&self.0).manifests.clone()
    }

    /// Manifest paths passed on each command line.
    pub fn manifest_paths(&self) -> Vec<PathBuf> {
        lock(&self.0)
            .spawns
            .iter()
            .filter_map(|argv| manifest_arg(argv))
            .map(PathBuf::from)
            .collect()
    }

    pub fn terminations(&self) -> usize {
        lock(&self.0).terminations
    }

    pub fn waits(&self) -> usize {
        lock(&self.0).waits
    }

    /// Diagnostic lines still queued when their process was dropped.
    pub fn undrained_diagnostics(&self) -> usize {
        lock(&self.0).undrained
    }
}

fn manifest_arg(argv: &[String]) -> Option<&String> {
    argv.iter()
        .position(|arg| arg == "-i")
        .and_then(|i| argv.get(i + 1))
}

pub struct FakeLauncher {
    runs: VecDeque<FakeRun>,
    probe: LauncherProbe,
}

impl FakeLauncher {
    pub fn new(runs: Vec<FakeRun>) -> (Self, LauncherProbe) {
        let probe = LauncherProbe::default();
        let launcher = Self {
            runs: runs.into(),
            probe: probe.clone(),
        };
        (launcher, probe)
    }
}

impl TransportLauncher for FakeLauncher {
    type Process = FakeProcess;

    fn spawn(&mut self, argv: &[String]) -> Result<FakeProcess> {
        {
            let mut state = lock(&self.probe.0);
            state.spawns.push(argv.to_vec());
            let manifest = manifest_arg(argv).and_then(|path| std::fs::read_to_string(path).ok());
            state.manifests.push(manifest);
        }
        let run = self
            .runs
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted launch left"))?;
        if let FakeExit::SpawnFailure = run.exit {
            bail!("scripted spawn failure");
        }
        Ok(FakeProcess {
            diagnostics: run.diagnostics.iter().cloned().collect(),
            run,
            polls: 0,
            terminated: false,
            probe: self.probe.clone(),
        })
    }
}

pub struct FakeProcess {
    run: FakeRun,
    diagnostics: VecDeque<String>,
    polls: u32,
    terminated: bool,
    probe: LauncherProbe,
}

impl FakeProcess {
    fn exit_code(&self) -> Option<Option<i32>> {
        if self.terminated {
            return Some(None);
        }
        match self.run.exit {
            FakeExit::After { polls, code } if self.polls >= polls => Some(code),
            _ => None,
        }
    }
}

impl TransportProcess for FakeProcess {
    fn poll(&mut self) -> Result<ProcessState> {
        if let Some((at, controller)) = &self.run.signal {
            if *at == self.polls {
                controller.request_stop();
                controller.request_stop();
            }
        }
        let state = match self.exit_code() {
            Some(code) => ProcessState::Exited(code),
            None => ProcessState::Running,
        };
        self.polls = self.polls.saturating_add(1);
        Ok(state)
    }

    fn read_diagnostic_line(&mut self) -> Option<String> {
        self.diagnostics.pop_front()
    }

    fn terminate(&mut self) -> Result<()> {
        lock(&self.probe.0).terminations += 1;
        self.terminated = true;
        Ok(())
    }

    fn wait(&mut self) -> Result<Option<i32>> {
        lock(&self.probe.0).waits += 1;
        match self.exit_code() {
            Some(code) => Ok(code),
            None => match self.run.exit {
                FakeExit::After { code, .. } => Ok(code),
                _ => bail!("waiting on a process that never exits"),
            },
        }
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        lock(&self.probe.0).undrained += self.diagnostics.len();
    }
}
