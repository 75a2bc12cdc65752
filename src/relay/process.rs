//! The external transport process behind the relay.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::subprocess::{reap, request_exit, spawn_line_reader};

/// How long [`CommandProcess::wait`] lets a terminated process wind down
/// before killing it.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(10);

const WAIT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exit status, `None` when the process was ended by a signal.
    Exited(Option<i32>),
}

pub trait TransportLauncher: Send {
    type Process: TransportProcess;

    fn spawn(&mut self, argv: &[String]) -> Result<Self::Process>;
}

pub trait TransportProcess: Send {
    /// Non-blocking exit check.
    fn poll(&mut self) -> Result<ProcessState>;

    /// Next buffered diagnostic line, if any. Never blocks.
    fn read_diagnostic_line(&mut self) -> Option<String>;

    /// Asks the process to exit. Safe to call after it already has.
    fn terminate(&mut self) -> Result<()>;

    /// Blocks until the process has exited.
    fn wait(&mut self) -> Result<Option<i32>>;
}

/// Argument vector for one relay attempt: loop the concat manifest forever at
/// native rate and publish it over RTSP/TCP without re-encoding.
pub fn relay_argv(ffmpeg: &Path, manifest: &Path, url: &str) -> Vec<String> {
    let mut argv = vec![ffmpeg.display().to_string()];
    argv.extend(
        [
            "-re",
            "-stream_loop",
            "-1",
            "-f",
            "concat",
            "-safe",
            "0",
            "-i",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    argv.push(manifest.display().to_string());
    argv.extend(
        [
            "-c:v",
            "copy",
            "-c:a",
            "copy",
            "-f",
            "rtsp",
            "-rtsp_transport",
            "tcp",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    argv.push(url.to_string());
    argv
}

/// Launches transports with `std::process::Command`.
#[derive(Debug, Default)]
pub struct CommandLauncher;

impl TransportLauncher for CommandLauncher {
    type Process = CommandProcess;

    fn spawn(&mut self, argv: &[String]) -> Result<CommandProcess> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty transport command line"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {}", program))?;

        let (tx, rx) = mpsc::channel();
        let reader = match child.stderr.take() {
            Some(stderr) => {
                let spawned = spawn_line_reader("relay-stderr".to_string(), stderr, move |line| {
                    let _ = tx.send(line);
                });
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        reap(&mut child);
                        return Err(err).context("start relay diagnostics reader");
                    }
                }
            }
            None => None,
        };

        log::debug!("spawned {} (pid {})", program, child.id());
        Ok(CommandProcess {
            child,
            diagnostics: rx,
            reader,
            terminated: false,
            status: None,
        })
    }
}

pub struct CommandProcess {
    child: Child,
    diagnostics: Receiver<String>,
    reader: Option<JoinHandle<()>>,
    terminated: bool,
    status: Option<Option<i32>>,
}

impl CommandProcess {
    fn record(&mut self, status: std::process::ExitStatus) -> Option<i32> {
        let code = status.code();
        self.status = Some(code);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        code
    }
}

impl TransportProcess for CommandProcess {
    fn poll(&mut self) -> Result<ProcessState> {
        if let Some(code) = self.status {
            return Ok(ProcessState::Exited(code));
        }
        match self.child.try_wait().context("poll relay process")? {
            Some(status) => Ok(ProcessState::Exited(self.record(status))),
            None => Ok(ProcessState::Running),
        }
    }

    fn read_diagnostic_line(&mut self) -> Option<String> {
        match self.diagnostics.try_recv() {
            Ok(line) => Some(line),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated || self.status.is_some() {
            return Ok(());
        }
        self.terminated = true;
        request_exit(&mut self.child).context("terminate relay process")
    }

    fn wait(&mut self) -> Result<Option<i32>> {
        if let Some(code) = self.status {
            return Ok(code);
        }
        let deadline = Instant::now() + TERMINATE_GRACE;
        loop {
            if let Some(status) = self.child.try_wait().context("wait for relay process")? {
                return Ok(self.record(status));
            }
            if self.terminated && Instant::now() >= deadline {
                log::warn!("relay process ignored termination, killing it");
                let _ = self.child.kill();
                let status = self.child.wait().context("reap relay process")?;
                return Ok(self.record(status));
            }
            std::thread::sleep(WAIT_POLL);
        }
    }
}

impl Drop for CommandProcess {
    fn drop(&mut self) {
        if self.status.is_none() {
            reap(&mut self.child);
        }
    }
}
