//! Segment files.
//!
//! A [`SegmentSink`] opens one output file per segment; the returned
//! [`SegmentWriter`] accepts frames until released. Segment paths follow
//! `{dir}/{station}-{camera}-{YYYYMMDD_HHMMSS}.mp4` so a lexicographic listing
//! of a directory is chronological per camera.

use anyhow::Result;
use chrono::NaiveDateTime;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::ingest::{Frame, Geometry};

pub mod ffmpeg;

pub use ffmpeg::{FfmpegSegmentSink, FfmpegSegmentWriter};

pub const SEGMENT_EXTENSION: &str = "mp4";

/// Four-character codec tag written into the container.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc([u8; 4]);

impl FourCc {
    /// MPEG-4 Part 2, the default for segments.
    pub const MP4V: FourCc = FourCc(*b"mp4v");

    pub const fn new(tag: [u8; 4]) -> Self {
        Self(tag)
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({})", self.as_str())
    }
}

/// Opens segment writers.
pub trait SegmentSink: Send {
    type Writer: SegmentWriter;

    /// Opens `path` for writing. An error, or a writer reporting
    /// `is_open() == false`, counts as a failed open.
    fn open(
        &mut self,
        path: &Path,
        codec: FourCc,
        frame_rate: u32,
        geometry: Geometry,
    ) -> Result<Self::Writer>;
}

pub trait SegmentWriter: Send {
    fn is_open(&self) -> bool;

    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Finalizes the file. Safe to call more than once.
    fn release(&mut self) -> Result<()>;
}

/// Bookkeeping for the segment currently being written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub geometry: Geometry,
    pub frame_rate: u32,
    pub frames_written: u64,
}

impl SegmentFile {
    pub fn new(path: PathBuf, geometry: Geometry, frame_rate: u32) -> Self {
        Self {
            path,
            geometry,
            frame_rate,
            frames_written: 0,
        }
    }
}

/// Derives unique segment paths for one camera.
///
/// Two segments started within the same second get `_1`, `_2`, ... suffixes,
/// as does a name that already exists on disk. The suffix sorts after the
/// plain name, so directory order stays chronological.
#[derive(Debug)]
pub struct SegmentNamer {
    dir: PathBuf,
    prefix: String,
    last_stamp: Option<String>,
    sequence: u32,
}

impl SegmentNamer {
    pub fn new(dir: impl Into<PathBuf>, station: &str, camera_id: &str) -> Self {
        Self {
            dir: dir.into(),
            prefix: format!("{}-{}", station, camera_id),
            last_stamp: None,
            sequence: 0,
        }
    }

    pub fn next_path(&mut self, now: NaiveDateTime) -> PathBuf {
        let stamp = now.format("%Y%m%d_%H%M%S").to_string();
        if self.last_stamp.as_deref() == Some(stamp.as_str()) {
            self.sequence += 1;
        } else {
            self.sequence = 0;
        }

        let mut candidate = self.candidate(&stamp);
        while candidate.exists() {
            self.sequence += 1;
            candidate = self.candidate(&stamp);
        }
        self.last_stamp = Some(stamp);
        candidate
    }

    fn candidate(&self, stamp: &str) -> PathBuf {
        let name = if self.sequence == 0 {
            format!("{}-{}.{}", self.prefix, stamp, SEGMENT_EXTENSION)
        } else {
            format!(
                "{}-{}_{}.{}",
                self.prefix, stamp, self.sequence, SEGMENT_EXTENSION
            )
        };
        self.dir.join(name)
    }
}
