//! Segment writer backed by an `ffmpeg` child process.
//!
//! Frames are piped as raw RGB24 into ffmpeg's stdin; ffmpeg encodes and muxes
//! the segment. Closing stdin lets ffmpeg write the MP4 trailer, so a segment
//! is only complete after [`SegmentWriter::release`] returns.

use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use super::{FourCc, SegmentSink, SegmentWriter};
use crate::ingest::{Frame, Geometry};
use crate::subprocess::{reap, spawn_line_reader};

#[derive(Clone, Debug)]
pub struct FfmpegSegmentSink {
    ffmpeg: PathBuf,
}

impl FfmpegSegmentSink {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

impl Default for FfmpegSegmentSink {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

/// Encoder arguments for a container codec tag.
fn codec_args(codec: FourCc) -> Vec<String> {
    let encoder = match &codec.0 {
        b"mp4v" => "mpeg4",
        b"avc1" | b"h264" | b"H264" => "libx264",
        b"MJPG" | b"mjpg" => "mjpeg",
        _ => "mpeg4",
    };
    vec![
        "-c:v".to_string(),
        encoder.to_string(),
        "-tag:v".to_string(),
        codec.to_string(),
    ]
}

pub(crate) fn encoder_args(
    path: &Path,
    codec: FourCc,
    frame_rate: u32,
    geometry: Geometry,
) -> Vec<String> {
    let mut args = vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-y".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-s".to_string(),
        geometry.to_string(),
        "-r".to_string(),
        frame_rate.to_string(),
        "-i".to_string(),
        "-".to_string(),
        "-an".to_string(),
    ];
    args.extend(codec_args(codec));
    args.extend(["-pix_fmt".to_string(), "yuv420p".to_string()]);
    args.push(path.display().to_string());
    args
}

impl SegmentSink for FfmpegSegmentSink {
    type Writer = FfmpegSegmentWriter;

    fn open(
        &mut self,
        path: &Path,
        codec: FourCc,
        frame_rate: u32,
        geometry: Geometry,
    ) -> Result<FfmpegSegmentWriter> {
        if !geometry.is_valid() {
            return Err(anyhow!("cannot open {} with geometry {}", path.display(), geometry));
        }
        let args = encoder_args(path, codec, frame_rate, geometry);
        log::debug!("starting segment encoder: {:?} {:?}", self.ffmpeg, args);

        let mut process = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start {}", self.ffmpeg.display()))?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture encoder stdin"))?;
        if let Some(stderr) = process.stderr.take() {
            let label = path.display().to_string();
            let spawned = spawn_line_reader("segment-encoder".to_string(), stderr, move |line| {
                log::warn!("encoder {}: {}", label, line);
            });
            if let Err(err) = spawned {
                drop(stdin);
                reap(&mut process);
                return Err(err).context("start encoder diagnostics reader");
            }
        }

        Ok(FfmpegSegmentWriter {
            path: path.to_path_buf(),
            geometry,
            process,
            stdin: Some(stdin),
            released: false,
        })
    }
}

pub struct FfmpegSegmentWriter {
    path: PathBuf,
    geometry: Geometry,
    process: Child,
    stdin: Option<ChildStdin>,
    released: bool,
}

impl SegmentWriter for FfmpegSegmentWriter {
    fn is_open(&self) -> bool {
        !self.released && self.stdin.is_some()
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        if frame.geometry() != self.geometry {
            return Err(anyhow!(
                "frame geometry {} does not match segment geometry {}",
                frame.geometry(),
                self.geometry
            ));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("{} is closed", self.path.display()))?;
        stdin
            .write_all(frame.pixels())
            .with_context(|| format!("write frame to {}", self.path.display()))
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        // EOF on stdin makes ffmpeg flush and write the trailer.
        drop(self.stdin.take());
        let status = self
            .process
            .wait()
            .with_context(|| format!("wait for encoder of {}", self.path.display()))?;
        if status.success() {
            Ok(())
        } else {
            Err(anyhow!(
                "encoder for {} exited with {}",
                self.path.display(),
                status
            ))
        }
    }
}

impl Drop for FfmpegSegmentWriter {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            log::debug!("segment writer dropped without clean release: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_reads_raw_rgb_from_stdin() {
        let args = encoder_args(
            Path::new("/srv/vcr/ST01-1-20260307_120000.mp4"),
            FourCc::MP4V,
            25,
            Geometry::new(1920, 1080),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt rgb24 -s 1920x1080 -r 25 -i -"));
        assert!(joined.contains("-c:v mpeg4 -tag:v mp4v"));
        assert_eq!(
            args.last().map(String::as_str),
            Some("/srv/vcr/ST01-1-20260307_120000.mp4")
        );
    }

    #[test]
    fn missing_encoder_binary_fails_to_open() {
        let mut sink = FfmpegSegmentSink::new("/nonexistent/ffmpeg-for-tests");
        let result = sink.open(
            Path::new("/tmp/never-written.mp4"),
            FourCc::MP4V,
            10,
            Geometry::new(64, 48),
        );
        assert!(result.is_err());
    }

    #[test]
    fn zero_geometry_is_rejected_before_spawning() {
        let mut sink = FfmpegSegmentSink::default();
        let result = sink.open(
            Path::new("/tmp/never-written.mp4"),
            FourCc::MP4V,
            10,
            Geometry::new(0, 0),
        );
        assert!(result.is_err());
    }
}
