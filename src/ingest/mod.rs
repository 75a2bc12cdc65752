//! Frame sources.
//!
//! A [`FrameSource`] opens a live video stream by URL and hands back an
//! exclusively owned [`StreamHandle`]. The capture supervisor holds at most one
//! handle per camera and releases it on every transition out of recording.
//!
//! Backends:
//! - Synthetic stream for `stub://` URLs (testing, dry runs)
//! - GStreamer RTSP decode (feature: rtsp-gstreamer)
//! - FFmpeg RTSP decode (feature: rtsp-ffmpeg)

use anyhow::Result;
use std::fmt;

pub mod rtsp;
#[cfg(feature = "rtsp-ffmpeg")]
pub(crate) mod rtsp_ffmpeg;

pub use rtsp::{RtspConfig, RtspSource, RtspStream};

/// Stream geometry in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One decoded frame, packed RGB24.
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
        }
    }

    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.width, self.height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Opens stream connections.
pub trait FrameSource: Send {
    type Stream: StreamHandle;

    /// Opens a connection to `url`. An error, or a handle that reports
    /// `is_open() == false`, counts as a failed connect.
    fn open(&mut self, url: &str) -> Result<Self::Stream>;
}

/// An open stream connection.
pub trait StreamHandle: Send {
    fn is_open(&self) -> bool;

    /// Reads the next frame. An error means the stream ended or broke.
    fn read(&mut self) -> Result<Frame>;

    /// Releases the connection. Must be safe to call more than once.
    fn release(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_geometry_is_invalid() {
        assert!(!Geometry::new(0, 1080).is_valid());
        assert!(!Geometry::new(1920, 0).is_valid());
        assert!(Geometry::new(1920, 1080).is_valid());
        assert_eq!(Geometry::new(640, 480).to_string(), "640x480");
    }
}
