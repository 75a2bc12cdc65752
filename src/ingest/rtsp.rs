//! RTSP frame source.
//!
//! `RtspSource` opens IP camera streams and yields decoded RGB frames. Real
//! decoding goes through GStreamer (preferred) or FFmpeg, depending on enabled
//! features. `stub://` URLs produce a synthetic stream whose failure modes can
//! be scripted through query parameters:
//!
//! - `refuse=N`: the first N opens fail
//! - `invalid=N`: the first N reads after each open return zero-sized frames
//! - `fail_after=N`: each opened stream ends after N good frames
//!
//! e.g. `stub://gate?refuse=2&fail_after=500`.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
#[cfg(feature = "rtsp-gstreamer")]
use gstreamer::prelude::*;
use anyhow::{anyhow, Result};
use std::time::Duration;

use super::{Frame, FrameSource, StreamHandle};

/// Configuration shared by every stream a source opens.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// Nominal frame rate. Synthetic streams are paced to it (0 = unpaced);
    /// decoders derive their stall timeout from it.
    pub target_fps: u32,
    /// Frame width for synthetic streams.
    pub width: u32,
    /// Frame height for synthetic streams.
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

/// RTSP frame source. One per camera; never shared between cameras.
pub struct RtspSource {
    config: RtspConfig,
    opens: u64,
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Self {
        Self { config, opens: 0 }
    }
}

impl FrameSource for RtspSource {
    type Stream = RtspStream;

    fn open(&mut self, url: &str) -> Result<RtspStream> {
        self.opens += 1;
        if url.starts_with("stub://") {
            let stream = SyntheticStream::open(url, self.config.clone(), self.opens)?;
            return Ok(RtspStream {
                backend: RtspBackend::Synthetic(stream),
            });
        }
        #[cfg(feature = "rtsp-gstreamer")]
        {
            Ok(RtspStream {
                backend: RtspBackend::Gstreamer(GstreamerStream::open(url, &self.config)?),
            })
        }
        #[cfg(all(feature = "rtsp-ffmpeg", not(feature = "rtsp-gstreamer")))]
        {
            Ok(RtspStream {
                backend: RtspBackend::Ffmpeg(super::rtsp_ffmpeg::FfmpegStream::open(
                    url,
                    &self.config,
                )?),
            })
        }
        #[cfg(not(any(feature = "rtsp-gstreamer", feature = "rtsp-ffmpeg")))]
        {
            Err(anyhow!(
                "RTSP requires the rtsp-gstreamer or rtsp-ffmpeg feature (url: {})",
                url
            ))
        }
    }
}

/// An open RTSP connection.
pub struct RtspStream {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticStream),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerStream),
    #[cfg(all(feature = "rtsp-ffmpeg", not(feature = "rtsp-gstreamer")))]
    Ffmpeg(super::rtsp_ffmpeg::FfmpegStream),
}

impl StreamHandle for RtspStream {
    fn is_open(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(stream) => stream.open,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(stream) => stream.is_open(),
            #[cfg(all(feature = "rtsp-ffmpeg", not(feature = "rtsp-gstreamer")))]
            RtspBackend::Ffmpeg(stream) => stream.is_open(),
        }
    }

    fn read(&mut self) -> Result<Frame> {
        match &mut self.backend {
            RtspBackend::Synthetic(stream) => stream.read(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(stream) => stream.read(),
            #[cfg(all(feature = "rtsp-ffmpeg", not(feature = "rtsp-gstreamer")))]
            RtspBackend::Ffmpeg(stream) => stream.read(),
        }
    }

    fn release(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(stream) => stream.release(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(stream) => stream.release(),
            #[cfg(all(feature = "rtsp-ffmpeg", not(feature = "rtsp-gstreamer")))]
            RtspBackend::Ffmpeg(stream) => stream.release(),
        }
    }
}

/// Read timeout derived from the nominal frame rate: four frame intervals,
/// never below 500ms.
#[cfg_attr(
    not(any(feature = "rtsp-gstreamer", feature = "rtsp-ffmpeg")),
    allow(dead_code)
)]
pub(crate) fn frame_timeout(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        500
    } else {
        (1000 / target_fps).saturating_mul(4)
    };
    Duration::from_millis(base_ms.max(500) as u64)
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct StubBehavior {
    refuse_opens: u64,
    invalid_frames: u64,
    fail_after: Option<u64>,
}

fn parse_stub_url(raw: &str) -> Result<StubBehavior> {
    let parsed = url::Url::parse(raw).map_err(|e| anyhow!("invalid stub url {}: {}", raw, e))?;
    let mut behavior = StubBehavior::default();
    for (key, value) in parsed.query_pairs() {
        let number: u64 = value
            .parse()
            .map_err(|_| anyhow!("stub url {}: '{}' must be an integer", raw, key))?;
        match key.as_ref() {
            "refuse" => behavior.refuse_opens = number,
            "invalid" => behavior.invalid_frames = number,
            "fail_after" => behavior.fail_after = Some(number),
            other => return Err(anyhow!("stub url {}: unknown parameter '{}'", raw, other)),
        }
    }
    Ok(behavior)
}

struct SyntheticStream {
    url: String,
    config: RtspConfig,
    behavior: StubBehavior,
    reads: u64,
    frame_count: u64,
    scene_state: u8,
    open: bool,
}

impl SyntheticStream {
    fn open(url: &str, config: RtspConfig, attempt: u64) -> Result<Self> {
        let behavior = parse_stub_url(url)?;
        if attempt <= behavior.refuse_opens {
            anyhow::bail!("{} refused connection (attempt {})", url, attempt);
        }
        log::debug!("RtspSource: connected to {} (synthetic)", url);
        Ok(Self {
            url: url.to_string(),
            config,
            behavior,
            reads: 0,
            frame_count: 0,
            scene_state: 0,
            open: true,
        })
    }

    fn read(&mut self) -> Result<Frame> {
        if !self.open {
            anyhow::bail!("{} is closed", self.url);
        }
        self.reads += 1;
        if self.reads <= self.behavior.invalid_frames {
            return Ok(Frame::new(Vec::new(), 0, 0));
        }
        if let Some(limit) = self.behavior.fail_after {
            if self.frame_count >= limit {
                self.open = false;
                anyhow::bail!("{} ended after {} frames", self.url, limit);
            }
        }
        if self.config.target_fps > 0 {
            std::thread::sleep(Duration::from_millis(
                1000 / self.config.target_fps as u64,
            ));
        }
        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels();
        Ok(Frame::new(pixels, self.config.width, self.config.height))
    }

    /// Slowly changing test pattern.
    fn generate_synthetic_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.config.width * self.config.height * 3) as usize;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }

    fn release(&mut self) {
        if self.open {
            log::debug!("RtspSource: released {} (synthetic)", self.url);
        }
        self.open = false;
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerStream {
    url: String,
    target_fps: u32,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    last_error: Option<String>,
    released: bool,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerStream {
    /// Builds `rtspsrc ! decodebin ! videoconvert ! appsink` with RGB caps and
    /// starts it.
    fn open(url: &str, config: &RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 protocols=tcp ! decodebin ! videoconvert ! \
             video/x-raw,format=RGB ! appsink name=appsink sync=false max-buffers=1 drop=true",
            url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        if let Err(err) = pipeline.set_state(gstreamer::State::Playing) {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(anyhow!("set RTSP pipeline to Playing for {}: {}", url, err));
        }
        log::info!("RtspSource: connected to {}", url);

        Ok(Self {
            url: url.to_string(),
            target_fps: config.target_fps,
            pipeline,
            appsink,
            last_error: None,
            released: false,
        })
    }

    fn is_open(&self) -> bool {
        !self.released && self.last_error.is_none()
    }

    fn read(&mut self) -> Result<Frame> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            anyhow::bail!("{}: {}", self.url, err);
        }

        let timeout = frame_timeout(self.target_fps);
        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64))
            .ok_or_else(|| anyhow!("RTSP stream {} stalled", self.url))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        Ok(Frame::new(pixels, width, height))
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::debug!("RtspSource: releasing {} failed: {}", self.url, err);
        }
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerStream {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn unpaced() -> RtspSource {
        RtspSource::new(RtspConfig {
            target_fps: 0,
            width: 64,
            height: 48,
        })
    }

    #[test]
    fn stub_stream_produces_frames_with_configured_geometry() -> Result<()> {
        let mut source = unpaced();
        let mut stream = source.open("stub://front")?;
        assert!(stream.is_open());

        let frame = stream.read()?;
        assert_eq!(frame.width, 64);
        assert_eq!(frame.height, 48);
        assert_eq!(frame.pixels().len(), 64 * 48 * 3);
        Ok(())
    }

    #[test]
    fn stub_refuses_the_requested_number_of_opens() {
        let mut source = unpaced();
        assert!(source.open("stub://gate?refuse=2").is_err());
        assert!(source.open("stub://gate?refuse=2").is_err());
        assert!(source.open("stub://gate?refuse=2").is_ok());
    }

    #[test]
    fn stub_reports_invalid_frames_then_ends() -> Result<()> {
        let mut source = unpaced();
        let mut stream = source.open("stub://yard?invalid=1&fail_after=2")?;

        assert!(!stream.read()?.geometry().is_valid());
        assert!(stream.read()?.geometry().is_valid());
        assert!(stream.read()?.geometry().is_valid());
        assert!(stream.read().is_err());
        assert!(!stream.is_open());
        Ok(())
    }

    #[test]
    fn released_stub_stream_cannot_be_read() -> Result<()> {
        let mut source = unpaced();
        let mut stream = source.open("stub://lobby")?;
        stream.release();
        stream.release();
        assert!(!stream.is_open());
        assert!(stream.read().is_err());
        Ok(())
    }

    #[test]
    fn unknown_stub_parameter_is_rejected() {
        let mut source = unpaced();
        assert!(source.open("stub://lobby?jitter=3").is_err());
    }

    #[test]
    fn frame_timeout_has_a_floor() {
        assert_eq!(frame_timeout(0), Duration::from_millis(500));
        assert_eq!(frame_timeout(25), Duration::from_millis(500));
        assert_eq!(frame_timeout(2), Duration::from_millis(2000));
    }
}
