//! RTSP decoding through FFmpeg (libavformat/libavcodec).
//!
//! Used when the crate is built with `rtsp-ffmpeg` but without
//! `rtsp-gstreamer`. Frames are scaled to packed RGB24.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::rtsp::{frame_timeout, RtspConfig};
use super::Frame;

pub(crate) struct FfmpegStream {
    url: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    last_error: Option<String>,
    released: bool,
}

// SAFETY: the stream is owned by exactly one capture thread and never shared;
// the FFmpeg contexts are only touched through `&mut self`.
unsafe impl Send for FfmpegStream {}

impl FfmpegStream {
    pub(crate) fn open(url: &str, config: &RtspConfig) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;

        let mut options = ffmpeg::Dictionary::new();
        options.set("rtsp_transport", "tcp");
        // Socket timeout in microseconds, so a dead camera fails the read
        // instead of blocking shutdown forever.
        let timeout_us = frame_timeout(config.target_fps).as_micros().max(5_000_000);
        options.set("timeout", &timeout_us.to_string());

        let input = ffmpeg::format::input_with_dictionary(&url, options)
            .with_context(|| format!("failed to open RTSP input '{}' with ffmpeg", url))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("{} has no video track", url))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!("RtspSource: connected to {} (ffmpeg)", url);
        Ok(Self {
            url: url.to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            last_error: None,
            released: false,
        })
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.released && self.last_error.is_none()
    }

    pub(crate) fn read(&mut self) -> Result<Frame> {
        if !self.is_open() {
            anyhow::bail!("{} is closed", self.url);
        }
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }

            if let Err(err) = self.decoder.send_packet(&packet) {
                // Corrupt packets are common on lossy links; skip them.
                log::debug!("{}: dropping undecodable packet: {}", self.url, err);
                continue;
            }

            if self.decoder.receive_frame(&mut decoded).is_ok() {
                self.scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
                return Ok(Frame::new(pixels, width, height));
            }
        }

        self.last_error = Some("stream ended".to_string());
        anyhow::bail!("{} ended", self.url)
    }

    pub(crate) fn release(&mut self) {
        if !self.released {
            log::debug!("RtspSource: released {} (ffmpeg)", self.url);
        }
        self.released = true;
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
