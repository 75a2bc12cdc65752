//! vcrd - multi-camera capture daemon
//!
//! Starts one capture supervisor per configured camera and records each RTSP
//! stream into rotating MP4 segments under `video_path`. Runs until SIGINT or
//! SIGTERM; open segments are finalized before exit.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use vcr_supervisor::capture::fleet::DEFAULT_STAGGER;
use vcr_supervisor::{
    start_fleet, CaptureConfig, CaptureSupervisor, FfmpegSegmentSink, RtspConfig, RtspSource,
    ShutdownController, SystemClock,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Record RTSP cameras into rotating segments")]
struct Args {
    /// Configuration file (TOML, or JSON with a .json extension).
    #[arg(long, env = "VCR_CONFIG")]
    config: Option<PathBuf>,

    /// ffmpeg binary used to encode segments.
    #[arg(long, env = "VCR_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = CaptureConfig::load(args.config.as_deref()).context("initialization failed")?;
    log::info!(
        "loaded configuration: {} cameras, station {}, saving to {}, {} fps, {} minute segments",
        cfg.cameras.len(),
        cfg.station,
        cfg.video_path.display(),
        cfg.frame_rate,
        cfg.segment_minutes
    );

    let controller = ShutdownController::new();
    controller.install_signal_handler()?;
    let stop = controller.flag();

    let ffmpeg = args.ffmpeg;
    let fleet = start_fleet(cfg.sessions(), &stop, DEFAULT_STAGGER, |session| {
        let source = RtspSource::new(RtspConfig {
            target_fps: session.frame_rate,
            ..RtspConfig::default()
        });
        CaptureSupervisor::new(
            session,
            source,
            FfmpegSegmentSink::new(ffmpeg.clone()),
            SystemClock,
            stop.clone(),
        )
    })?;
    log::info!("capturing from {} cameras", fleet.len());

    fleet.join();
    log::info!("all capture threads stopped");
    Ok(())
}
