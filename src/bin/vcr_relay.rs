//! vcr_relay - replay recorded segments as a looping RTSP stream
//!
//! Builds a concat playlist of the media in the source directory, hands it to
//! ffmpeg and restarts ffmpeg with exponential backoff whenever it dies. Exit
//! status is 0 after a clean finish or an operator stop, 1 when the source
//! directory is unusable or the retry cap is reached.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use vcr_supervisor::{
    CommandLauncher, RelayConfig, RelaySupervisor, ShutdownController, SystemClock,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Loop recorded segments out as an RTSP stream")]
struct Args {
    /// Configuration file; only its [relay] table is read.
    #[arg(long, env = "VCR_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the segments to relay.
    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// RTSP publish URL.
    #[arg(long)]
    url: Option<String>,

    /// ffmpeg binary.
    #[arg(long, env = "VCR_FFMPEG")]
    ffmpeg: Option<PathBuf>,

    /// Give up after this many restarts (default: retry forever).
    #[arg(long)]
    max_retries: Option<u32>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let code = match run(Args::parse()) {
        Ok(code) => code,
        Err(err) => {
            log::error!("{:#}", err);
            1
        }
    };
    std::process::exit(code);
}

fn run(args: Args) -> Result<i32> {
    let mut cfg = RelayConfig::read(args.config.as_deref())?;
    if let Some(dir) = args.source_dir {
        cfg.source_dir = dir;
    }
    if let Some(url) = args.url {
        cfg.url = url;
    }
    if let Some(ffmpeg) = args.ffmpeg {
        cfg.ffmpeg = ffmpeg;
    }
    if let Some(retries) = args.max_retries {
        cfg.max_retries = Some(retries);
    }
    cfg.validate().context("invalid relay configuration")?;

    let controller = ShutdownController::new();
    controller.install_signal_handler()?;

    log::info!("RTSP stream will be published at {}", cfg.url);
    log::info!("press Ctrl+C to stop streaming");
    let mut relay = RelaySupervisor::new(
        cfg.settings(),
        CommandLauncher,
        SystemClock,
        controller.flag(),
    );
    let outcome = relay.run();
    Ok(outcome.exit_code())
}
