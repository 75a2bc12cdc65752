use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::CameraSession;
use crate::record::SEGMENT_EXTENSION;
use crate::relay::{Backoff, RelaySettings, DEFAULT_RELAY_URL};

const CONFIG_ENV: &str = "VCR_CONFIG";
const DEFAULT_FFMPEG: &str = "ffmpeg";
const DEFAULT_BASE_DELAY_SECS: u64 = 1;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct VcrConfigFile {
    station: Option<String>,
    video_path: Option<PathBuf>,
    frame_rate: Option<u32>,
    segment_minutes: Option<u32>,
    camera_count: Option<usize>,
    cameras: Option<Vec<CameraConfigFile>>,
    relay: Option<RelayConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    id: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RelayConfigFile {
    source_dir: Option<PathBuf>,
    url: Option<String>,
    ffmpeg: Option<PathBuf>,
    extension: Option<String>,
    base_delay_secs: Option<u64>,
    max_delay_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConfig {
    pub id: String,
    pub url: String,
}

/// Settings for the capture daemon.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub station: String,
    pub video_path: PathBuf,
    pub frame_rate: u32,
    pub segment_minutes: u32,
    pub cameras: Vec<CameraConfig>,
    camera_count: Option<usize>,
}

/// Settings for the relay daemon.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub source_dir: PathBuf,
    pub url: String,
    pub ffmpeg: PathBuf,
    pub extension: String,
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl CaptureConfig {
    /// Loads from `path`, or from the file named by `VCR_CONFIG` when `path`
    /// is `None`, then applies environment overrides and validates.
    ///
    /// The camera list only comes from the file, so a file is required.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = config_path(path)
            .ok_or_else(|| anyhow!("no capture configuration: pass --config or set {}", CONFIG_ENV))?;
        let file = read_config_file(&path)?;
        let mut cfg = Self::from_file(file)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: VcrConfigFile) -> Result<Self> {
        let station = file.station.ok_or_else(|| missing("station"))?;
        let video_path = file.video_path.ok_or_else(|| missing("video_path"))?;
        let frame_rate = file.frame_rate.ok_or_else(|| missing("frame_rate"))?;
        let segment_minutes = file.segment_minutes.ok_or_else(|| missing("segment_minutes"))?;

        let mut cameras = Vec::new();
        for (index, camera) in file.cameras.unwrap_or_default().into_iter().enumerate() {
            let id = camera.id.unwrap_or_else(|| (index + 1).to_string());
            let url = camera
                .url
                .ok_or_else(|| anyhow!("camera {} has no url", id))?;
            cameras.push(CameraConfig { id, url });
        }

        Ok(Self {
            station,
            video_path,
            frame_rate,
            segment_minutes,
            cameras,
            camera_count: file.camera_count,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_value("VCR_VIDEO_PATH") {
            self.video_path = PathBuf::from(path);
        }
        if let Some(station) = env_value("VCR_STATION") {
            self.station = station;
        }
        if let Some(rate) = env_value("VCR_FRAME_RATE") {
            self.frame_rate = rate
                .parse()
                .map_err(|_| anyhow!("VCR_FRAME_RATE must be a whole number of frames per second"))?;
        }
        if let Some(minutes) = env_value("VCR_SEGMENT_MINUTES") {
            self.segment_minutes = minutes
                .parse()
                .map_err(|_| anyhow!("VCR_SEGMENT_MINUTES must be a whole number of minutes"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.station = self.station.trim().to_string();
        validate_name_part("station", &self.station)?;
        if self.video_path.as_os_str().is_empty() {
            return Err(anyhow!("video_path must not be empty"));
        }
        if self.frame_rate == 0 {
            return Err(anyhow!("frame_rate must be greater than zero"));
        }
        if self.segment_minutes == 0 {
            return Err(anyhow!("segment_minutes must be greater than zero"));
        }
        if self.cameras.is_empty() {
            return Err(anyhow!("at least one camera must be configured"));
        }
        if let Some(count) = self.camera_count {
            if count != self.cameras.len() {
                return Err(anyhow!(
                    "camera_count is {} but {} cameras are configured",
                    count,
                    self.cameras.len()
                ));
            }
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            validate_name_part("camera id", &camera.id)?;
            if camera.url.trim().is_empty() {
                return Err(anyhow!("camera {} has an empty url", camera.id));
            }
            if !seen.insert(camera.id.as_str()) {
                return Err(anyhow!("camera id {} is configured twice", camera.id));
            }
        }
        Ok(())
    }

    /// One capture session per configured camera, in configuration order.
    pub fn sessions(&self) -> Vec<CameraSession> {
        self.cameras
            .iter()
            .map(|camera| {
                CameraSession::new(
                    camera.id.clone(),
                    camera.url.clone(),
                    self.station.clone(),
                    self.frame_rate,
                    self.segment_minutes,
                    self.video_path.clone(),
                )
            })
            .collect()
    }
}

impl RelayConfig {
    /// Reads the `[relay]` table from `path` (or `VCR_CONFIG`), if any file is
    /// given, then applies environment overrides. Not validated yet: callers
    /// layer command-line flags on top and then call
    /// [`validate`](Self::validate).
    pub fn read(path: Option<&Path>) -> Result<Self> {
        let file = match config_path(path) {
            Some(path) => read_config_file(&path)?.relay.unwrap_or_default(),
            None => RelayConfigFile::default(),
        };
        let mut cfg = Self::from_file(file);
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Self {
        Self {
            source_dir: file.source_dir.unwrap_or_default(),
            url: file.url.unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()),
            ffmpeg: file
                .ffmpeg
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG)),
            extension: file
                .extension
                .unwrap_or_else(|| SEGMENT_EXTENSION.to_string()),
            base_delay: Duration::from_secs(
                file.base_delay_secs.unwrap_or(DEFAULT_BASE_DELAY_SECS),
            ),
            max_delay: file.max_delay_secs.map(Duration::from_secs),
            max_retries: file.max_retries,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = env_value("VCR_RELAY_SOURCE_DIR") {
            self.source_dir = PathBuf::from(dir);
        }
        if let Some(url) = env_value("VCR_RELAY_URL") {
            self.url = url;
        }
        if let Some(retries) = env_value("VCR_RELAY_MAX_RETRIES") {
            self.max_retries = Some(
                retries
                    .parse()
                    .map_err(|_| anyhow!("VCR_RELAY_MAX_RETRIES must be a whole number"))?,
            );
        }
        Ok(())
    }

    /// Checks the settings and normalizes the extension.
    pub fn validate(&mut self) -> Result<()> {
        if self.source_dir.as_os_str().is_empty() {
            return Err(anyhow!(
                "relay source_dir is not set (config [relay] source_dir or VCR_RELAY_SOURCE_DIR)"
            ));
        }
        let url = url::Url::parse(&self.url)
            .map_err(|e| anyhow!("invalid relay url {}: {}", self.url, e))?;
        if url.scheme() != "rtsp" {
            return Err(anyhow!("relay url must use rtsp://, got {}", self.url));
        }
        self.extension = self.extension.trim_start_matches('.').to_string();
        if self.extension.is_empty() {
            return Err(anyhow!("relay extension must not be empty"));
        }
        if self.base_delay.is_zero() {
            return Err(anyhow!("base_delay_secs must be greater than zero"));
        }
        if let Some(max) = self.max_delay {
            if max < self.base_delay {
                return Err(anyhow!("max_delay_secs must not be below base_delay_secs"));
            }
        }
        Ok(())
    }

    pub fn settings(&self) -> RelaySettings {
        let mut settings = RelaySettings::new(self.source_dir.clone());
        settings.url = self.url.clone();
        settings.ffmpeg = self.ffmpeg.clone();
        settings.extension = self.extension.clone();
        settings.backoff = Backoff {
            base: self.base_delay,
            max_delay: self.max_delay,
            max_retries: self.max_retries,
        };
        settings
    }
}

fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| env_value(CONFIG_ENV).map(PathBuf::from))
}

fn read_config_file(path: &Path) -> Result<VcrConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn missing(key: &str) -> anyhow::Error {
    anyhow!("missing required setting: {}", key)
}

/// Station and camera ids end up in segment file names.
fn validate_name_part(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(anyhow!("{} must not be empty", what));
    }
    if value
        .chars()
        .any(|c| matches!(c, '/' | '\\' | '\0') || c.is_whitespace())
    {
        return Err(anyhow!("{} {:?} cannot be used in a file name", what, value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with(cameras: Vec<CameraConfigFile>) -> VcrConfigFile {
        VcrConfigFile {
            station: Some("ST01".to_string()),
            video_path: Some(PathBuf::from("/var/lib/vcr")),
            frame_rate: Some(15),
            segment_minutes: Some(5),
            cameras: Some(cameras),
            ..VcrConfigFile::default()
        }
    }

    fn camera(id: Option<&str>, url: &str) -> CameraConfigFile {
        CameraConfigFile {
            id: id.map(str::to_string),
            url: Some(url.to_string()),
        }
    }

    #[test]
    fn camera_ids_default_to_their_position() {
        let cfg = CaptureConfig::from_file(file_with(vec![
            camera(None, "rtsp://a"),
            camera(Some("gate"), "rtsp://b"),
            camera(None, "rtsp://c"),
        ]))
        .unwrap();
        let ids: Vec<_> = cfg.cameras.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "gate", "3"]);
    }

    #[test]
    fn sessions_carry_derived_segment_length() {
        let mut cfg = CaptureConfig::from_file(file_with(vec![camera(None, "rtsp://a")])).unwrap();
        cfg.validate().unwrap();
        let sessions = cfg.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].segment_frames, 15 * 5 * 60);
        assert_eq!(sessions[0].station, "ST01");
        assert_eq!(sessions[0].output_dir, PathBuf::from("/var/lib/vcr"));
    }

    #[test]
    fn camera_count_must_match() {
        let mut file = file_with(vec![camera(None, "rtsp://a")]);
        file.camera_count = Some(2);
        let mut cfg = CaptureConfig::from_file(file).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("camera_count"));
    }

    #[test]
    fn duplicate_and_unsafe_ids_are_rejected() {
        let mut dup = CaptureConfig::from_file(file_with(vec![
            camera(Some("2"), "rtsp://a"),
            camera(None, "rtsp://b"),
        ]))
        .unwrap();
        assert!(dup.validate().is_err());

        let mut unsafe_id =
            CaptureConfig::from_file(file_with(vec![camera(Some("../x"), "rtsp://a")])).unwrap();
        assert!(unsafe_id.validate().is_err());
    }

    #[test]
    fn missing_required_setting_is_named() {
        let mut file = file_with(vec![camera(None, "rtsp://a")]);
        file.frame_rate = None;
        let err = CaptureConfig::from_file(file).unwrap_err();
        assert!(err.to_string().contains("frame_rate"));
    }

    #[test]
    fn relay_defaults_and_settings() {
        let mut cfg = RelayConfig::from_file(RelayConfigFile {
            source_dir: Some(PathBuf::from("/srv/videos")),
            extension: Some(".mp4".to_string()),
            ..RelayConfigFile::default()
        });
        cfg.validate().unwrap();
        let settings = cfg.settings();
        assert_eq!(settings.url, DEFAULT_RELAY_URL);
        assert_eq!(settings.ffmpeg, PathBuf::from("ffmpeg"));
        assert_eq!(settings.extension, "mp4");
        assert_eq!(settings.backoff.base, Duration::from_secs(1));
        assert_eq!(settings.backoff.max_retries, None);
    }

    #[test]
    fn relay_url_must_be_rtsp() {
        let mut cfg = RelayConfig::from_file(RelayConfigFile {
            source_dir: Some(PathBuf::from("/srv/videos")),
            url: Some("http://localhost/stream".to_string()),
            ..RelayConfigFile::default()
        });
        assert!(cfg.validate().is_err());
    }
}
