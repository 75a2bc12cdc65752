use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;

use tempfile::NamedTempFile;

use vcr_supervisor::config::{CaptureConfig, RelayConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "VCR_CONFIG",
        "VCR_VIDEO_PATH",
        "VCR_STATION",
        "VCR_FRAME_RATE",
        "VCR_SEGMENT_MINUTES",
        "VCR_RELAY_SOURCE_DIR",
        "VCR_RELAY_URL",
        "VCR_RELAY_MAX_RETRIES",
    ] {
        std::env::remove_var(key);
    }
}

fn load_relay(path: Option<&Path>) -> Result<RelayConfig> {
    let mut cfg = RelayConfig::read(path)?;
    cfg.validate()?;
    Ok(cfg)
}

fn config_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

const TOML_CONFIG: &str = r#"
station = "ST01"
video_path = "/var/lib/vcr/videos"
frame_rate = 15
segment_minutes = 10
camera_count = 2

[[cameras]]
url = "rtsp://10.0.0.11/stream1"

[[cameras]]
id = "gate"
url = "rtsp://10.0.0.12/stream1"

[relay]
source_dir = "/var/lib/vcr/videos"
max_retries = 5
max_delay_secs = 60
"#;

#[test]
fn loads_capture_config_from_toml_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(".toml", TOML_CONFIG);
    std::env::set_var("VCR_CONFIG", file.path());
    std::env::set_var("VCR_STATION", "ST02");
    std::env::set_var("VCR_FRAME_RATE", "25");

    let cfg = CaptureConfig::load(None).expect("load config");

    assert_eq!(cfg.station, "ST02");
    assert_eq!(cfg.frame_rate, 25);
    assert_eq!(cfg.segment_minutes, 10);
    assert_eq!(cfg.video_path, PathBuf::from("/var/lib/vcr/videos"));

    let sessions = cfg.sessions();
    let ids: Vec<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "gate"]);
    assert_eq!(sessions[1].url, "rtsp://10.0.0.12/stream1");
    assert_eq!(sessions[0].segment_frames, 25 * 10 * 60);

    clear_env();
}

#[test]
fn explicit_path_wins_and_json_is_accepted() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".json",
        r#"{
            "station": "NORTH",
            "video_path": "/data/north",
            "frame_rate": 10,
            "segment_minutes": 1,
            "cameras": [{ "url": "stub://north" }]
        }"#,
    );
    std::env::set_var("VCR_CONFIG", "/nonexistent/vcr.toml");

    let cfg = CaptureConfig::load(Some(file.path())).expect("load config");
    assert_eq!(cfg.station, "NORTH");
    assert_eq!(cfg.cameras.len(), 1);
    assert_eq!(cfg.sessions()[0].segment_frames, 600);

    clear_env();
}

#[test]
fn capture_config_requires_a_file_and_its_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    assert!(CaptureConfig::load(None).is_err());

    let file = config_file(
        ".toml",
        "station = \"ST01\"\nframe_rate = 15\nsegment_minutes = 10\n\
         [[cameras]]\nurl = \"rtsp://a\"\n",
    );
    let err = CaptureConfig::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("video_path"));

    let file = config_file(".toml", &TOML_CONFIG.replace("camera_count = 2", "camera_count = 3"));
    assert!(CaptureConfig::load(Some(file.path())).is_err());

    std::env::set_var("VCR_SEGMENT_MINUTES", "ten");
    let file = config_file(".toml", TOML_CONFIG);
    assert!(CaptureConfig::load(Some(file.path())).is_err());

    clear_env();
}

#[test]
fn relay_config_reads_its_table_and_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(".toml", TOML_CONFIG);
    std::env::set_var("VCR_RELAY_URL", "rtsp://media:8554/replay");

    let cfg = load_relay(Some(file.path())).expect("load relay config");
    assert_eq!(cfg.source_dir, PathBuf::from("/var/lib/vcr/videos"));
    assert_eq!(cfg.url, "rtsp://media:8554/replay");
    assert_eq!(cfg.max_retries, Some(5));

    let settings = cfg.settings();
    assert_eq!(settings.backoff.base, Duration::from_secs(1));
    assert_eq!(settings.backoff.max_delay, Some(Duration::from_secs(60)));
    assert_eq!(settings.extension, "mp4");

    clear_env();
}

#[test]
fn relay_config_works_from_env_alone() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    assert!(load_relay(None).is_err());

    std::env::set_var("VCR_RELAY_SOURCE_DIR", "/srv/replay");
    std::env::set_var("VCR_RELAY_MAX_RETRIES", "3");
    let cfg = load_relay(None).expect("load relay config");
    assert_eq!(cfg.source_dir, PathBuf::from("/srv/replay"));
    assert_eq!(cfg.url, "rtsp://localhost:8554/mystream");
    assert_eq!(cfg.max_retries, Some(3));

    std::env::set_var("VCR_RELAY_MAX_RETRIES", "many");
    assert!(load_relay(None).is_err());

    clear_env();
}

#[test]
fn unknown_keys_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(".toml", &format!("{}\nretention_days = 7\n", TOML_CONFIG));
    let err = CaptureConfig::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
