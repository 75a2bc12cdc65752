use std::time::Duration;

use vcr_supervisor::testing::{CallLog, Connection, RecordingSink, ScriptedSource};
use vcr_supervisor::{
    start_fleet, CameraSession, CapturePolicy, CaptureSupervisor, Geometry, ShutdownController,
    SystemClock,
};

fn fast_policy() -> CapturePolicy {
    CapturePolicy {
        reconnect_delay: Duration::from_millis(10),
        validation_interval: Duration::from_millis(1),
        retry_delay: Duration::from_millis(10),
        ..CapturePolicy::default()
    }
}

#[test]
fn failing_camera_does_not_disturb_its_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let controller = ShutdownController::new();
    let stop = controller.flag();

    let sessions: Vec<CameraSession> = ["1", "2", "3"]
        .iter()
        .map(|id| {
            CameraSession::new(
                *id,
                format!("rtsp://cam-{}/stream", id),
                "ST01",
                1000,
                1,
                dir.path(),
            )
        })
        .collect();

    let mut sinks = Vec::new();
    let fleet = start_fleet(sessions, &stop, Duration::ZERO, |session| {
        let script = if session.id == "2" {
            vec![Connection::Panic, Connection::Refuse, Connection::Panic]
        } else {
            vec![Connection::Endless(Geometry::new(320, 240))]
        };
        let log = CallLog::new();
        let sink = RecordingSink::new(log.clone());
        sinks.push((session.id.clone(), sink.clone()));
        CaptureSupervisor::new(
            session,
            ScriptedSource::new(log, script),
            sink,
            SystemClock,
            stop.clone(),
        )
        .with_policy(fast_policy())
    })
    .expect("fleet starts");
    assert_eq!(fleet.camera_ids(), vec!["1", "2", "3"]);

    std::thread::sleep(Duration::from_millis(300));
    controller.request_stop();
    fleet.join();

    for (id, sink) in sinks {
        let segments = sink.segments();
        if id == "2" {
            assert!(segments.is_empty(), "camera 2 never connected");
            continue;
        }
        assert!(!segments.is_empty(), "camera {} recorded nothing", id);
        assert!(segments.iter().all(|s| s.released), "camera {} left a segment open", id);
        assert!(segments.iter().map(|s| s.frames).sum::<u64>() > 0);
        assert!(segments.iter().all(|s| s
            .path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(&format!("ST01-{}-", id))));
    }
}

#[test]
fn stop_before_start_launches_nothing() {
    let controller = ShutdownController::new();
    controller.request_stop();
    let stop = controller.flag();

    let sessions = vec![CameraSession::new("1", "stub://a", "ST01", 10, 1, "/tmp/unused")];
    let fleet = start_fleet(sessions, &stop, Duration::ZERO, |session| {
        let log = CallLog::new();
        CaptureSupervisor::new(
            session,
            ScriptedSource::new(log.clone(), Vec::new()),
            RecordingSink::new(log),
            SystemClock,
            stop.clone(),
        )
    })
    .expect("stopping is not a start failure");
    assert!(fleet.is_empty());
    fleet.join();
}
