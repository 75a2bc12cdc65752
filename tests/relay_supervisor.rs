use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;

use vcr_supervisor::relay::{RelayOutcome, RelayPhase, RelaySettings, RelaySupervisor};
use vcr_supervisor::testing::{FakeLauncher, FakeRun, ManualClock};
use vcr_supervisor::{ShutdownController, StopFlag, SupervisorError};

fn clock() -> ManualClock {
    ManualClock::starting_at(
        NaiveDate::from_ymd_opt(2026, 3, 7)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap(),
    )
}

fn media_dir(names: &[&str]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for name in names {
        std::fs::write(dir.path().join(name), b"").unwrap();
    }
    dir
}

fn settings(dir: &Path) -> RelaySettings {
    let mut settings = RelaySettings::new(dir);
    settings.url = "rtsp://localhost:8554/mystream".to_string();
    settings
}

#[test]
fn backoff_doubles_until_the_retry_cap() {
    let dir = media_dir(&["ST01-1-20260307_120000.mp4"]);
    let (launcher, probe) = FakeLauncher::new(vec![FakeRun::exits_after(1, Some(1)); 4]);
    let clock = clock();
    let mut settings = settings(dir.path());
    settings.backoff.base = Duration::from_secs(3);
    settings.backoff.max_retries = Some(3);

    let mut relay = RelaySupervisor::new(settings, launcher, clock.clone(), StopFlag::new());
    let outcome = relay.run();

    assert!(matches!(outcome, RelayOutcome::RetriesExhausted { attempts: 4 }));
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(probe.spawns().len(), 4);
    assert_eq!(
        clock.pauses(),
        vec![
            Duration::from_secs(3),
            Duration::from_secs(6),
            Duration::from_secs(12)
        ]
    );
    // Every attempt got a fresh manifest, and none survived.
    let manifests = probe.manifest_paths();
    assert_eq!(manifests.len(), 4);
    assert!(manifests.iter().all(|path| !path.exists()));
}

#[test]
fn transport_runs_with_the_concat_loop_command_line() {
    let dir = media_dir(&["b.mp4", "a-10.mp4", "a-2.mp4", "a-1.mp4", "notes.txt"]);
    let (launcher, probe) = FakeLauncher::new(vec![FakeRun::exits_after(0, Some(0))]);

    let mut relay = RelaySupervisor::new(settings(dir.path()), launcher, clock(), StopFlag::new());
    let outcome = relay.run();
    assert!(matches!(outcome, RelayOutcome::Clean));
    assert_eq!(outcome.exit_code(), 0);

    let argv = &probe.spawns()[0];
    assert_eq!(argv[0], "ffmpeg");
    assert_eq!(
        argv[1..8],
        ["-re", "-stream_loop", "-1", "-f", "concat", "-safe", "0"]
    );
    assert_eq!(argv.last().map(String::as_str), Some("rtsp://localhost:8554/mystream"));

    let manifest = probe.manifests()[0].clone().expect("manifest readable at spawn");
    let names: Vec<&str> = manifest
        .lines()
        .map(|line| {
            let path = line
                .strip_prefix("file '")
                .and_then(|rest| rest.strip_suffix('\''))
                .unwrap();
            path.rsplit('/').next().unwrap()
        })
        .collect();
    assert_eq!(names, vec!["a-1.mp4", "a-10.mp4", "a-2.mp4", "b.mp4"]);
}

#[test]
fn repeated_signals_terminate_the_transport_once() {
    let dir = media_dir(&["clip.mp4"]);
    let controller = ShutdownController::new();
    let (launcher, probe) = FakeLauncher::new(vec![
        FakeRun::runs_until_terminated().signal_at(2, controller.clone()),
    ]);
    let clock = clock();

    let mut relay = RelaySupervisor::new(
        settings(dir.path()),
        launcher,
        clock.clone(),
        controller.flag(),
    );
    let outcome = relay.run();

    assert!(matches!(outcome, RelayOutcome::Stopped));
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(relay.phase(), RelayPhase::Terminated);
    assert_eq!(probe.terminations(), 1);
    assert_eq!(probe.waits(), 1);
    assert!(clock.pauses().is_empty());
    assert!(!probe.manifest_paths()[0].exists());
    // Stopping again afterwards is a no-op.
    assert!(!controller.request_stop());
}

#[test]
fn empty_source_directory_is_fatal_without_spawning() {
    let dir = media_dir(&["notes.txt"]);
    let (launcher, probe) = FakeLauncher::new(vec![FakeRun::exits_after(0, Some(0))]);
    let clock = clock();

    let mut relay =
        RelaySupervisor::new(settings(dir.path()), launcher, clock.clone(), StopFlag::new());
    let outcome = relay.run();

    match &outcome {
        RelayOutcome::ConfigFailed(err) => assert!(matches!(err, SupervisorError::Config(_))),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(outcome.exit_code(), 1);
    assert!(probe.spawns().is_empty());
    assert_eq!(relay.attempt(), 0);
    assert!(clock.pauses().is_empty());
}

#[test]
fn diagnostics_are_drained_before_the_attempt_ends() {
    let dir = media_dir(&["clip.mp4"]);
    let (launcher, probe) = FakeLauncher::new(vec![
        FakeRun::exits_after(2, Some(1)).diagnostics(&[
            "Input #0, concat, from 'list.txt':",
            "Connection to tcp://localhost:8554 failed: Connection refused",
        ]),
        FakeRun::exits_after(0, Some(0)).diagnostics(&["Output #0, rtsp"]),
    ]);

    let mut relay = RelaySupervisor::new(settings(dir.path()), launcher, clock(), StopFlag::new());
    assert!(matches!(relay.run(), RelayOutcome::Clean));
    assert_eq!(probe.undrained_diagnostics(), 0);
    assert_eq!(relay.attempt(), 1);
}
