#![forbid(unsafe_code)]

mod common;

use analyzer::{
    IntrospectionDriver, PythonDriver, RunController, RunStatus, Services, SnapshotReader,
    TypeStats,
};
use common::{
    CENSUS_JSON, Calls, EchoDriver, FakeFactory, FixedClock, OnResume, Script, Sleeper, Step,
};
use config::Config;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Harness {
    dir: TempDir,
    controller: RunController,
    calls: Calls,
}

impl Harness {
    fn new(script: Script) -> Self {
        Self::with(script, "0", Box::new(EchoDriver))
    }

    fn with(script: Script, policy: &str, driver: Box<dyn IntrospectionDriver>) -> Self {
        let dir = tempdir().unwrap();
        let policy_path = dir.path().join("ptrace_scope");
        std::fs::write(&policy_path, policy).unwrap();

        let mut config = Config::default();
        config.host.ptrace_scope_path = policy_path;
        config.attach.timeout = Duration::from_millis(200);
        config.attach.poll_interval = Duration::from_millis(10);
        config.introspection.timeout = Duration::from_millis(300);
        config.run.cleanup_grace = Duration::from_millis(200);

        let calls = Calls::default();
        let services = Services {
            backends: Box::new(FakeFactory {
                script,
                calls: calls.clone(),
            }),
            driver,
            clock: Box::new(FixedClock::default()),
        };
        Self {
            dir,
            controller: RunController::new(config, services),
            calls,
        }
    }

    fn output(&self) -> PathBuf {
        self.dir.path().join("heap.snap")
    }

    fn assert_released(&self) {
        assert_eq!(self.calls.count("shutdown"), 1, "calls: {:?}", self.calls.all());
    }
}

fn census() -> Script {
    Script {
        value: CENSUS_JSON.into(),
        ..Script::default()
    }
}

#[tokio::test]
async fn successful_capture_writes_a_readable_snapshot() {
    let target = Sleeper::spawn();
    let harness = Harness::new(census());
    let output = harness.output();

    let result = harness
        .controller
        .run(target.pid(), &output, Duration::from_secs(5))
        .await;

    assert_eq!(result.status, RunStatus::Success, "{:?}", result.message);
    let snapshot = result.snapshot.unwrap();
    assert_eq!(snapshot.target_id(), target.pid());
    assert_eq!(snapshot.target_name(), "sleep");
    assert_eq!(snapshot.capture_timestamp_ms(), 1_700_000_000_000);
    assert_eq!(
        snapshot.object_type_breakdown()["myapp.Order"],
        TypeStats {
            count: 7,
            total_bytes: 392
        }
    );
    assert_eq!(snapshot.samples()["str"], ["GET /health", "order-17"]);

    assert_eq!(SnapshotReader::read(&output).unwrap(), snapshot);
    assert_eq!(
        harness.calls.all(),
        ["spawn", "attach", "evaluate", "detach", "shutdown"]
    );
}

#[tokio::test]
async fn python_driver_capture_runs_the_target_until_it_publishes() {
    let target = Sleeper::spawn();
    let script = Script {
        replies: vec![
            (Step::Succeed, "1"),
            (Step::Succeed, "0"),
            (Step::Succeed, ""),
        ],
        on_resume: OnResume::Publish(CENSUS_JSON.into()),
        ..Script::default()
    };
    let harness = Harness::with(script, "1", Box::new(PythonDriver::new()));
    let output = harness.output();

    let result = harness
        .controller
        .run(target.pid(), &output, Duration::from_secs(5))
        .await;

    assert_eq!(result.status, RunStatus::Success, "{:?}", result.message);
    assert_eq!(SnapshotReader::read(&output).unwrap().object_count(), 1027);
    assert_eq!(
        harness.calls.all(),
        [
            "spawn", "attach", "evaluate", "evaluate", "evaluate", "resume", "pause", "detach",
            "shutdown"
        ]
    );
}

#[tokio::test]
async fn attach_timeout_is_reported_and_cleaned_up() {
    let target = Sleeper::spawn();
    let harness = Harness::new(Script {
        attach: Step::Hang,
        ..census()
    });
    let output = harness.output();

    let started = Instant::now();
    let result = harness
        .controller
        .run(target.pid(), &output, Duration::from_secs(5))
        .await;

    assert_eq!(result.status, RunStatus::AttachTimeout);
    assert!(result.snapshot.is_none());
    assert!(!output.exists());
    // attach timeout + cleanup grace, with scheduling slack.
    assert!(started.elapsed() < Duration::from_millis(200 + 200 + 300));
    harness.assert_released();
}

#[tokio::test]
async fn target_exiting_mid_attach_is_reported() {
    let mut target = Sleeper::spawn();
    let harness = Harness::new(Script {
        attach_delay: Duration::from_millis(150),
        ..census()
    });
    let output = harness.output();

    let run = harness
        .controller
        .run(target.pid(), &output, Duration::from_secs(5));
    let kill = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        target.kill();
    };
    let (result, ()) = tokio::join!(run, kill);

    assert_eq!(result.status, RunStatus::TargetExited);
    assert!(!output.exists());
    harness.assert_released();
}

#[tokio::test]
async fn forbidding_policy_stops_before_any_attach() {
    let target = Sleeper::spawn();
    let harness = Harness::with(census(), "3\n", Box::new(EchoDriver));
    let output = harness.output();

    let result = harness
        .controller
        .run(target.pid(), &output, Duration::from_secs(5))
        .await;

    assert_eq!(result.status, RunStatus::PermissionDenied);
    assert!(result.message.unwrap().contains("ptrace_scope = 3"));
    assert!(!output.exists());
    assert!(harness.calls.all().is_empty());
}

#[tokio::test]
async fn missing_target_is_reported_without_spawning_a_debugger() {
    let mut target = Sleeper::spawn();
    let pid = target.pid();
    target.kill();
    let harness = Harness::new(census());

    let result = harness
        .controller
        .run(pid, &harness.output(), Duration::from_secs(5))
        .await;

    assert_eq!(result.status, RunStatus::TargetExited);
    assert!(harness.calls.all().is_empty());
}

#[tokio::test]
async fn hung_routine_times_out_and_still_detaches() {
    let target = Sleeper::spawn();
    let harness = Harness::new(Script {
        evaluate: Step::Hang,
        ..census()
    });
    let output = harness.output();

    let started = Instant::now();
    let result = harness
        .controller
        .run(target.pid(), &output, Duration::from_secs(5))
        .await;

    assert_eq!(result.status, RunStatus::ExecutionTimeout);
    assert!(!output.exists());
    assert!(started.elapsed() < Duration::from_millis(300 + 200 + 300));
    assert_eq!(harness.calls.count("interrupt"), 1);
    assert_eq!(harness.calls.count("detach"), 1);
    harness.assert_released();
}

#[tokio::test]
async fn overall_timeout_caps_every_stage() {
    let target = Sleeper::spawn();
    let harness = Harness::new(Script {
        evaluate: Step::Hang,
        ..census()
    });

    let started = Instant::now();
    let result = harness
        .controller
        .run(target.pid(), &harness.output(), Duration::from_millis(80))
        .await;

    assert_eq!(result.status, RunStatus::ExecutionTimeout);
    assert!(started.elapsed() < Duration::from_millis(80 + 200 + 300));
    harness.assert_released();
}

#[tokio::test]
async fn routine_error_is_an_introspection_error() {
    let target = Sleeper::spawn();
    let harness = Harness::new(Script {
        value: r#"{"error": "Traceback (most recent call last):\nMemoryError\n"}"#.into(),
        ..Script::default()
    });
    let output = harness.output();

    let result = harness
        .controller
        .run(target.pid(), &output, Duration::from_secs(5))
        .await;

    assert_eq!(result.status, RunStatus::IntrospectionError);
    assert!(result.message.unwrap().contains("MemoryError"));
    assert!(!output.exists());
    harness.assert_released();
}

#[tokio::test]
async fn malformed_output_is_an_introspection_error() {
    let target = Sleeper::spawn();
    let harness = Harness::new(Script {
        value: r#"{"types": {"dict": "lots"}}"#.into(),
        ..Script::default()
    });

    let result = harness
        .controller
        .run(target.pid(), &harness.output(), Duration::from_secs(5))
        .await;

    assert_eq!(result.status, RunStatus::IntrospectionError);
    harness.assert_released();
}

#[tokio::test]
async fn unwritable_output_is_a_write_failure() {
    let target = Sleeper::spawn();
    let harness = Harness::new(census());
    let output = harness.dir.path().join("no-such-dir").join("heap.snap");

    let result = harness
        .controller
        .run(target.pid(), &output, Duration::from_secs(5))
        .await;

    assert_eq!(result.status, RunStatus::WriteFailed);
    assert!(!output.exists());
    harness.assert_released();
}

#[tokio::test]
async fn cancellation_detaches_and_reports_cancelled() {
    let target = Sleeper::spawn();
    let harness = Harness::new(Script {
        evaluate: Step::Hang,
        ..census()
    });
    let output = harness.output();
    let cancel = CancellationToken::new();

    let run = harness
        .controller
        .run_until(target.pid(), &output, Duration::from_secs(5), &cancel);
    let trigger = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(run, trigger);

    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(!output.exists());
    assert_eq!(harness.calls.count("detach"), 1);
    harness.assert_released();
}

#[tokio::test]
async fn a_failed_run_leaves_an_existing_snapshot_alone() {
    let target = Sleeper::spawn();
    let first = Harness::new(census());
    let output = first.output();
    let result = first
        .controller
        .run(target.pid(), &output, Duration::from_secs(5))
        .await;
    assert!(result.is_success());
    let before = std::fs::read(&output).unwrap();

    let second = Harness::new(Script {
        evaluate: Step::Break,
        ..census()
    });
    let result = second
        .controller
        .run(target.pid(), &output, Duration::from_secs(5))
        .await;
    assert_eq!(result.status, RunStatus::IntrospectionError);
    assert_eq!(std::fs::read(&output).unwrap(), before);
    assert_no_partials(output.parent().unwrap());
}

fn assert_no_partials(dir: &Path) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let name = entry.unwrap().file_name();
        assert!(!name.to_string_lossy().ends_with(".partial"), "{name:?}");
    }
}
