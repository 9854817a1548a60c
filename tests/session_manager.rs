mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;
use toolchain_session_host::error::AppError;
use toolchain_session_host::tools::job_tool::{JobKind, JobState};
use toolchain_session_host::tools::session_manager::{
    Backends, MonitorRequest, SessionManager, PREF_AUTH, PREF_BAUD_RATE, PREF_LINE_ENDING,
    PREF_NETWORK_PORTS, PREF_PORT, PREF_PROGRAMMER,
};
use toolchain_session_host::tools::serial_tool::PortInfo;
use toolchain_session_host::tools::sink::{BufferSink, EventKind, StopReason};
use toolchain_session_host::tools::toolchain_tool::JobOptions;
use toolchain_session_host::utils::line_ending_handler::LineEnding;
use toolchain_session_host::utils::preferences::Preferences;
use toolchain_session_host::utils::session_registry::SessionKey;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    _project: TempDir,
    manager: SessionManager,
    connector: Arc<MockConnector>,
    launcher: Arc<ScriptedLauncher>,
    sink: Arc<BufferSink>,
}

fn harness(script: Script) -> Harness {
    let project = create_project();
    let config = test_config(project.path());
    let connector = MockConnector::new();
    let launcher = ScriptedLauncher::new(script);
    let sink = Arc::new(BufferSink::new());
    let preferences = Arc::new(Preferences::open(&config.preferences_file).unwrap());
    let backends = Backends {
        connector: connector.clone(),
        ports: Arc::new(FixedPorts(vec![PortInfo {
            name: "COM3".into(),
            kind: "usb",
            description: Some("Arduino Uno".into()),
        }])),
        launcher: launcher.clone(),
    };
    let manager = SessionManager::with_backends(&config, preferences, backends, sink.clone());
    Harness {
        _project: project,
        manager,
        connector,
        launcher,
        sink,
    }
}

fn port(name: &str) -> MonitorRequest {
    MonitorRequest {
        port: Some(name.to_string()),
        ..MonitorRequest::default()
    }
}

#[test]
fn start_monitor_uses_preference_defaults_and_remembers_port() {
    let h = harness(Script::exits(0));
    h.manager.preferences().set(PREF_BAUD_RATE, 115200u32).unwrap();
    h.manager.preferences().set(PREF_LINE_ENDING, "\r\n").unwrap();

    let status = h.manager.start_monitor(port("COM3")).unwrap();
    assert!(status.running);
    let settings = status.settings.unwrap();
    assert_eq!(settings.baud_rate, 115200);
    assert_eq!(settings.line_ending, LineEnding::CrLf);
    assert_eq!(h.manager.preferences().get(PREF_PORT, String::new()), "COM3");

    // Without a port the remembered one is used.
    assert!(h.manager.monitor_state(None).running);
    h.manager.send_serial(None, "AT").unwrap();
    assert_eq!(h.connector.device("COM3").written(), b"AT\r\n");

    let stopped = h.manager.stop_monitor(None).unwrap();
    assert!(!stopped.running);
}

#[test]
fn missing_port_is_invalid_input() {
    let h = harness(Script::exits(0));
    let err = h.manager.start_monitor(MonitorRequest::default()).unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
    assert!(!h.manager.monitor_state(None).running);
}

#[test]
fn bad_line_ending_is_rejected() {
    let h = harness(Script::exits(0));
    let request = MonitorRequest {
        line_ending: Some("\t".into()),
        ..port("COM3")
    };
    assert!(matches!(
        h.manager.start_monitor(request),
        Err(AppError::InvalidInput(_))
    ));
    assert!(h.connector.opens().is_empty());
}

#[test]
fn toggle_monitor_flips_state() {
    let h = harness(Script::exits(0));
    assert!(h.manager.toggle_monitor(port("COM3")).unwrap().running);
    assert!(!h.manager.toggle_monitor(port("COM3")).unwrap().running);
    assert!(h.manager.toggle_monitor(port("COM3")).unwrap().running);
    assert_eq!(h.connector.opens().len(), 2);
    h.manager.stop_monitor(Some("COM3")).unwrap();
}

#[test]
fn close_view_then_stop_is_not_running() {
    let h = harness(Script::exits(0));
    h.manager.start_monitor(port("COM3")).unwrap();
    assert!(h.manager.close_monitor_view("COM3"));
    assert!(matches!(
        h.manager.stop_monitor(Some("COM3")),
        Err(AppError::NotRunning(_))
    ));
}

#[tokio::test]
async fn upload_frees_monitored_port_first() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(Script::exits(0));
        let monitor = h.manager.start_monitor(port("COM3")).unwrap();
        let monitor_id = monitor.session_id.unwrap();

        let job = h
            .manager
            .run_job(JobKind::Upload, JobOptions::default())
            .await
            .unwrap();
        // The monitor was stopped before the uploader was launched.
        assert!(!h.manager.monitor_state(Some("COM3")).running);
        assert_eq!(
            kinds_for(&h.sink, &monitor_id).last(),
            Some(&EventKind::Stopped(StopReason::Requested))
        );

        let launched = h.launcher.launched();
        let args = &launched[0].args;
        assert!(args.windows(2).any(|w| w == ["--upload-port", "COM3"]));
        assert!(args.windows(2).any(|w| w == ["-t", "upload"]));
        assert_eq!(job.key(), &SessionKey::from("project"));
        assert_eq!(job.wait().await.exit.state, JobState::Succeeded);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn build_and_upload_share_a_slot() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(Script::long_running());
        let build = h
            .manager
            .run_job(JobKind::Build, JobOptions::default())
            .await
            .unwrap();
        let upload = h.manager.run_job(JobKind::Upload, JobOptions::default()).await;
        assert!(matches!(upload, Err(AppError::AlreadyActive(_))));

        // An explicit target gets its own slot.
        let options = JobOptions {
            target: Some("nightly".into()),
            ..JobOptions::default()
        };
        let nightly = h.manager.run_job(JobKind::Build, options).await.unwrap();
        assert_eq!(h.manager.list_sessions().len(), 2);

        h.manager.cancel_job("project").unwrap();
        assert_eq!(build.wait().await.exit.state, JobState::Cancelled);
        assert!(h.manager.job("nightly").is_some());
        h.manager.shutdown().await;
        assert_eq!(nightly.wait().await.exit.state, JobState::Cancelled);
        assert!(wait_for_async(Duration::from_secs(2), || h.manager.list_sessions().is_empty()).await);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn build_without_manifest_is_rejected() {
    let h = harness(Script::exits(0));
    let options = JobOptions {
        project_dir: Some("missing-project".into()),
        ..JobOptions::default()
    };
    let err = h.manager.run_job(JobKind::Build, options).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidPath(_)));
    assert!(h.launcher.launched().is_empty());
}

#[test]
fn list_ports_merges_saved_network_ports() {
    let h = harness(Script::exits(0));
    h.manager
        .set_preference(PREF_NETWORK_PORTS, serde_json::json!(["192.168.4.1:23"]))
        .unwrap();
    let names: Vec<_> = h.manager.list_ports().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["COM3", "socket://192.168.4.1:23"]);
}

#[tokio::test]
async fn shutdown_stops_monitors_and_cancels_jobs() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(Script {
            ignore_terminate: true,
            ..Script::long_running()
        });
        let monitor = h.manager.start_monitor(port("COM3")).unwrap();
        let job = h
            .manager
            .run_job(JobKind::Build, JobOptions::default())
            .await
            .unwrap();

        h.manager.shutdown().await;

        assert!(wait_for_async(Duration::from_secs(2), || h.manager.list_sessions().is_empty()).await);
        assert_eq!(job.state(), JobState::Cancelled);
        let monitor_events = kinds_for(&h.sink, &monitor.session_id.unwrap());
        assert_eq!(
            monitor_events.last(),
            Some(&EventKind::Stopped(StopReason::Requested))
        );
        assert!(wait_for_async(Duration::from_secs(2), || {
            matches!(kinds_for(&h.sink, job.id()).last(), Some(EventKind::Exited(_)))
        })
        .await);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn rejected_upload_leaves_monitor_running() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(Script::long_running());
        let monitor = h.manager.start_monitor(port("COM3")).unwrap();
        let build = h
            .manager
            .run_job(JobKind::Build, JobOptions::default())
            .await
            .unwrap();

        let upload = h.manager.run_job(JobKind::Upload, JobOptions::default()).await;
        assert!(matches!(upload, Err(AppError::AlreadyActive(ref k)) if k == "project"));
        assert!(h.manager.monitor_state(Some("COM3")).running);
        assert_eq!(kinds_for(&h.sink, monitor.session_id.as_deref().unwrap()), vec![EventKind::Started]);

        // Same for a project without a manifest.
        let options = JobOptions {
            project_dir: Some("missing-project".into()),
            target: Some("elsewhere".into()),
            ..JobOptions::default()
        };
        let upload = h.manager.run_job(JobKind::Upload, options).await;
        assert!(matches!(upload, Err(AppError::InvalidPath(_))));
        assert!(h.manager.monitor_state(Some("COM3")).running);
        assert_eq!(h.launcher.launched().len(), 1);

        h.manager.shutdown().await;
        assert_eq!(build.wait().await.exit.state, JobState::Cancelled);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn upload_uses_saved_programmer_and_password() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(Script::exits(0));
        h.manager.preferences().set(PREF_PORT, "COM5").unwrap();
        h.manager.preferences().set(PREF_PROGRAMMER, "usbasp").unwrap();
        h.manager.preferences().set(PREF_AUTH, "hunter2").unwrap();

        let job = h
            .manager
            .run_job(JobKind::Upload, JobOptions::default())
            .await
            .unwrap();
        assert!(!job.command().contains("hunter2"));
        job.wait().await;

        let launched = h.launcher.launched();
        let spec = &launched[0];
        assert!(spec.args.windows(2).any(|w| w == ["-t", "program"]));
        assert!(spec.args.contains(&"upload_protocol=usbasp".to_string()));
        assert!(spec.args.windows(2).any(|w| w == ["--upload-port", "COM5"]));
        assert!(spec
            .env
            .contains(&("PLATFORMIO_UPLOAD_FLAGS".to_string(), "--auth=hunter2".to_string())));

        // The editor stores `false` when no programmer is selected.
        h.manager
            .set_preference(PREF_PROGRAMMER, serde_json::json!(false))
            .unwrap();
        let job = h
            .manager
            .run_job(JobKind::Upload, JobOptions::default())
            .await
            .unwrap();
        job.wait().await;
        let launched = h.launcher.launched();
        assert!(launched[1].args.windows(2).any(|w| w == ["-t", "upload"]));
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn upgrade_runs_in_its_own_slot() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(Script::long_running());
        let build = h
            .manager
            .run_job(JobKind::Build, JobOptions::default())
            .await
            .unwrap();
        let upgrade = h
            .manager
            .run_job(JobKind::Upgrade, JobOptions::default())
            .await
            .unwrap();
        assert_eq!(upgrade.key(), &SessionKey::from("toolchain"));
        assert_eq!(h.launcher.launched()[1].args, vec!["upgrade".to_string()]);

        h.manager.shutdown().await;
        assert_eq!(build.wait().await.exit.state, JobState::Cancelled);
        assert_eq!(upgrade.wait().await.exit.state, JobState::Cancelled);
    })
    .await
    .unwrap();
}
