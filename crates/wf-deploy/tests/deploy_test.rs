use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use wf_core::config::DeployConfig;
use wf_core::types::ServiceKind;
use wf_deploy::{DeployError, ServiceManager, ServiceStatus};
use wf_harness::shutdown::ShutdownSignal;
use wf_telemetry::metrics::{MetricsCollector, SERVICES_RUNNING};

/// Flask-shaped app backed by the stdlib HTTP server, so only python3 is
/// needed. `app.run()` is rewritten with the allocated port.
const APP: &str = r#"
from http.server import HTTPServer, SimpleHTTPRequestHandler

class App:
    def run(self, host, port):
        HTTPServer((host, port), SimpleHTTPRequestHandler).serve_forever()

app = App()
app.run()
"#;

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn config(dir: &Path, start: u16, end: u16) -> DeployConfig {
    DeployConfig {
        upload_dir: dir.display().to_string(),
        port_start: start,
        port_end: end,
        readiness_timeout_secs: 10,
        readiness_interval_ms: 100,
        stop_grace_secs: 2,
        ..DeployConfig::default()
    }
}

#[tokio::test]
async fn deploy_health_stop_roundtrip() {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let metrics = Arc::new(MetricsCollector::new());
    let mgr = ServiceManager::new(config(dir.path(), 47500, 47509)).with_metrics(metrics.clone());

    let svc = mgr.deploy(ServiceKind::Flask, APP, "fl_roundtrip").await.unwrap();
    assert_eq!(svc.status, ServiceStatus::Running);
    assert_eq!(svc.url, format!("http://localhost:{}", svc.port));
    assert!(svc.pid.is_some());
    assert_eq!(metrics.get_gauge(SERVICES_RUNNING), 1);

    let source = std::fs::read_to_string(&svc.app_file).unwrap();
    assert!(source.contains(&format!("app.run(host=\"0.0.0.0\", port={})", svc.port)));

    let health = mgr.health("fl_roundtrip").await.unwrap();
    assert!(health.is_healthy());
    assert_eq!(mgr.list().len(), 1);
    assert!(matches!(
        mgr.deploy(ServiceKind::Flask, APP, "fl_roundtrip").await,
        Err(DeployError::Duplicate(_))
    ));

    assert!(mgr.stop("fl_roundtrip").await);
    assert!(!mgr.ports().is_allocated(svc.port));
    assert!(mgr.get("fl_roundtrip").is_none());
    assert_eq!(metrics.get_gauge(SERVICES_RUNNING), 0);
    assert!(!mgr.stop("fl_roundtrip").await);
}

#[tokio::test]
async fn concurrent_deploys_get_distinct_ports() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let mgr = Arc::new(ServiceManager::new(config(dir.path(), 47520, 47521)));

    let a = {
        let mgr = mgr.clone();
        tokio::spawn(async move { mgr.deploy(ServiceKind::Flask, APP, "fl_a").await })
    };
    let b = {
        let mgr = mgr.clone();
        tokio::spawn(async move { mgr.deploy(ServiceKind::Flask, APP, "fl_b").await })
    };
    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();
    assert_ne!(a.port, b.port);

    let err = mgr.deploy(ServiceKind::Flask, APP, "fl_c").await.unwrap_err();
    assert!(matches!(err, DeployError::PortsExhausted(_)));

    assert_eq!(mgr.cleanup_all().await, 2);
    assert_eq!(mgr.ports().allocated_count(), 0);
}

#[tokio::test]
async fn app_that_never_listens_times_out() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), 47530, 47530);
    cfg.readiness_timeout_secs = 1;
    let mgr = ServiceManager::new(cfg);

    let err = mgr
        .deploy(
            ServiceKind::Gradio,
            "import time\ntime.sleep(30)",
            "gr_sleepy",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::ReadinessTimeout { port: 47530, .. }));
    assert_eq!(mgr.ports().allocated_count(), 0);
}

#[tokio::test]
async fn shutdown_signal_cleans_up_services() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let mgr = Arc::new(ServiceManager::new(config(dir.path(), 47540, 47541)));
    mgr.deploy(ServiceKind::Flask, APP, "fl_shutdown").await.unwrap();

    let mut signal = ShutdownSignal::new();
    let hook = mgr.clone().spawn_shutdown_hook(signal.clone());
    signal.trigger();

    assert!(signal.wait_for_drain(1, Duration::from_secs(10)).await.is_complete());
    hook.await.unwrap();
    assert!(mgr.list().is_empty());
}
