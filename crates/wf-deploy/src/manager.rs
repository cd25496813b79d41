use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use wf_core::config::DeployConfig;
use wf_core::types::ServiceKind;
use wf_harness::shutdown::{ShutdownGuard, ShutdownSignal};
use wf_telemetry::metrics::{MetricsCollector, SERVICES_RUNNING};

use crate::app::{launch_command, prepare_source, APP_FILE};
use crate::ports::{PortPool, PortsExhausted};
use crate::process::ServiceProcess;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    PortsExhausted(#[from] PortsExhausted),

    #[error("service failed to start on port {port} within {timeout_secs}s")]
    ReadinessTimeout { port: u16, timeout_secs: u64 },

    #[error("failed to launch {kind} service: {reason}")]
    LaunchFailed { kind: ServiceKind, reason: String },

    #[error("service already exists: {0}")]
    Duplicate(String),

    #[error("service not found: {0}")]
    NotFound(String),

    #[error("invalid service id {0:?}: use only letters, digits, '_' and '-'")]
    InvalidServiceId(String),

    #[error("deploy I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeployError>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Running,
    Stopped,
}

/// Public view of one deployed service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedService {
    pub service_id: String,
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    pub port: u16,
    pub pid: Option<u32>,
    pub url: String,
    pub app_file: PathBuf,
    pub status: ServiceStatus,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub alive: bool,
    pub accepting: bool,
}

impl ServiceHealth {
    pub fn is_healthy(&self) -> bool {
        self.alive && self.accepting
    }
}

struct ServiceEntry {
    record: DeployedService,
    process: ServiceProcess,
}

// ---------------------------------------------------------------------------
// ServiceManager
// ---------------------------------------------------------------------------

/// Owns every deployed service for the lifetime of the host process.
///
/// Port allocation and the service map each sit behind their own lock; no
/// lock is held across an await.
pub struct ServiceManager {
    config: DeployConfig,
    upload_dir: PathBuf,
    ports: PortPool,
    services: Mutex<HashMap<String, ServiceEntry>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ServiceManager {
    pub fn new(config: DeployConfig) -> Self {
        let upload_dir = PathBuf::from(&config.upload_dir);
        let ports = PortPool::new(config.port_start..=config.port_end);
        info!(
            port_start = config.port_start,
            port_end = config.port_end,
            upload_dir = %upload_dir.display(),
            "creating ServiceManager"
        );
        Self {
            config,
            upload_dir,
            ports,
            services: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    fn services(&self) -> std::sync::MutexGuard<'_, HashMap<String, ServiceEntry>> {
        self.services.lock().unwrap_or_else(|e| {
            warn!("service map lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Directory a service's source is written to.
    pub fn service_dir(&self, service_id: &str) -> PathBuf {
        self.upload_dir.join(format!("service_{service_id}"))
    }

    /// Launch `source` as a `kind` service and wait until its port accepts
    /// connections.
    pub async fn deploy(&self, kind: ServiceKind, source: &str, service_id: &str) -> Result<DeployedService> {
        if !is_valid_service_id(service_id) {
            warn!(%service_id, "rejecting service id");
            return Err(DeployError::InvalidServiceId(service_id.to_string()));
        }
        if self.services().contains_key(service_id) {
            return Err(DeployError::Duplicate(service_id.to_string()));
        }

        let port = self.ports.allocate()?;
        match self.launch(kind, source, service_id, port).await {
            Ok(record) => Ok(record),
            Err(e) => {
                self.ports.release(port);
                error!(%service_id, %kind, port, error = %e, "deployment failed");
                Err(e)
            }
        }
    }

    async fn launch(&self, kind: ServiceKind, source: &str, service_id: &str, port: u16) -> Result<DeployedService> {
        let dir = self.service_dir(service_id);
        tokio::fs::create_dir_all(&dir).await?;
        let app_file = dir.join(APP_FILE);
        tokio::fs::write(&app_file, prepare_source(kind, source, port)).await?;

        let launch = launch_command(kind, &self.config, port);
        let mut process =
            ServiceProcess::spawn(&launch, &dir, &self.upload_dir).map_err(|e| DeployError::LaunchFailed {
                kind,
                reason: e.to_string(),
            })?;

        // On error the process is dropped here, and kill_on_drop reaps it.
        self.wait_until_ready(kind, port, &mut process).await?;

        let record = DeployedService {
            service_id: service_id.to_string(),
            kind,
            port,
            pid: process.pid(),
            url: format!("http://localhost:{port}"),
            app_file,
            status: ServiceStatus::Running,
            started_at: Utc::now(),
        };

        let running = {
            let mut services = self.services();
            if services.contains_key(service_id) {
                return Err(DeployError::Duplicate(service_id.to_string()));
            }
            services.insert(
                service_id.to_string(),
                ServiceEntry {
                    record: record.clone(),
                    process,
                },
            );
            services.len()
        };

        if let Some(ref m) = self.metrics {
            m.record_deploy(kind.as_str(), running);
        }
        info!(%service_id, %kind, port, url = %record.url, "service deployed");
        Ok(record)
    }

    async fn wait_until_ready(&self, kind: ServiceKind, port: u16, process: &mut ServiceProcess) -> Result<()> {
        let timeout = Duration::from_secs(self.config.readiness_timeout_secs);
        let interval = Duration::from_millis(self.config.readiness_interval_ms);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(status) = process.exit_status() {
                let tail = process.output_tail().join("\n");
                return Err(DeployError::LaunchFailed {
                    kind,
                    reason: format!("process exited with {status} before accepting connections\n{tail}"),
                });
            }
            if port_accepting(port, interval).await {
                debug!(port, "service ready");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DeployError::ReadinessTimeout {
                    port,
                    timeout_secs: self.config.readiness_timeout_secs,
                });
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Stop a service. Returns `false` when no such service is running.
    pub async fn stop(&self, service_id: &str) -> bool {
        let Some(mut entry) = self.services().remove(service_id) else {
            return false;
        };

        entry
            .process
            .terminate(Duration::from_secs(self.config.stop_grace_secs))
            .await;
        self.ports.release(entry.record.port);

        let running = self.services().len();
        if let Some(ref m) = self.metrics {
            m.set_gauge(SERVICES_RUNNING, running as i64);
        }
        info!(%service_id, port = entry.record.port, "service stopped");
        true
    }

    pub fn get(&self, service_id: &str) -> Option<DeployedService> {
        self.services().get(service_id).map(|e| e.record.clone())
    }

    /// Every tracked service, oldest first.
    pub fn list(&self) -> Vec<DeployedService> {
        let mut records: Vec<DeployedService> = self.services().values().map(|e| e.record.clone()).collect();
        records.sort_by_key(|r| r.started_at);
        records
    }

    pub async fn health(&self, service_id: &str) -> Result<ServiceHealth> {
        let (alive, port) = {
            let mut services = self.services();
            let entry = services
                .get_mut(service_id)
                .ok_or_else(|| DeployError::NotFound(service_id.to_string()))?;
            (entry.process.is_alive(), entry.record.port)
        };
        let accepting = port_accepting(port, Duration::from_secs(1)).await;
        Ok(ServiceHealth { alive, accepting })
    }

    /// Recent output of a service's process.
    pub fn logs(&self, service_id: &str) -> Result<Vec<String>> {
        self.services()
            .get(service_id)
            .map(|e| e.process.output_tail())
            .ok_or_else(|| DeployError::NotFound(service_id.to_string()))
    }

    /// Stop every service. Returns how many were stopped.
    pub async fn cleanup_all(&self) -> usize {
        let ids: Vec<String> = self.services().keys().cloned().collect();
        let mut stopped = 0;
        for id in ids {
            if self.stop(&id).await {
                stopped += 1;
            }
        }
        if stopped > 0 {
            info!(stopped, "all services cleaned up");
        }
        stopped
    }

    /// Run [`cleanup_all`](Self::cleanup_all) once `signal` fires, confirming
    /// drain when done.
    pub fn spawn_shutdown_hook(self: Arc<Self>, signal: ShutdownSignal) -> tokio::task::JoinHandle<()> {
        let guard = ShutdownGuard::new(signal.clone());
        tokio::spawn(async move {
            signal.cancelled().await;
            self.cleanup_all().await;
            drop(guard);
        })
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("upload_dir", &self.upload_dir)
            .field("services", &self.services().len())
            .finish()
    }
}

/// Service ids become directory names under the upload dir.
fn is_valid_service_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

async fn port_accepting(port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path, start: u16, end: u16) -> DeployConfig {
        DeployConfig {
            upload_dir: dir.display().to_string(),
            port_start: start,
            port_end: end,
            readiness_timeout_secs: 1,
            readiness_interval_ms: 50,
            stop_grace_secs: 1,
            streamlit_bin: "definitely-not-streamlit".into(),
            ..DeployConfig::default()
        }
    }

    #[tokio::test]
    async fn launch_failure_releases_port() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ServiceManager::new(config(dir.path(), 47400, 47400));

        let err = mgr
            .deploy(ServiceKind::Streamlit, "import streamlit as st", "st_test0001")
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::LaunchFailed { .. }));
        assert_eq!(mgr.ports().allocated_count(), 0);
        assert!(mgr.list().is_empty());
        assert!(dir.path().join("service_st_test0001").join("app.py").exists());
    }

    #[tokio::test]
    async fn service_ids_cannot_leave_the_upload_dir() {
        let root = tempfile::tempdir().unwrap();
        let uploads = root.path().join("uploads");
        let mgr = ServiceManager::new(config(&uploads, 47402, 47402));

        for id in ["x/../../escaped", "../escaped", "a b", ""] {
            let err = mgr
                .deploy(ServiceKind::Streamlit, "import streamlit as st", id)
                .await
                .unwrap_err();
            assert!(matches!(err, DeployError::InvalidServiceId(_)), "{id}");
        }
        assert!(!root.path().join("escaped").exists());
        assert!(!uploads.exists());
        assert_eq!(mgr.ports().allocated_count(), 0);
    }

    #[test]
    fn generated_ids_are_valid() {
        for kind in [ServiceKind::Streamlit, ServiceKind::Gradio, ServiceKind::Flask] {
            assert!(is_valid_service_id(&wf_core::types::new_service_id(kind)));
        }
        assert!(is_valid_service_id("st_1a2b-3c"));
        assert!(!is_valid_service_id("st/1"));
    }

    #[tokio::test]
    async fn stop_unknown_service_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ServiceManager::new(config(dir.path(), 47401, 47401));
        assert!(!mgr.stop("missing").await);
        assert!(matches!(mgr.health("missing").await, Err(DeployError::NotFound(_))));
        assert_eq!(mgr.cleanup_all().await, 0);
    }
}
