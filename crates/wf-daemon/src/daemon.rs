use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use wf_core::config::Config;
use wf_core::store::EnvCredentialStore;
use wf_core::types::{new_service_id, ExecutionRecord, ExternalInputs, ServiceKind, TaskGraph};
use wf_deploy::DeployedService;
use wf_engine::runner::{LlmUnitRunner, UnitRunner};
use wf_engine::{EngineContext, GraphService};
use wf_harness::provider::{LlmProvider, OpenAiProvider, StubProvider};
use wf_harness::shutdown::{listen_for_os_signals, ShutdownSignal};

/// How long shutdown waits for running services to be stopped.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Process-level wiring: one engine context, the graph lifecycle on top of
/// it, and the shutdown signal that tears deployed services down.
pub struct Daemon {
    ctx: Arc<EngineContext>,
    graphs: GraphService,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Build the engine from `config`, generating through the configured
    /// provider. A missing API key leaves a stub provider in place so
    /// offline commands still work.
    pub fn new(config: Config) -> Self {
        let provider = provider_from_config(&config);
        let runner = LlmUnitRunner::new(provider.clone()).with_max_tool_turns(config.provider.max_tool_turns);
        Self::assemble(config, Arc::new(runner), Some(provider))
    }

    /// Build the engine around a caller-supplied runner.
    pub fn with_runner(config: Config, runner: Arc<dyn UnitRunner>) -> Self {
        Self::assemble(config, runner, None)
    }

    fn assemble(config: Config, runner: Arc<dyn UnitRunner>, provider: Option<Arc<dyn LlmProvider>>) -> Self {
        let credentials = Arc::new(EnvCredentialStore::from_config(&config.provider, &config.integrations));
        let ctx = match provider {
            Some(provider) => EngineContext::new_with_provider(config, runner, provider),
            None => EngineContext::new(config, runner),
        };
        let ctx = Arc::new(ctx.with_credentials(credentials));

        info!(
            upload_dir = %ctx.upload_dir(),
            max_attempts = ctx.config.engine.max_attempts,
            failure_policy = ?ctx.config.engine.failure_policy,
            search = ctx.search.is_some(),
            "engine context ready"
        );
        Self {
            graphs: GraphService::new(ctx.clone()),
            ctx,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn graphs(&self) -> &GraphService {
        &self.graphs
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Wire ctrl-c / SIGTERM to the shutdown signal and stop every deployed
    /// service once it fires.
    pub fn install_signal_handlers(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            listen_for_os_signals(self.shutdown.clone()),
            self.ctx.services.clone().spawn_shutdown_hook(self.shutdown.clone()),
        ]
    }

    /// Block until shutdown is triggered and the services are drained.
    pub async fn wait_for_shutdown(&self) {
        self.shutdown.cancelled().await;
        let mut signal = self.shutdown.clone();
        let drained = signal.wait_for_drain(1, DRAIN_TIMEOUT).await;
        if !drained.is_complete() {
            warn!(?drained, "shutdown finished before services drained");
        }
        info!("daemon stopped");
    }

    /// Store `graph`, then execute it through the graph lifecycle.
    pub async fn run_graph(&self, graph: TaskGraph, inputs: ExternalInputs) -> Result<ExecutionRecord> {
        let graph = self.graphs.create(graph).await?;
        let record = self
            .graphs
            .execute(&graph.id, inputs)
            .await
            .with_context(|| format!("executing graph {}", graph.id))?;
        Ok(record)
    }

    /// Deploy the application in `app_file` as a `kind` service.
    pub async fn serve(&self, kind: ServiceKind, app_file: &Path) -> Result<DeployedService> {
        let source = tokio::fs::read_to_string(app_file)
            .await
            .with_context(|| format!("reading {}", app_file.display()))?;
        let service = self
            .ctx
            .services
            .deploy(kind, &source, &new_service_id(kind))
            .await
            .with_context(|| format!("deploying {}", app_file.display()))?;
        Ok(service)
    }
}

fn provider_from_config(config: &Config) -> Arc<dyn LlmProvider> {
    match OpenAiProvider::from_config(&config.provider) {
        Ok(provider) => {
            info!(model = %config.provider.model, "generation provider configured");
            Arc::new(provider)
        }
        Err(e) => {
            warn!(error = %e, "no generation provider, units will fail until one is configured");
            Arc::new(StubProvider::new("openai"))
        }
    }
}

/// Read a task graph from a JSON file.
pub fn load_graph(path: &Path) -> Result<TaskGraph> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing graph {}", path.display()))
}

/// Read external inputs from a JSON file. No path means no inputs.
pub fn load_inputs(path: Option<&Path>) -> Result<ExternalInputs> {
    let Some(path) = path else {
        return Ok(ExternalInputs::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing inputs {}", path.display()))
}
