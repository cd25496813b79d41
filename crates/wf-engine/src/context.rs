use std::sync::Arc;

use wf_core::config::Config;
use wf_core::error_memory::{FailureMemory, InMemoryFailureMemory};
use wf_core::store::{
    CredentialStore, ExecutionStore, GraphStore, InMemoryCredentialStore, InMemoryExecutionStore, InMemoryGraphStore,
};
use wf_deploy::ServiceManager;
use wf_harness::knowledge::KnowledgeSearch;
use wf_harness::provider::LlmProvider;
use wf_telemetry::metrics::MetricsCollector;

use crate::registry::CapabilityRegistry;
use crate::runner::UnitRunner;

/// Everything the engine needs, built once per process and shared by
/// reference. Tests swap collaborators through the `with_*` builders.
pub struct EngineContext {
    pub config: Config,
    pub graphs: Arc<dyn GraphStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub failure_memory: Arc<dyn FailureMemory>,
    pub registry: Arc<CapabilityRegistry>,
    pub services: Arc<ServiceManager>,
    pub runner: Arc<dyn UnitRunner>,
    pub search: Option<Arc<dyn KnowledgeSearch>>,
    pub metrics: Arc<MetricsCollector>,
}

impl EngineContext {
    /// In-memory stores, a deployment manager and a registry derived from
    /// `config`.
    pub fn new(config: Config, runner: Arc<dyn UnitRunner>) -> Self {
        Self::build(config, runner, None)
    }

    /// Like [`EngineContext::new`], with `rag_chat` answering through
    /// `provider`.
    pub fn new_with_provider(config: Config, runner: Arc<dyn UnitRunner>, provider: Arc<dyn LlmProvider>) -> Self {
        Self::build(config, runner, Some(provider))
    }

    fn build(config: Config, runner: Arc<dyn UnitRunner>, provider: Option<Arc<dyn LlmProvider>>) -> Self {
        let metrics = Arc::new(MetricsCollector::with_defaults());
        let services = Arc::new(ServiceManager::new(config.deploy.clone()).with_metrics(metrics.clone()));
        let mut registry = CapabilityRegistry::from_config(&config, services.clone());
        if let Some(provider) = provider {
            registry = registry.with_provider(provider);
        }
        let search = registry.search();
        Self {
            graphs: Arc::new(InMemoryGraphStore::new()),
            executions: Arc::new(InMemoryExecutionStore::new()),
            credentials: Arc::new(InMemoryCredentialStore::new()),
            failure_memory: Arc::new(InMemoryFailureMemory::new()),
            registry: Arc::new(registry),
            services,
            runner,
            search,
            metrics,
            config,
        }
    }

    pub fn with_graph_store(mut self, graphs: Arc<dyn GraphStore>) -> Self {
        self.graphs = graphs;
        self
    }

    pub fn with_execution_store(mut self, executions: Arc<dyn ExecutionStore>) -> Self {
        self.executions = executions;
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_failure_memory(mut self, memory: Arc<dyn FailureMemory>) -> Self {
        self.failure_memory = memory;
        self
    }

    /// Replace the registry, taking its knowledge search along. It must
    /// share this context's [`ServiceManager`] for deployed services to be
    /// cleaned up on shutdown.
    pub fn with_registry(mut self, registry: CapabilityRegistry) -> Self {
        self.search = registry.search();
        self.registry = Arc::new(registry);
        self
    }

    /// Knowledge search used by externally-informed retries.
    pub fn with_search(mut self, search: Option<Arc<dyn KnowledgeSearch>>) -> Self {
        self.search = search;
        self
    }

    pub fn upload_dir(&self) -> &str {
        &self.config.deploy.upload_dir
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("registry", &self.registry)
            .field("services", &self.services)
            .field("search", &self.search.is_some())
            .finish_non_exhaustive()
    }
}
