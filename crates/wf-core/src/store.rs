//! Record-store and credential interfaces consumed by the engine.
//!
//! Persistence is an external collaborator; the engine only needs
//! get/put/update semantics. The in-memory implementations here back tests
//! and the single-process daemon.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::config::{CredentialProvider, IntegrationConfig, ProviderConfig};
use crate::types::{ExecutionRecord, ExecutionStatus, GraphStatus, TaskGraph};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("duplicate record: {0}")]
    Duplicate(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn get(&self, graph_id: &str) -> Result<Option<TaskGraph>, StoreError>;
    async fn put(&self, graph: TaskGraph) -> Result<(), StoreError>;
    async fn update_status(&self, graph_id: &str, status: GraphStatus) -> Result<(), StoreError>;
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<TaskGraph>, StoreError>;
}

/// Partial update applied to a stored execution record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionUpdate {
    pub status: Option<ExecutionStatus>,
    pub outputs: Option<Map<String, Value>>,
    pub final_output: Option<Value>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ExecutionUpdate {
    pub fn progress(status: ExecutionStatus, outputs: Map<String, Value>) -> Self {
        Self {
            status: Some(status),
            outputs: Some(outputs),
            ..Self::default()
        }
    }

    pub fn apply(self, record: &mut ExecutionRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(outputs) = self.outputs {
            record.outputs = outputs;
        }
        if let Some(final_output) = self.final_output {
            record.final_output = Some(final_output);
        }
        if let Some(ended_at) = self.ended_at {
            record.ended_at = Some(ended_at);
        }
    }
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert(&self, record: ExecutionRecord) -> Result<(), StoreError>;
    async fn update(&self, execution_id: &str, update: ExecutionUpdate) -> Result<(), StoreError>;
    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, StoreError>;
    async fn list_for_graph(&self, graph_id: &str) -> Result<Vec<ExecutionRecord>, StoreError>;
}

/// Secret material for one service, e.g. `{"api_key": "..."}`.
pub type SecretMap = HashMap<String, String>;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, owner: &str, service: &str) -> Result<Option<SecretMap>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory stores
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    graphs: DashMap<String, TaskGraph>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn get(&self, graph_id: &str) -> Result<Option<TaskGraph>, StoreError> {
        Ok(self.graphs.get(graph_id).map(|g| g.clone()))
    }

    async fn put(&self, graph: TaskGraph) -> Result<(), StoreError> {
        self.graphs.insert(graph.id.clone(), graph);
        Ok(())
    }

    async fn update_status(&self, graph_id: &str, status: GraphStatus) -> Result<(), StoreError> {
        let mut graph = self
            .graphs
            .get_mut(graph_id)
            .ok_or_else(|| StoreError::NotFound(graph_id.to_string()))?;
        graph.status = status;
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<TaskGraph>, StoreError> {
        let mut graphs: Vec<TaskGraph> = self
            .graphs
            .iter()
            .filter(|g| g.user_id == user_id)
            .map(|g| g.clone())
            .collect();
        graphs.sort_by_key(|g| g.created_at);
        Ok(graphs)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    records: DashMap<String, ExecutionRecord>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn insert(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        if self.records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update(&self, execution_id: &str, update: ExecutionUpdate) -> Result<(), StoreError> {
        let mut record = self
            .records
            .get_mut(execution_id)
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))?;
        update.apply(&mut record);
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self.records.get(execution_id).map(|r| r.clone()))
    }

    async fn list_for_graph(&self, graph_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut records: Vec<ExecutionRecord> = self
            .records
            .iter()
            .filter(|r| r.graph_id == graph_id)
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }
}

/// Credentials keyed by `(owner, service)`.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    secrets: DashMap<(String, String), SecretMap>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, owner: impl Into<String>, service: impl Into<String>, secrets: SecretMap) {
        self.secrets.insert((owner.into(), service.into()), secrets);
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get(&self, owner: &str, service: &str) -> Result<Option<SecretMap>, StoreError> {
        Ok(self
            .secrets
            .get(&(owner.to_string(), service.to_string()))
            .map(|s| s.clone()))
    }
}

/// Resolves service names to env vars, ignoring the owner.
#[derive(Debug, Clone)]
pub struct EnvCredentialStore {
    vars: HashMap<String, String>,
}

impl EnvCredentialStore {
    pub fn from_config(provider: &ProviderConfig, integrations: &IntegrationConfig) -> Self {
        let mut vars = HashMap::new();
        vars.insert("openai".to_string(), provider.api_key_env.clone());
        vars.insert("tavily".to_string(), integrations.tavily_api_key_env.clone());
        vars.insert("slack".to_string(), integrations.slack_bot_token_env.clone());
        vars.insert("mongodb".to_string(), integrations.mongodb_uri_env.clone());
        Self { vars }
    }
}

#[async_trait]
impl CredentialStore for EnvCredentialStore {
    async fn get(&self, _owner: &str, service: &str) -> Result<Option<SecretMap>, StoreError> {
        let Some(var) = self.vars.get(service) else {
            return Ok(None);
        };
        Ok(CredentialProvider::from_env(var).map(|value| {
            let mut secrets = SecretMap::new();
            secrets.insert("api_key".to_string(), value);
            secrets
        }))
    }
}

/// Credential service backing a capability, if it needs one.
pub fn credential_service_for(capability: &str) -> Option<&'static str> {
    match capability {
        "rag_builder" | "rag_chat" => Some("openai"),
        "web_search" => Some("tavily"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
