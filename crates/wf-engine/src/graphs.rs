//! Graph lifecycle: approve, modify and execute stored graphs.

use std::sync::Arc;

use tracing::{info, warn};

use wf_core::store::StoreError;
use wf_core::types::{Edge, ExecutionRecord, ExecutionStatus, ExternalInputs, GraphStatus, TaskGraph, TaskUnit};

use crate::context::EngineContext;
use crate::orchestrator::{ExecutionOrchestrator, OrchestratorError};
use crate::scheduler::{self, ValidationReport};

#[derive(Debug, thiserror::Error)]
pub enum GraphServiceError {
    #[error("graph not found: {0}")]
    NotFound(String),

    #[error("graph failed validation: {}", .0.errors.join("; "))]
    Invalid(ValidationReport),

    #[error("graph {0} is running and cannot be modified")]
    Running(String),

    #[error(transparent)]
    Execution(#[from] OrchestratorError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, GraphServiceError>;

pub struct GraphService {
    ctx: Arc<EngineContext>,
    orchestrator: ExecutionOrchestrator,
}

impl GraphService {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let orchestrator = ExecutionOrchestrator::new(ctx.clone());
        Self { ctx, orchestrator }
    }

    pub fn orchestrator(&self) -> &ExecutionOrchestrator {
        &self.orchestrator
    }

    /// Store a new draft graph.
    pub async fn create(&self, mut graph: TaskGraph) -> Result<TaskGraph> {
        graph.status = GraphStatus::Draft;
        self.ctx.graphs.put(graph.clone()).await?;
        info!(graph_id = %graph.id, units = graph.units.len(), "graph created");
        Ok(graph)
    }

    async fn load(&self, graph_id: &str) -> Result<TaskGraph> {
        self.ctx
            .graphs
            .get(graph_id)
            .await?
            .ok_or_else(|| GraphServiceError::NotFound(graph_id.to_string()))
    }

    /// Validate and mark approved. An invalid graph keeps its status and the
    /// full report is returned in the error.
    pub async fn approve(&self, graph_id: &str) -> Result<ValidationReport> {
        let graph = self.load(graph_id).await?;
        let report = scheduler::validate(&graph);
        if !report.is_valid() {
            warn!(graph_id, errors = report.errors.len(), "approval rejected");
            return Err(GraphServiceError::Invalid(report));
        }
        self.ctx.graphs.update_status(graph_id, GraphStatus::Approved).await?;
        info!(graph_id, warnings = report.warnings.len(), "graph approved");
        Ok(report)
    }

    /// Replace the graph body and reset it to draft.
    pub async fn modify(
        &self,
        graph_id: &str,
        units: Vec<TaskUnit>,
        edges: Vec<Edge>,
        description: Option<String>,
    ) -> Result<TaskGraph> {
        let mut graph = self.load(graph_id).await?;
        if graph.status == GraphStatus::Running {
            return Err(GraphServiceError::Running(graph_id.to_string()));
        }
        graph.units = units;
        graph.edges = edges;
        if let Some(description) = description {
            graph.description = description;
        }
        graph.status = GraphStatus::Draft;
        self.ctx.graphs.put(graph.clone()).await?;
        info!(graph_id, units = graph.units.len(), edges = graph.edges.len(), "graph modified");
        Ok(graph)
    }

    /// Run a stored graph and mirror the run's result onto the graph status.
    pub async fn execute(&self, graph_id: &str, inputs: ExternalInputs) -> Result<ExecutionRecord> {
        let graph = self.load(graph_id).await?;
        let report = scheduler::validate(&graph);
        if !report.is_valid() {
            return Err(GraphServiceError::Invalid(report));
        }

        self.ctx.graphs.update_status(graph_id, GraphStatus::Running).await?;
        let result = self.orchestrator.execute(&graph, inputs).await;

        let status = match result {
            Ok(ref record) if record.status == ExecutionStatus::Completed => GraphStatus::Completed,
            _ => GraphStatus::Failed,
        };
        self.ctx.graphs.update_status(graph_id, status).await?;
        Ok(result?)
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<TaskGraph>> {
        Ok(self.ctx.graphs.list_for_user(user_id).await?)
    }

    pub async fn executions(&self, graph_id: &str) -> Result<Vec<ExecutionRecord>> {
        Ok(self.ctx.executions.list_for_graph(graph_id).await?)
    }
}
