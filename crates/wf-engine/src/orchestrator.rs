//! Execution orchestrator: runs a validated graph level by level.
//!
//! Units inside a level run concurrently and the level is a barrier: the
//! next one starts only after every unit reached a terminal outcome. A unit
//! that exhausts its retries stores an error payload under its id and marks
//! the run failed, but later levels still run. Under
//! [`FailurePolicy::SkipDependents`] its transitive dependents are marked
//! skipped instead of invoked.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use futures::future::join_all;
use regex::Regex;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use wf_core::config::FailurePolicy;
use wf_core::store::{ExecutionUpdate, StoreError};
use wf_core::types::{
    is_reserved_key, DeployedServiceRef, ExecutionRecord, ExecutionStatus, ExternalInputs, ServiceKind, TaskGraph,
    TaskUnit, DEPLOYED_SERVICES_KEY, ERROR_MEMORY_KEY, FILES_CONTEXT_KEY, USER_FILES_INPUT,
};

use crate::context::EngineContext;
use crate::invoker::{UnitInvoker, UnitOutcome};
use crate::prompts::{error_guidance, UnitInput};
use crate::scheduler::{self, SchedulerError};

/// Failure memory records seeded into a run's error map.
const SEEDED_SIGNATURES: usize = 50;
const NO_SOLUTION: &str = "No solution found after all retries";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("execution store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// Deployed-service detection
// ---------------------------------------------------------------------------

fn url_pattern() -> Option<&'static Regex> {
    static URL: OnceLock<Option<Regex>> = OnceLock::new();
    URL.get_or_init(|| Regex::new(r"URL: (https?://[^\s]+)").ok()).as_ref()
}

/// Every string leaf of `value`, newline separated.
fn text_of(value: &Value) -> String {
    fn collect(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
            Value::Object(map) => map.values().for_each(|v| collect(v, out)),
            _ => {}
        }
    }
    let mut parts = Vec::new();
    collect(value, &mut parts);
    parts.join("\n")
}

/// A service the unit reported publishing, if its output says so.
pub fn detect_deployed_service(unit_id: &str, output: &Value) -> Option<DeployedServiceRef> {
    let text = text_of(output);
    let lower = text.to_lowercase();
    if !lower.contains("deployed successfully") {
        return None;
    }
    let url = url_pattern()?.captures(&text)?.get(1)?.as_str().to_string();
    let kind = if lower.contains("streamlit") {
        ServiceKind::Streamlit
    } else if lower.contains("flask") {
        ServiceKind::Flask
    } else {
        ServiceKind::Gradio
    };
    Some(DeployedServiceRef {
        unit: unit_id.to_string(),
        url,
        kind,
    })
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// The outputs map of one run, reserved keys included.
struct RunState {
    outputs: Map<String, Value>,
    services: Vec<DeployedServiceRef>,
    skipped: HashSet<String>,
    failed: bool,
}

impl RunState {
    fn new(inputs: &ExternalInputs, error_memory: Map<String, Value>) -> Self {
        let mut outputs = Map::new();
        outputs.insert(FILES_CONTEXT_KEY.into(), inputs.to_context());
        outputs.insert(USER_FILES_INPUT.into(), json!(inputs.files));
        outputs.insert(ERROR_MEMORY_KEY.into(), Value::Object(error_memory));
        outputs.insert(DEPLOYED_SERVICES_KEY.into(), json!([]));
        Self {
            outputs,
            services: Vec::new(),
            skipped: HashSet::new(),
            failed: false,
        }
    }

    fn error_memory(&self) -> Map<String, Value> {
        self.outputs
            .get(ERROR_MEMORY_KEY)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    fn remember_failure(&mut self, signature: &str, error: &str, unit_id: &str) {
        let mut memory = self.error_memory();
        memory.insert(
            signature.to_string(),
            json!({
                "error": error,
                "agent": unit_id,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
        self.outputs.insert(ERROR_MEMORY_KEY.into(), Value::Object(memory));
    }

    fn publish(&mut self, service: DeployedServiceRef) {
        self.services.push(service);
        self.outputs
            .insert(DEPLOYED_SERVICES_KEY.into(), json!(self.services));
    }

    /// Upstream values for `unit`: declared inputs first, then edge
    /// predecessors not already listed. Units without an output yet are
    /// left out.
    fn upstream(&self, graph: &TaskGraph, unit: &TaskUnit) -> Vec<(String, Value)> {
        let mut seen = HashSet::new();
        unit.inputs
            .iter()
            .map(String::as_str)
            .chain(scheduler::predecessors(graph, &unit.id))
            .filter(|id| !is_reserved_key(id) && seen.insert(*id))
            .filter_map(|id| self.outputs.get(id).map(|v| (id.to_string(), v.clone())))
            .collect()
    }

    fn final_output(&self, graph: &TaskGraph) -> Value {
        let result = graph
            .last_unit()
            .and_then(|u| self.outputs.get(&u.id))
            .cloned()
            .unwrap_or_else(|| json!("No output"));
        if self.services.is_empty() {
            result
        } else {
            json!({ "result": result, "deployed_services": self.services })
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionOrchestrator
// ---------------------------------------------------------------------------

pub struct ExecutionOrchestrator {
    ctx: Arc<EngineContext>,
    invoker: UnitInvoker,
}

impl ExecutionOrchestrator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let invoker = UnitInvoker::new(ctx.clone());
        Self { ctx, invoker }
    }

    /// Validate `graph` and run it to a terminal record.
    pub async fn execute(&self, graph: &TaskGraph, inputs: ExternalInputs) -> Result<ExecutionRecord> {
        scheduler::validate(graph).into_result()?;
        let levels = scheduler::levels(graph)?;

        let mut record = ExecutionRecord::start(&graph.id);
        self.ctx.executions.insert(record.clone()).await?;
        info!(
            execution_id = %record.id,
            graph_id = %graph.id,
            units = graph.units.len(),
            levels = levels.len(),
            "execution started"
        );

        let mut state = RunState::new(&inputs, self.seed_error_memory().await);
        let policy = self.ctx.config.engine.failure_policy;
        let limit = match self.ctx.config.engine.max_concurrent_units {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        for (idx, level) in levels.iter().enumerate() {
            let runnable: Vec<&TaskUnit> = level
                .iter()
                .filter(|id| !state.skipped.contains(*id))
                .filter_map(|id| graph.unit(id))
                .collect();
            info!(execution_id = %record.id, level = idx, units = runnable.len(), "running level");

            let guidance = error_guidance(&state.error_memory());
            let jobs = runnable.iter().map(|unit| {
                let input = UnitInput {
                    files: inputs.files.clone(),
                    task: unit.task.clone(),
                    error_guidance: guidance.clone(),
                    upstream: state.upstream(graph, unit),
                };
                let limit = limit.clone();
                async move {
                    let _permit = match limit {
                        Some(ref sem) => sem.acquire().await.ok(),
                        None => None,
                    };
                    let outcome = self.invoker.invoke(unit, &input, &graph.user_id).await;
                    (*unit, outcome)
                }
            });
            let outcomes = join_all(jobs).await;

            for (unit, outcome) in outcomes {
                self.settle(graph, unit, outcome, policy, &mut state).await;
            }

            let progress = ExecutionUpdate::progress(ExecutionStatus::Running, state.outputs.clone());
            if let Err(e) = self.ctx.executions.update(&record.id, progress).await {
                warn!(execution_id = %record.id, level = idx, error = %e, "failed to persist progress");
            }
        }

        let status = if state.failed {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        let update = ExecutionUpdate {
            status: Some(status),
            outputs: Some(state.outputs.clone()),
            final_output: Some(state.final_output(graph)),
            ended_at: Some(Utc::now()),
        };
        self.ctx.executions.update(&record.id, update.clone()).await?;
        update.apply(&mut record);

        self.ctx.metrics.record_execution(&status.to_string());
        info!(
            execution_id = %record.id,
            graph_id = %graph.id,
            %status,
            services = state.services.len(),
            "execution finished"
        );
        Ok(record)
    }

    /// Record one unit's terminal outcome in the run state.
    async fn settle(
        &self,
        graph: &TaskGraph,
        unit: &TaskUnit,
        outcome: UnitOutcome,
        policy: FailurePolicy,
        state: &mut RunState,
    ) {
        match outcome {
            UnitOutcome::Succeeded { output, attempts, .. } => {
                if let Some(service) = detect_deployed_service(&unit.id, &output) {
                    info!(unit_id = %unit.id, url = %service.url, kind = %service.kind, "unit published a service");
                    state.publish(service);
                }
                debug!(unit_id = %unit.id, attempts, "unit output stored");
                state.outputs.insert(unit.id.clone(), output);
            }
            UnitOutcome::Failed {
                error,
                history,
                signature,
            } => {
                error!(unit_id = %unit.id, %signature, "unit failed");
                state.failed = true;
                state
                    .outputs
                    .insert(unit.id.clone(), json!({ "error": error, "status": "failed" }));
                state.remember_failure(&signature, &error, &unit.id);

                if self.ctx.config.engine.persist_failure_signatures {
                    let last_error = history.last().map(|r| r.error.as_str()).unwrap_or(error.as_str());
                    if let Err(e) = self.ctx.failure_memory.store(last_error, NO_SOLUTION, false).await {
                        warn!(unit_id = %unit.id, error = %e, "failed to persist failure signature");
                    }
                }

                if policy == FailurePolicy::SkipDependents {
                    let mut dependents: Vec<String> = scheduler::transitive_dependents(graph, &unit.id)
                        .into_iter()
                        .filter(|id| !state.skipped.contains(id))
                        .collect();
                    dependents.sort();
                    for id in dependents {
                        warn!(unit_id = %id, failed = %unit.id, "skipping dependent of failed unit");
                        state.outputs.insert(
                            id.clone(),
                            json!({
                                "status": "skipped",
                                "reason": format!("dependency {} failed", unit.id),
                            }),
                        );
                        state.skipped.insert(id);
                    }
                }
            }
        }
    }

    async fn seed_error_memory(&self) -> Map<String, Value> {
        let mut memory = Map::new();
        match self.ctx.failure_memory.recent(SEEDED_SIGNATURES).await {
            Ok(records) => {
                for rec in records {
                    memory.insert(
                        rec.signature.clone(),
                        json!({
                            "error": rec.error_example,
                            "solution": rec.solution,
                            "success_count": rec.success_count,
                            "timestamp": rec.last_used.to_rfc3339(),
                        }),
                    );
                }
            }
            Err(e) => warn!(error = %e, "could not load failure memory"),
        }
        memory
    }

    /// Mid-run cancellation is not supported; always `false`.
    pub async fn cancel(&self, execution_id: &str) -> bool {
        warn!(%execution_id, "cancellation requested but not supported");
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use wf_core::types::{Edge, FileRef};

    #[test]
    fn detects_services_in_text_and_objects() {
        let text = json!("✅ Streamlit app deployed successfully!\n\nURL: http://localhost:8502\nService ID: st_1");
        let svc = detect_deployed_service("a3", &text).unwrap();
        assert_eq!(svc.url, "http://localhost:8502");
        assert_eq!(svc.kind, ServiceKind::Streamlit);
        assert_eq!(svc.unit, "a3");

        let obj = json!({"message": "Deployed successfully. URL: http://localhost:8510", "ok": true});
        assert_eq!(detect_deployed_service("a", &obj).unwrap().kind, ServiceKind::Gradio);

        let flask = json!("Flask app deployed successfully! URL: http://localhost:8520");
        assert_eq!(detect_deployed_service("a", &flask).unwrap().kind, ServiceKind::Flask);

        assert!(detect_deployed_service("a", &json!("URL: http://x")).is_none());
        assert!(detect_deployed_service("a", &json!("deployed successfully")).is_none());
    }

    #[test]
    fn upstream_merges_inputs_and_edges() {
        let graph = TaskGraph::new(
            "u",
            "g",
            vec![
                TaskUnit::new("a", "t"),
                TaskUnit::new("b", "t"),
                TaskUnit::new("c", "t").with_inputs(["b", USER_FILES_INPUT, "ghost"]),
            ],
            vec![Edge::new("a", "c", "x"), Edge::new("b", "c", "y")],
        );
        let inputs = ExternalInputs::with_files(vec![FileRef::new("f.csv", "/u/f.csv")]);
        let mut state = RunState::new(&inputs, Map::new());
        state.outputs.insert("a".into(), json!("A"));
        state.outputs.insert("b".into(), json!({"n": 1}));

        let up = state.upstream(&graph, graph.unit("c").unwrap());
        assert_eq!(up, vec![("b".to_string(), json!({"n": 1})), ("a".to_string(), json!("A"))]);
    }

    #[test]
    fn final_output_wraps_services() {
        let graph = TaskGraph::new("u", "g", vec![TaskUnit::new("a", "t")], vec![]);
        let mut state = RunState::new(&ExternalInputs::default(), Map::new());
        assert_eq!(state.final_output(&graph), json!("No output"));

        state.outputs.insert("a".into(), json!("done"));
        state.publish(DeployedServiceRef {
            unit: "a".into(),
            url: "http://localhost:8501".into(),
            kind: ServiceKind::Streamlit,
        });
        let out = state.final_output(&graph);
        assert_eq!(out["result"], "done");
        assert_eq!(out["deployed_services"][0]["type"], "streamlit");
        assert_eq!(state.outputs[DEPLOYED_SERVICES_KEY][0]["agent"], "a");
    }
}
