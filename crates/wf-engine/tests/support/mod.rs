#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use wf_core::config::{Config, FailurePolicy};
use wf_core::store::{ExecutionStore, ExecutionUpdate, InMemoryExecutionStore, StoreError};
use wf_core::types::{ExecutionRecord, TaskUnit};
use wf_engine::capability::Toolbox;
use wf_engine::runner::{RunnerError, UnitRunner};
use wf_engine::EngineContext;
use wf_harness::provider::ProviderError;

/// How a scripted unit answers.
pub enum Script {
    /// Same answer on every call.
    Always(Result<String, String>),
    /// One answer per call, in order; the last one repeats.
    Sequence(VecDeque<String>),
}

/// One runner call.
#[derive(Debug, Clone)]
pub struct Call {
    pub unit: String,
    pub instructions: String,
    pub input: String,
}

/// Runner answering per unit. A unit is identified by the first line of its
/// instructions, `unit:<id>`.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, unit: &str, script: Script) -> Self {
        self.scripts.lock().unwrap().insert(unit.to_string(), script);
        self
    }

    pub fn always_ok(self, unit: &str, text: &str) -> Self {
        self.script(unit, Script::Always(Ok(text.to_string())))
    }

    pub fn always_err(self, unit: &str, error: &str) -> Self {
        self.script(unit, Script::Always(Err(error.to_string())))
    }

    pub fn sequence(self, unit: &str, answers: &[&str]) -> Self {
        self.script(unit, Script::Sequence(answers.iter().map(|s| s.to_string()).collect()))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, unit: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.unit == unit).collect()
    }

    fn answer(&self, instructions: &str, input: &str) -> Result<String, RunnerError> {
        let unit = instructions
            .lines()
            .next()
            .and_then(|l| l.strip_prefix("unit:"))
            .unwrap_or_default()
            .to_string();
        self.calls.lock().unwrap().push(Call {
            unit: unit.clone(),
            instructions: instructions.to_string(),
            input: input.to_string(),
        });

        let mut scripts = self.scripts.lock().unwrap();
        let reply = match scripts.get_mut(&unit) {
            Some(Script::Always(answer)) => answer.clone(),
            Some(Script::Sequence(queue)) if queue.len() > 1 => Ok(queue.pop_front().unwrap()),
            Some(Script::Sequence(queue)) => Ok(queue.front().cloned().unwrap_or_default()),
            None => Err(format!("no script for unit '{unit}'")),
        };
        reply.map_err(|e| RunnerError::Provider(ProviderError::Other(e)))
    }
}

#[async_trait]
impl UnitRunner for ScriptedRunner {
    async fn run_with_tools(&self, instructions: &str, input: &str, _tools: &Toolbox) -> Result<String, RunnerError> {
        self.answer(instructions, input)
    }

    async fn run_direct(&self, instructions: &str, input: &str) -> Result<String, RunnerError> {
        self.answer(instructions, input)
    }
}

/// Execution store counting updates.
#[derive(Default)]
pub struct CountingExecutionStore {
    inner: InMemoryExecutionStore,
    pub updates: AtomicUsize,
}

#[async_trait]
impl ExecutionStore for CountingExecutionStore {
    async fn insert(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        self.inner.insert(record).await
    }

    async fn update(&self, execution_id: &str, update: ExecutionUpdate) -> Result<(), StoreError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update(execution_id, update).await
    }

    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        self.inner.get(execution_id).await
    }

    async fn list_for_graph(&self, graph_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.inner.list_for_graph(graph_id).await
    }
}

pub fn config(upload_dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.engine.retry_pause_ms = 0;
    cfg.deploy.upload_dir = upload_dir.to_string_lossy().into_owned();
    cfg.deploy.port_start = 47700;
    cfg.deploy.port_end = 47709;
    cfg
}

pub fn context(upload_dir: &Path, runner: Arc<ScriptedRunner>) -> EngineContext {
    EngineContext::new(config(upload_dir), runner).with_search(None)
}

pub fn context_with_policy(upload_dir: &Path, runner: Arc<ScriptedRunner>, policy: FailurePolicy) -> EngineContext {
    let mut cfg = config(upload_dir);
    cfg.engine.failure_policy = policy;
    EngineContext::new(cfg, runner).with_search(None)
}

/// A unit the scripted runner recognises.
pub fn unit(id: &str, task: &str) -> TaskUnit {
    TaskUnit::new(id, task).with_instructions(format!("unit:{id}\nDo the work."))
}
