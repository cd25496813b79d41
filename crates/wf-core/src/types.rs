use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Reserved context keys
// ---------------------------------------------------------------------------

/// Context key holding the caller-supplied external inputs.
pub const FILES_CONTEXT_KEY: &str = "files_context";
/// Context key holding known failure signatures for the run.
pub const ERROR_MEMORY_KEY: &str = "error_memory";
/// Context key holding services published by units during the run.
pub const DEPLOYED_SERVICES_KEY: &str = "deployed_services";
/// Sentinel input reference meaning "the external inputs".
pub const USER_FILES_INPUT: &str = "user_files";

/// Keys that are never forwarded to a unit as `input_from_*`.
pub fn is_reserved_key(key: &str) -> bool {
    matches!(
        key,
        FILES_CONTEXT_KEY | ERROR_MEMORY_KEY | DEPLOYED_SERVICES_KEY | USER_FILES_INPUT | "user_data"
    )
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

fn short_hex(len: usize) -> String {
    let mut hex = Uuid::new_v4().simple().to_string();
    hex.truncate(len);
    hex
}

/// `wf_` followed by 12 hex characters.
pub fn new_graph_id() -> String {
    format!("wf_{}", short_hex(12))
}

/// `exec_` followed by 12 hex characters.
pub fn new_execution_id() -> String {
    format!("exec_{}", short_hex(12))
}

/// Kind prefix followed by 8 hex characters, e.g. `st_1a2b3c4d`.
pub fn new_service_id(kind: ServiceKind) -> String {
    format!("{}_{}", kind.id_prefix(), short_hex(8))
}

// ---------------------------------------------------------------------------
// GraphStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphStatus {
    #[default]
    Draft,
    Approved,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GraphStatus::Draft => "draft",
            GraphStatus::Approved => "approved",
            GraphStatus::Running => "running",
            GraphStatus::Completed => "completed",
            GraphStatus::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// CapabilityCategory / CapabilityRequirement
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityCategory {
    #[default]
    #[serde(alias = "code", alias = "code_executor")]
    CodeExecution,
    #[serde(alias = "vector_db", alias = "vector")]
    VectorIndex,
    #[serde(alias = "mcp", alias = "external")]
    ExternalApi,
    #[serde(alias = "deploy", alias = "service")]
    ServiceDeploy,
}

impl fmt::Display for CapabilityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CapabilityCategory::CodeExecution => "code_execution",
            CapabilityCategory::VectorIndex => "vector_index",
            CapabilityCategory::ExternalApi => "external_api",
            CapabilityCategory::ServiceDeploy => "service_deploy",
        };
        write!(f, "{}", label)
    }
}

/// A tool a unit declares it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequirement {
    pub name: String,
    #[serde(rename = "type", default)]
    pub category: CapabilityCategory,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl CapabilityRequirement {
    pub fn new(name: impl Into<String>, category: CapabilityCategory) -> Self {
        Self {
            name: name.into(),
            category,
            purpose: String::new(),
            config: Map::new(),
        }
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = purpose.into();
        self
    }
}

// ---------------------------------------------------------------------------
// TaskUnit
// ---------------------------------------------------------------------------

fn default_unit_type() -> String {
    "generic".into()
}

/// One node of a task graph.
///
/// Field names follow the planning layer's JSON shape (`type`,
/// `detailed_prompt`, `required_tools`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUnit {
    pub id: String,
    #[serde(rename = "type", default = "default_unit_type")]
    pub unit_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub task: String,
    #[serde(rename = "detailed_prompt", alias = "instructions", default)]
    pub instructions: String,
    #[serde(rename = "required_tools", alias = "requirements", default)]
    pub requirements: Vec<CapabilityRequirement>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

impl TaskUnit {
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            unit_type: default_unit_type(),
            task: task.into(),
            instructions: String::new(),
            requirements: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            output_format: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_requirement(mut self, requirement: CapabilityRequirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Name for log lines; falls back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(rename = "from", alias = "from_agent")]
    pub from: String,
    #[serde(rename = "to", alias = "to_agent")]
    pub to: String,
    #[serde(default)]
    pub data_key: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, data_key: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            data_key: data_key.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskGraph
// ---------------------------------------------------------------------------

/// A planned workflow: units plus the edges between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "agents", alias = "units")]
    pub units: Vec<TaskUnit>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub status: GraphStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl TaskGraph {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, units: Vec<TaskUnit>, edges: Vec<Edge>) -> Self {
        Self {
            id: new_graph_id(),
            user_id: user_id.into(),
            name: name.into(),
            description: String::new(),
            units,
            edges,
            status: GraphStatus::Draft,
            created_at: Utc::now(),
        }
    }

    pub fn unit(&self, id: &str) -> Option<&TaskUnit> {
        self.units.iter().find(|u| u.id == id)
    }

    /// The last declared unit; its output is the run's final result.
    pub fn last_unit(&self) -> Option<&TaskUnit> {
        self.units.last()
    }
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

/// One run of a graph: status, timestamps and the per-unit output map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    #[serde(rename = "workflow_id", alias = "graph_id")]
    pub graph_id: String,
    pub status: ExecutionStatus,
    #[serde(rename = "start_time")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "end_time", default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(rename = "agent_outputs", default)]
    pub outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<Value>,
}

impl ExecutionRecord {
    /// A fresh running record for `graph_id`.
    pub fn start(graph_id: impl Into<String>) -> Self {
        Self {
            id: new_execution_id(),
            graph_id: graph_id.into(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            outputs: Map::new(),
            final_output: None,
        }
    }

    pub fn output(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key)
    }
}

// ---------------------------------------------------------------------------
// External inputs
// ---------------------------------------------------------------------------

/// Descriptor of one externally supplied file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    #[serde(default)]
    pub file_id: String,
    pub filename: String,
    #[serde(rename = "type", default)]
    pub file_type: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FileRef {
    pub fn new(filename: impl Into<String>, path: impl Into<String>) -> Self {
        let filename = filename.into();
        let file_type = filename
            .rsplit_once('.')
            .map(|(_, ext)| format!(".{ext}"))
            .unwrap_or_default();
        Self {
            file_id: String::new(),
            filename,
            file_type,
            path: path.into(),
            full_text: None,
            extra: Map::new(),
        }
    }
}

/// Caller-supplied inputs merged into the context before level 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalInputs {
    #[serde(default)]
    pub files: Vec<FileRef>,
}

impl ExternalInputs {
    pub fn with_files(files: Vec<FileRef>) -> Self {
        Self { files }
    }

    /// Shape stored under [`FILES_CONTEXT_KEY`].
    pub fn to_context(&self) -> Value {
        serde_json::json!({
            "files": self.files,
            "total_files": self.files.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// ServiceKind
// ---------------------------------------------------------------------------

/// Supported app frameworks for deployed services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Streamlit,
    Gradio,
    Flask,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Streamlit => "streamlit",
            ServiceKind::Gradio => "gradio",
            ServiceKind::Flask => "flask",
        }
    }

    pub fn id_prefix(&self) -> &'static str {
        match self {
            ServiceKind::Streamlit => "st",
            ServiceKind::Gradio => "gr",
            ServiceKind::Flask => "fl",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown service kind: {0}")]
pub struct UnknownServiceKind(pub String);

impl FromStr for ServiceKind {
    type Err = UnknownServiceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "streamlit" => Ok(ServiceKind::Streamlit),
            "gradio" => Ok(ServiceKind::Gradio),
            "flask" => Ok(ServiceKind::Flask),
            other => Err(UnknownServiceKind(other.to_string())),
        }
    }
}

/// Entry of the reserved deployed-services list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedServiceRef {
    #[serde(rename = "agent")]
    pub unit: String,
    pub url: String,
    #[serde(rename = "type")]
    pub kind: ServiceKind,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_expected_shape() {
        let exec = new_execution_id();
        assert!(exec.starts_with("exec_"));
        assert_eq!(exec.len(), "exec_".len() + 12);

        let svc = new_service_id(ServiceKind::Gradio);
        assert!(svc.starts_with("gr_"));
        assert_eq!(svc.len(), 3 + 8);
    }

    #[test]
    fn reserved_keys() {
        assert!(is_reserved_key(FILES_CONTEXT_KEY));
        assert!(is_reserved_key(ERROR_MEMORY_KEY));
        assert!(is_reserved_key(USER_FILES_INPUT));
        assert!(!is_reserved_key("agent_1"));
    }

    #[test]
    fn service_kind_parse() {
        assert_eq!("Streamlit".parse::<ServiceKind>().unwrap(), ServiceKind::Streamlit);
        assert_eq!(" flask ".parse::<ServiceKind>().unwrap(), ServiceKind::Flask);
        assert!("django".parse::<ServiceKind>().is_err());
    }

    #[test]
    fn file_ref_infers_type_from_extension() {
        let f = FileRef::new("sales.xlsx", "/data/uploads/sales.xlsx");
        assert_eq!(f.file_type, ".xlsx");
    }

    #[test]
    fn execution_status_terminal() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
    }
}
