//! Provisioned capabilities and the tools they expose to a unit runner.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use wf_core::types::CapabilityCategory;
use wf_harness::provider::Tool;

pub mod code;
pub mod deploy;
pub mod external;
pub mod reliable;
pub mod vector;

pub use code::CodeCapability;
pub use deploy::ServiceDeployCapability;
pub use external::{FileStoreCapability, RecordStoreCapability, SlackCapability, WebSearchCapability};
pub use vector::{sanitize_index_name, InMemoryVectorBackend, VectorBackend, VectorIndexCapability};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("unknown tool '{tool}' for capability {capability}")]
    UnknownTool { capability: String, tool: String },

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("{0} is not available: missing configuration")]
    Unavailable(String),

    #[error("capability I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Backend(String),
}

impl CapabilityError {
    pub(crate) fn missing_arg(tool: &str, arg: &str) -> Self {
        CapabilityError::InvalidArguments {
            tool: tool.to_string(),
            reason: format!("missing '{arg}'"),
        }
    }
}

/// Required string argument from a tool call.
pub(crate) fn str_arg<'a>(args: &'a Value, tool: &str, name: &str) -> Result<&'a str, CapabilityError> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| CapabilityError::missing_arg(tool, name))
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// A concrete resource a unit can call through tools.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn category(&self) -> CapabilityCategory;

    /// Tool definitions offered to the model.
    fn tools(&self) -> Vec<Tool>;

    /// Run one tool call. Errors are reported back to the model as text.
    async fn call(&self, tool: &str, args: &Value) -> Result<String, CapabilityError>;

    /// Whether required configuration (credentials, endpoints) is present.
    fn available(&self) -> bool {
        true
    }

    /// Release resources owned by this capability.
    async fn teardown(&self) -> Result<(), CapabilityError> {
        Ok(())
    }
}

/// A capability bound to one invocation attempt.
#[derive(Clone)]
pub struct ProvisionedCapability {
    /// Name the unit asked for.
    pub requested: String,
    pub category: CapabilityCategory,
    pub handle: Arc<dyn Capability>,
    /// Torn down on release; shared resources leave this false.
    pub needs_cleanup: bool,
}

impl ProvisionedCapability {
    pub fn new(requested: impl Into<String>, handle: Arc<dyn Capability>) -> Self {
        Self {
            requested: requested.into(),
            category: handle.category(),
            handle,
            needs_cleanup: false,
        }
    }

    pub fn with_cleanup(mut self) -> Self {
        self.needs_cleanup = true;
        self
    }

    pub fn available(&self) -> bool {
        self.handle.available()
    }
}

impl std::fmt::Debug for ProvisionedCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionedCapability")
            .field("requested", &self.requested)
            .field("capability", &self.handle.name())
            .field("category", &self.category)
            .field("needs_cleanup", &self.needs_cleanup)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Toolbox
// ---------------------------------------------------------------------------

/// The tools of every bound capability, routed by tool name. When two
/// capabilities expose the same tool the first one bound wins.
#[derive(Debug, Clone, Default)]
pub struct Toolbox {
    bound: Vec<ProvisionedCapability>,
}

impl Toolbox {
    pub fn new(bound: Vec<ProvisionedCapability>) -> Self {
        Self { bound }
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }

    pub fn capabilities(&self) -> &[ProvisionedCapability] {
        &self.bound
    }

    pub fn definitions(&self) -> Vec<Tool> {
        let mut seen = std::collections::HashSet::new();
        self.bound
            .iter()
            .flat_map(|c| c.handle.tools())
            .filter(|t| seen.insert(t.name.clone()))
            .collect()
    }

    /// Execute `tool`; failures come back as `Error: ...` text for the model.
    pub async fn call(&self, tool: &str, args: &Value) -> String {
        let owner = self
            .bound
            .iter()
            .find(|c| c.handle.tools().iter().any(|t| t.name == tool));
        let Some(owner) = owner else {
            return format!("Error: unknown tool '{tool}'");
        };
        match owner.handle.call(tool, args).await {
            Ok(text) => text,
            Err(e) => format!("Error: {e}"),
        }
    }

    pub fn into_inner(self) -> Vec<ProvisionedCapability> {
        self.bound
    }
}
