//! Handles to integrations outside the process: a rooted file store, Slack,
//! web search and a structured-record store.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use wf_core::types::CapabilityCategory;
use wf_harness::knowledge::KnowledgeSearch;
use wf_harness::provider::Tool;

use crate::prompts::format_search;

use super::{str_arg, Capability, CapabilityError};

fn unknown(capability: &str, tool: &str) -> CapabilityError {
    CapabilityError::UnknownTool {
        capability: capability.to_string(),
        tool: tool.to_string(),
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// Read, write and list files below a fixed root.
#[derive(Debug, Clone)]
pub struct FileStoreCapability {
    root: PathBuf,
}

impl FileStoreCapability {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a caller path onto the root. Absolute paths must already lie
    /// inside it; `..` components are refused outright.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, CapabilityError> {
        let requested = Path::new(path);
        if requested.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(CapabilityError::InvalidArguments {
                tool: "file_store".to_string(),
                reason: format!("path escapes the file store root: {path}"),
            });
        }
        if requested.is_absolute() {
            if requested.starts_with(&self.root) {
                return Ok(requested.to_path_buf());
            }
            return Err(CapabilityError::InvalidArguments {
                tool: "file_store".to_string(),
                reason: format!("path escapes the file store root: {path}"),
            });
        }
        Ok(self.root.join(requested))
    }
}

#[async_trait]
impl Capability for FileStoreCapability {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn category(&self) -> CapabilityCategory {
        CapabilityCategory::ExternalApi
    }

    fn tools(&self) -> Vec<Tool> {
        let path_only = json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        });
        vec![
            Tool::new("read_file", "Read a text file", path_only),
            Tool::new(
                "write_file",
                "Write text to a file, creating parent directories",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "content": {"type": "string"}
                    },
                    "required": ["path", "content"]
                }),
            ),
            Tool::new(
                "list_files",
                "List the entries of a directory",
                json!({
                    "type": "object",
                    "properties": {"path": {"type": "string", "default": "."}}
                }),
            ),
        ]
    }

    async fn call(&self, tool: &str, args: &Value) -> Result<String, CapabilityError> {
        match tool {
            "read_file" => {
                let path = self.resolve(str_arg(args, tool, "path")?)?;
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| CapabilityError::Backend(format!("reading file: {e}")))
            }
            "write_file" => {
                let raw = str_arg(args, tool, "path")?;
                let content = str_arg(args, tool, "content")?;
                let path = self.resolve(raw)?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, content).await?;
                Ok(format!("Successfully wrote to {}", path.display()))
            }
            "list_files" => {
                let raw = args.get("path").and_then(Value::as_str).unwrap_or(".");
                let dir = self.resolve(raw)?;
                let mut entries = tokio::fs::read_dir(&dir).await?;
                let mut names = Vec::new();
                while let Some(entry) = entries.next_entry().await? {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                names.sort();
                let listing: Vec<String> = names.iter().map(|n| format!("- {n}")).collect();
                Ok(format!("Files:\n{}", listing.join("\n")))
            }
            other => Err(unknown(self.name(), other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Slack
// ---------------------------------------------------------------------------

const SLACK_API: &str = "https://slack.com/api";

/// `send_message` through the Slack Web API.
pub struct SlackCapability {
    client: reqwest::Client,
    token: Option<String>,
    api_base: String,
}

impl SlackCapability {
    pub fn new(token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            api_base: SLACK_API.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

#[async_trait]
impl Capability for SlackCapability {
    fn name(&self) -> &str {
        "slack"
    }

    fn category(&self) -> CapabilityCategory {
        CapabilityCategory::ExternalApi
    }

    fn tools(&self) -> Vec<Tool> {
        vec![Tool::new(
            "send_message",
            "Post a message to a Slack channel",
            json!({
                "type": "object",
                "properties": {
                    "channel": {"type": "string"},
                    "text": {"type": "string"}
                },
                "required": ["channel", "text"]
            }),
        )]
    }

    fn available(&self) -> bool {
        self.token.is_some()
    }

    async fn call(&self, tool: &str, args: &Value) -> Result<String, CapabilityError> {
        if tool != "send_message" {
            return Err(unknown(self.name(), tool));
        }
        let Some(ref token) = self.token else {
            return Err(CapabilityError::Unavailable("slack".to_string()));
        };
        let channel = str_arg(args, tool, "channel")?;
        let text = str_arg(args, tool, "text")?;

        let resp = self
            .client
            .post(format!("{}/chat.postMessage", self.api_base))
            .bearer_auth(token)
            .json(&json!({"channel": channel, "text": text}))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| CapabilityError::Backend(format!("slack request failed: {e}")))?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| CapabilityError::Backend(format!("slack response unreadable: {e}")))?;

        if body.get("ok").and_then(Value::as_bool) == Some(true) {
            debug!(channel, "slack message sent");
            Ok(format!("Message sent successfully to {channel}"))
        } else {
            let reason = body.get("error").and_then(Value::as_str).unwrap_or("unknown error");
            warn!(channel, reason, "slack rejected message");
            Err(CapabilityError::Backend(format!("slack error: {reason}")))
        }
    }
}

// ---------------------------------------------------------------------------
// Web search
// ---------------------------------------------------------------------------

pub struct WebSearchCapability {
    search: Option<Arc<dyn KnowledgeSearch>>,
    max_results: usize,
}

impl WebSearchCapability {
    pub fn new(search: Option<Arc<dyn KnowledgeSearch>>) -> Self {
        Self { search, max_results: 5 }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }
}

#[async_trait]
impl Capability for WebSearchCapability {
    fn name(&self) -> &str {
        "web_search"
    }

    fn category(&self) -> CapabilityCategory {
        CapabilityCategory::ExternalApi
    }

    fn tools(&self) -> Vec<Tool> {
        vec![Tool::new(
            "web_search",
            "Search the web and return a direct answer plus top results",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "max_results": {"type": "integer", "minimum": 1}
                },
                "required": ["query"]
            }),
        )]
    }

    fn available(&self) -> bool {
        self.search.is_some()
    }

    async fn call(&self, tool: &str, args: &Value) -> Result<String, CapabilityError> {
        if tool != "web_search" {
            return Err(unknown(self.name(), tool));
        }
        let Some(ref search) = self.search else {
            return Err(CapabilityError::Unavailable("web_search".to_string()));
        };
        let query = str_arg(args, tool, "query")?;
        let max = args
            .get("max_results")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(self.max_results);
        let results = search
            .search(query, max)
            .await
            .map_err(|e| CapabilityError::Backend(e.to_string()))?;
        if results.is_empty() {
            return Ok(format!("No results found for: {query}"));
        }
        Ok(format_search(&results))
    }
}

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

/// Structured-record store handle. No client is bundled, so every operation
/// reports that; `available` reflects whether a connection is configured.
#[derive(Debug, Clone)]
pub struct RecordStoreCapability {
    configured: bool,
}

impl RecordStoreCapability {
    pub fn new(configured: bool) -> Self {
        Self { configured }
    }
}

#[async_trait]
impl Capability for RecordStoreCapability {
    fn name(&self) -> &str {
        "mongodb"
    }

    fn category(&self) -> CapabilityCategory {
        CapabilityCategory::ExternalApi
    }

    fn tools(&self) -> Vec<Tool> {
        vec![
            Tool::new(
                "find_records",
                "Query records from a collection",
                json!({
                    "type": "object",
                    "properties": {
                        "collection": {"type": "string"},
                        "filter": {"type": "object"}
                    },
                    "required": ["collection"]
                }),
            ),
            Tool::new(
                "insert_record",
                "Insert one record into a collection",
                json!({
                    "type": "object",
                    "properties": {
                        "collection": {"type": "string"},
                        "record": {"type": "object"}
                    },
                    "required": ["collection", "record"]
                }),
            ),
        ]
    }

    fn available(&self) -> bool {
        self.configured
    }

    async fn call(&self, tool: &str, _args: &Value) -> Result<String, CapabilityError> {
        match tool {
            "find_records" | "insert_record" if !self.configured => {
                Err(CapabilityError::Unavailable("mongodb".to_string()))
            }
            "find_records" | "insert_record" => {
                Err(CapabilityError::Backend("no record store client installed".to_string()))
            }
            other => Err(unknown(self.name(), other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
