//! Vector index capability and the backend it stores documents in.
//!
//! The in-memory backend ranks by term overlap between query and document.
//! It has no embedding model; a remote backend can implement
//! [`VectorBackend`] when real similarity search is needed.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use wf_core::types::CapabilityCategory;
use wf_harness::provider::Tool;

use super::{str_arg, Capability, CapabilityError};

const MAX_INDEX_NAME: usize = 63;
const SUFFIX_LEN: usize = 8;

/// Index name restricted to `[a-zA-Z0-9._-]`, at most 63 characters,
/// alphanumeric at both ends, with a random suffix so two units asking for
/// the same name never share an index.
pub fn sanitize_index_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();

    let budget = MAX_INDEX_NAME - SUFFIX_LEN - 1;
    let mut base: String = cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .chars()
        .take(budget)
        .collect();
    while base.ends_with(|c: char| !c.is_ascii_alphanumeric()) {
        base.pop();
    }
    if base.is_empty() {
        base.push_str("index");
    }

    let mut suffix = Uuid::new_v4().simple().to_string();
    suffix.truncate(SUFFIX_LEN);
    format!("{base}_{suffix}")
}

/// Overlapping character windows of `size`, stepping by `size - overlap`.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() || size == 0 {
        return Vec::new();
    }
    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(chars.len());
        let chunk: String = chars[start..end].iter().collect();
        if !chunk.trim().is_empty() {
            chunks.push(chunk);
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredDocument {
    #[serde(flatten)]
    pub document: Document,
    pub score: f64,
}

#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Create `index` if it does not exist.
    async fn ensure_index(&self, index: &str) -> Result<(), CapabilityError>;

    /// Append documents, returning the index's new size.
    async fn add(&self, index: &str, docs: Vec<Document>) -> Result<usize, CapabilityError>;

    async fn query(&self, index: &str, query: &str, limit: usize) -> Result<Vec<ScoredDocument>, CapabilityError>;

    /// Returns `false` when the index did not exist.
    async fn delete_index(&self, index: &str) -> Result<bool, CapabilityError>;

    async fn index_exists(&self, index: &str) -> bool;
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
        .collect()
}

#[derive(Debug, Default)]
pub struct InMemoryVectorBackend {
    indexes: DashMap<String, Vec<Document>>,
}

impl InMemoryVectorBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }
}

#[async_trait]
impl VectorBackend for InMemoryVectorBackend {
    async fn ensure_index(&self, index: &str) -> Result<(), CapabilityError> {
        self.indexes.entry(index.to_string()).or_default();
        Ok(())
    }

    async fn add(&self, index: &str, docs: Vec<Document>) -> Result<usize, CapabilityError> {
        let mut entry = self
            .indexes
            .get_mut(index)
            .ok_or_else(|| CapabilityError::Backend(format!("index not found: {index}")))?;
        entry.extend(docs);
        Ok(entry.len())
    }

    async fn query(&self, index: &str, query: &str, limit: usize) -> Result<Vec<ScoredDocument>, CapabilityError> {
        let docs = self
            .indexes
            .get(index)
            .ok_or_else(|| CapabilityError::Backend(format!("index not found: {index}")))?;
        let wanted = terms(query);
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<ScoredDocument> = docs
            .iter()
            .filter_map(|doc| {
                let hits = terms(&doc.text).intersection(&wanted).count();
                (hits > 0).then(|| ScoredDocument {
                    document: doc.clone(),
                    score: hits as f64 / wanted.len() as f64,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn delete_index(&self, index: &str) -> Result<bool, CapabilityError> {
        Ok(self.indexes.remove(index).is_some())
    }

    async fn index_exists(&self, index: &str) -> bool {
        self.indexes.contains_key(index)
    }
}

// ---------------------------------------------------------------------------
// VectorIndexCapability
// ---------------------------------------------------------------------------

pub const ADD_DOCUMENTS: &str = "add_documents";
pub const SEARCH: &str = "search";

/// A freshly created index owned by one invocation attempt.
pub struct VectorIndexCapability {
    index: String,
    backend: Arc<dyn VectorBackend>,
    max_results: usize,
}

impl VectorIndexCapability {
    /// Create a uniquely named index derived from `requested`.
    pub async fn create(
        requested: &str,
        backend: Arc<dyn VectorBackend>,
        max_results: usize,
    ) -> Result<Self, CapabilityError> {
        let index = sanitize_index_name(requested);
        backend.ensure_index(&index).await?;
        info!(%index, requested, "vector index created");
        Ok(Self {
            index,
            backend,
            max_results,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    fn parse_documents(args: &Value) -> Result<Vec<Document>, CapabilityError> {
        let items = args
            .get("documents")
            .and_then(Value::as_array)
            .ok_or_else(|| CapabilityError::missing_arg(ADD_DOCUMENTS, "documents"))?;
        items
            .iter()
            .map(|item| match item {
                Value::String(text) => Ok(Document::new(text.clone())),
                Value::Object(obj) => {
                    let text = obj.get("text").and_then(Value::as_str).ok_or_else(|| {
                        CapabilityError::InvalidArguments {
                            tool: ADD_DOCUMENTS.to_string(),
                            reason: "document object without 'text'".to_string(),
                        }
                    })?;
                    let metadata = obj
                        .get("metadata")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    Ok(Document::new(text).with_metadata(metadata))
                }
                _ => Err(CapabilityError::InvalidArguments {
                    tool: ADD_DOCUMENTS.to_string(),
                    reason: "documents must be strings or objects".to_string(),
                }),
            })
            .collect()
    }
}

#[async_trait]
impl Capability for VectorIndexCapability {
    fn name(&self) -> &str {
        &self.index
    }

    fn category(&self) -> CapabilityCategory {
        CapabilityCategory::VectorIndex
    }

    fn tools(&self) -> Vec<Tool> {
        vec![
            Tool::new(
                ADD_DOCUMENTS,
                format!("Add text documents to the vector index '{}'.", self.index),
                json!({
                    "type": "object",
                    "properties": {
                        "documents": {
                            "type": "array",
                            "items": {"type": ["string", "object"]},
                            "description": "Texts, or objects with 'text' and optional 'metadata'"
                        }
                    },
                    "required": ["documents"]
                }),
            ),
            Tool::new(
                SEARCH,
                format!("Search the vector index '{}' for relevant passages.", self.index),
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "k": {"type": "integer", "minimum": 1}
                    },
                    "required": ["query"]
                }),
            ),
        ]
    }

    async fn call(&self, tool: &str, args: &Value) -> Result<String, CapabilityError> {
        match tool {
            ADD_DOCUMENTS => {
                let docs = Self::parse_documents(args)?;
                let added = docs.len();
                let total = self.backend.add(&self.index, docs).await?;
                Ok(format!("Indexed {added} documents into {} ({total} total)", self.index))
            }
            SEARCH => {
                let query = str_arg(args, tool, "query")?;
                let k = args
                    .get("k")
                    .and_then(Value::as_u64)
                    .map(|k| k as usize)
                    .unwrap_or(self.max_results);
                let hits = self.backend.query(&self.index, query, k).await?;
                debug!(index = %self.index, hits = hits.len(), "vector search");
                serde_json::to_string_pretty(&hits).map_err(|e| CapabilityError::Backend(e.to_string()))
            }
            other => Err(CapabilityError::UnknownTool {
                capability: self.index.clone(),
                tool: other.to_string(),
            }),
        }
    }

    async fn teardown(&self) -> Result<(), CapabilityError> {
        if self.backend.delete_index(&self.index).await? {
            info!(index = %self.index, "vector index deleted");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn is_valid_name(name: &str) -> bool {
        name.len() <= MAX_INDEX_NAME
            && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            && name.starts_with(|c: char| c.is_ascii_alphanumeric())
            && name.ends_with(|c: char| c.is_ascii_alphanumeric())
    }

    #[test]
    fn sanitized_names_are_valid_and_unique() {
        let a = sanitize_index_name("agent 1/report:final");
        let b = sanitize_index_name("agent 1/report:final");
        assert!(a.starts_with("agent_1_report_final_"));
        assert!(is_valid_name(&a));
        assert_ne!(a, b);

        for raw in ["", "___", "-x-", "é", &"z".repeat(200), "a.b-c_"] {
            let name = sanitize_index_name(raw);
            assert!(is_valid_name(&name), "{raw:?} -> {name:?}");
        }
    }

    #[test]
    fn chunks_overlap() {
        let text: String = "abcdefghij".repeat(3);
        let chunks = chunk_text(&text, 10, 4);
        assert_eq!(chunks[0], "abcdefghij");
        assert_eq!(chunks[1], "ghijabcdef");
        assert!(chunks.last().unwrap().ends_with("hij"));
        assert!(chunk_text("", 10, 2).is_empty());
    }

    #[tokio::test]
    async fn add_search_teardown() {
        let backend = Arc::new(InMemoryVectorBackend::new());
        let cap = VectorIndexCapability::create("sales idx", backend.clone(), 3).await.unwrap();
        assert!(backend.index_exists(cap.index_name()).await);

        let out = cap
            .call(
                ADD_DOCUMENTS,
                &json!({"documents": [
                    "Quarterly revenue grew in the north region",
                    {"text": "Staff headcount was flat", "metadata": {"page": 2}},
                ]}),
            )
            .await
            .unwrap();
        assert!(out.starts_with("Indexed 2 documents"));

        let hits = cap.call(SEARCH, &json!({"query": "revenue north"})).await.unwrap();
        let hits: Vec<Value> = serde_json::from_str(&hits).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["score"], json!(1.0));

        cap.teardown().await.unwrap();
        assert!(!backend.index_exists(cap.index_name()).await);
        assert_eq!(backend.index_count(), 0);
    }

    #[tokio::test]
    async fn bad_documents_are_rejected() {
        let backend = Arc::new(InMemoryVectorBackend::new());
        let cap = VectorIndexCapability::create("x", backend, 3).await.unwrap();
        assert!(cap.call(ADD_DOCUMENTS, &json!({"documents": [1]})).await.is_err());
        assert!(cap.call(ADD_DOCUMENTS, &json!({})).await.is_err());
    }
}
