//! Pre-validated capabilities resolved by exact name before any keyword
//! matching: `rag_builder`, `rag_chat` and `report_generator`. The fourth
//! reliable name, `web_search`, reuses [`super::WebSearchCapability`].

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use wf_core::types::CapabilityCategory;
use wf_harness::provider::{LlmProvider, Message, Tool};

use super::vector::{chunk_text, Document, VectorBackend};
use super::{str_arg, Capability, CapabilityError};

pub const DEFAULT_COLLECTION: &str = "rag_documents";
const CHUNK_SIZE: usize = 800;
const CHUNK_OVERLAP: usize = 200;

fn unknown(capability: &str, tool: &str) -> CapabilityError {
    CapabilityError::UnknownTool {
        capability: capability.to_string(),
        tool: tool.to_string(),
    }
}

fn collection_arg(args: &Value) -> &str {
    args.get("collection_name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_COLLECTION)
}

// ---------------------------------------------------------------------------
// rag_builder
// ---------------------------------------------------------------------------

/// Chunks files and indexes them into a named, persistent collection.
pub struct RagBuilderCapability {
    backend: Arc<dyn VectorBackend>,
}

impl RagBuilderCapability {
    pub fn new(backend: Arc<dyn VectorBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Capability for RagBuilderCapability {
    fn name(&self) -> &str {
        "rag_builder"
    }

    fn category(&self) -> CapabilityCategory {
        CapabilityCategory::VectorIndex
    }

    fn tools(&self) -> Vec<Tool> {
        vec![Tool::new(
            "rag_builder",
            "Index text files into a retrieval collection",
            json!({
                "type": "object",
                "properties": {
                    "file_paths": {"type": "array", "items": {"type": "string"}},
                    "collection_name": {"type": "string", "default": DEFAULT_COLLECTION}
                },
                "required": ["file_paths"]
            }),
        )]
    }

    async fn call(&self, tool: &str, args: &Value) -> Result<String, CapabilityError> {
        if tool != "rag_builder" {
            return Err(unknown(self.name(), tool));
        }
        let paths: Vec<&str> = args
            .get("file_paths")
            .and_then(Value::as_array)
            .ok_or_else(|| CapabilityError::missing_arg(tool, "file_paths"))?
            .iter()
            .filter_map(Value::as_str)
            .collect();
        let collection = collection_arg(args);
        self.backend.ensure_index(collection).await?;

        let mut total_chunks = 0;
        let mut total_documents = 0;
        for path in paths {
            let text = match tokio::fs::read_to_string(path).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(path, error = %e, "skipping unreadable file");
                    continue;
                }
            };
            let docs: Vec<Document> = chunk_text(&text, CHUNK_SIZE, CHUNK_OVERLAP)
                .into_iter()
                .enumerate()
                .map(|(i, chunk)| {
                    let mut meta = serde_json::Map::new();
                    meta.insert("source".into(), json!(path));
                    meta.insert("chunk".into(), json!(i));
                    Document::new(chunk).with_metadata(meta)
                })
                .collect();
            total_chunks += docs.len();
            total_documents += 1;
            self.backend.add(collection, docs).await?;
        }

        info!(collection, total_documents, total_chunks, "collection indexed");
        let status = if total_documents > 0 { "success" } else { "empty" };
        Ok(json!({
            "collection_name": collection,
            "total_chunks": total_chunks,
            "total_documents": total_documents,
            "status": status,
        })
        .to_string())
    }
}

// ---------------------------------------------------------------------------
// rag_chat
// ---------------------------------------------------------------------------

/// Answers a question from retrieved passages. Without a provider the
/// passages themselves are returned.
pub struct RagChatCapability {
    backend: Arc<dyn VectorBackend>,
    provider: Option<Arc<dyn LlmProvider>>,
    top_k: usize,
}

impl RagChatCapability {
    pub fn new(backend: Arc<dyn VectorBackend>, provider: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            backend,
            provider,
            top_k: 4,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }
}

#[async_trait]
impl Capability for RagChatCapability {
    fn name(&self) -> &str {
        "rag_chat"
    }

    fn category(&self) -> CapabilityCategory {
        CapabilityCategory::VectorIndex
    }

    fn tools(&self) -> Vec<Tool> {
        vec![Tool::new(
            "rag_chat",
            "Answer a question using passages retrieved from a collection",
            json!({
                "type": "object",
                "properties": {
                    "question": {"type": "string"},
                    "collection_name": {"type": "string", "default": DEFAULT_COLLECTION}
                },
                "required": ["question"]
            }),
        )]
    }

    async fn call(&self, tool: &str, args: &Value) -> Result<String, CapabilityError> {
        if tool != "rag_chat" {
            return Err(unknown(self.name(), tool));
        }
        let question = str_arg(args, tool, "question")?;
        let collection = collection_arg(args);
        if !self.backend.index_exists(collection).await {
            return Err(CapabilityError::Backend(format!(
                "collection '{collection}' has not been built"
            )));
        }

        let hits = self.backend.query(collection, question, self.top_k).await?;
        if hits.is_empty() {
            return Ok(format!("No relevant passages found in {collection}"));
        }
        let context = hits
            .iter()
            .enumerate()
            .map(|(i, h)| format!("[{}] {}", i + 1, h.document.text))
            .collect::<Vec<_>>()
            .join("\n\n");

        let Some(ref provider) = self.provider else {
            return Ok(format!("Retrieved passages:\n\n{context}"));
        };
        let messages = vec![
            Message::system("Answer the question using only the provided context. Cite passages as [n]."),
            Message::user(format!("Context:\n{context}\n\nQuestion: {question}")),
        ];
        let resp = provider
            .chat(messages, None)
            .await
            .map_err(|e| CapabilityError::Backend(e.to_string()))?;
        Ok(format!("Answer: {}", resp.content.unwrap_or_default()))
    }
}

// ---------------------------------------------------------------------------
// report_generator
// ---------------------------------------------------------------------------

/// Writes a markdown report into the upload directory.
pub struct ReportGeneratorCapability {
    output_dir: PathBuf,
}

impl ReportGeneratorCapability {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    fn render(title: &str, sections: &[Value]) -> String {
        let mut out = format!("# {title}\n\n_Generated {}_\n", Utc::now().format("%Y-%m-%d %H:%M UTC"));
        for section in sections {
            match section {
                Value::String(text) => out.push_str(&format!("\n{text}\n")),
                Value::Object(obj) => {
                    let heading = obj.get("heading").and_then(Value::as_str).unwrap_or("Section");
                    let content = obj.get("content").and_then(Value::as_str).unwrap_or_default();
                    out.push_str(&format!("\n## {heading}\n\n{content}\n"));
                }
                other => out.push_str(&format!("\n{other}\n")),
            }
        }
        out
    }
}

fn slug(title: &str) -> String {
    let s: String = title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    let s = s.trim_matches('_');
    if s.is_empty() {
        "report".to_string()
    } else {
        s.chars().take(40).collect()
    }
}

#[async_trait]
impl Capability for ReportGeneratorCapability {
    fn name(&self) -> &str {
        "report_generator"
    }

    fn category(&self) -> CapabilityCategory {
        CapabilityCategory::CodeExecution
    }

    fn tools(&self) -> Vec<Tool> {
        vec![Tool::new(
            "report_generator",
            "Write a markdown report and return its path",
            json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "sections": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "heading": {"type": "string"},
                                "content": {"type": "string"}
                            }
                        }
                    }
                },
                "required": ["title", "sections"]
            }),
        )]
    }

    async fn call(&self, tool: &str, args: &Value) -> Result<String, CapabilityError> {
        if tool != "report_generator" {
            return Err(unknown(self.name(), tool));
        }
        let title = str_arg(args, tool, "title")?;
        let sections = args
            .get("sections")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self
            .output_dir
            .join(format!("{}_{}.md", slug(title), Utc::now().format("%Y%m%d_%H%M%S")));
        tokio::fs::write(&path, Self::render(title, sections)).await?;
        info!(path = %path.display(), "report written");
        Ok(format!("✅ Report generated and saved to {}", path.display()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::InMemoryVectorBackend;

    #[tokio::test]
    async fn build_then_chat_without_provider() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("notes.txt");
        std::fs::write(&doc, "The warehouse in Leeds ships on Tuesdays. ".repeat(40)).unwrap();

        let backend: Arc<dyn VectorBackend> = Arc::new(InMemoryVectorBackend::new());
        let builder = RagBuilderCapability::new(backend.clone());
        let out = builder
            .call(
                "rag_builder",
                &json!({"file_paths": [doc.to_str().unwrap(), "/nope/missing.txt"]}),
            )
            .await
            .unwrap();
        let summary: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(summary["collection_name"], "rag_documents");
        assert_eq!(summary["total_documents"], 1);
        assert_eq!(summary["status"], "success");
        assert!(summary["total_chunks"].as_u64().unwrap() >= 2);

        let chat = RagChatCapability::new(backend, None);
        let answer = chat
            .call("rag_chat", &json!({"question": "When does Leeds ship?"}))
            .await
            .unwrap();
        assert!(answer.starts_with("Retrieved passages:"));
        assert!(answer.contains("Tuesdays"));

        let err = chat
            .call("rag_chat", &json!({"question": "x", "collection_name": "unbuilt"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("has not been built"));
    }

    #[tokio::test]
    async fn report_is_written_under_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cap = ReportGeneratorCapability::new(dir.path());
        let out = cap
            .call(
                "report_generator",
                &json!({
                    "title": "Q3 Sales / Summary",
                    "sections": [{"heading": "Totals", "content": "Revenue up 4%"}]
                }),
            )
            .await
            .unwrap();
        let path = out.trim_start_matches("✅ Report generated and saved to ");
        assert!(path.contains("q3_sales___summary_"));
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.starts_with("# Q3 Sales / Summary\n"));
        assert!(body.contains("## Totals\n\nRevenue up 4%"));
    }
}
