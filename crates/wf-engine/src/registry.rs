//! Capability registry: resolves a requested capability name to a
//! provisioned capability.
//!
//! Resolution walks [`RESOLVERS`] in order and the first matching entry
//! wins. Names are matched lowercase for the reliable table and normalized
//! (lowercase, without spaces, `-` or `_`) for keyword rules. Anything
//! unmatched falls back to the code sandbox.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use wf_core::config::{Config, CredentialProvider};
use wf_core::types::{CapabilityCategory, CapabilityRequirement};
use wf_deploy::ServiceManager;
use wf_harness::knowledge::{KnowledgeSearch, TavilySearch};
use wf_harness::provider::LlmProvider;
use wf_harness::sandbox::CodeSandbox;

use crate::capability::reliable::{RagBuilderCapability, RagChatCapability, ReportGeneratorCapability};
use crate::capability::{
    Capability, CapabilityError, CodeCapability, FileStoreCapability, InMemoryVectorBackend,
    ProvisionedCapability, RecordStoreCapability, ServiceDeployCapability, SlackCapability,
    VectorBackend, VectorIndexCapability, WebSearchCapability,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to provision {name}: {source}")]
    Provision { name: String, source: CapabilityError },
}

// ---------------------------------------------------------------------------
// Resolution table
// ---------------------------------------------------------------------------

/// What a requested name resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverKind {
    RagBuilder,
    RagChat,
    ReportGenerator,
    WebSearch,
    ServiceDeploy,
    CodeSandbox,
    VectorIndex,
    FileStore,
    RecordStore,
    ChatNotify,
}

struct Request {
    lower: String,
    normalized: String,
    category: Option<CapabilityCategory>,
}

impl Request {
    fn new(raw: &str, category: Option<CapabilityCategory>) -> Self {
        let lower = raw.trim().to_lowercase();
        let normalized = lower.chars().filter(|c| !matches!(c, ' ' | '-' | '_')).collect();
        Self {
            lower,
            normalized,
            category,
        }
    }

    fn has_any(&self, words: &[&str]) -> bool {
        words.iter().any(|w| self.normalized.contains(w))
    }
}

const CODE_WORDS: &[&str] = &["python", "executor", "code", "execute", "script", "processor", "parser"];
const VECTOR_WORDS: &[&str] = &["vector", "chroma", "faiss", "rag", "index", "semantic"];
const DEPLOY_WORDS: &[&str] = &["deploy", "streamlit", "gradio", "flask"];

struct Resolver {
    kind: ResolverKind,
    matches: fn(&Request) -> bool,
}

/// Priority-ordered resolution rules.
const RESOLVERS: &[Resolver] = &[
    Resolver { kind: ResolverKind::RagBuilder, matches: |r| r.lower == "rag_builder" },
    Resolver { kind: ResolverKind::RagChat, matches: |r| r.lower == "rag_chat" },
    Resolver { kind: ResolverKind::ReportGenerator, matches: |r| r.lower == "report_generator" },
    Resolver { kind: ResolverKind::WebSearch, matches: |r| r.lower == "web_search" },
    Resolver {
        kind: ResolverKind::ServiceDeploy,
        matches: |r| r.category == Some(CapabilityCategory::ServiceDeploy),
    },
    Resolver { kind: ResolverKind::CodeSandbox, matches: |r| r.has_any(CODE_WORDS) },
    Resolver { kind: ResolverKind::ServiceDeploy, matches: |r| r.has_any(DEPLOY_WORDS) },
    Resolver { kind: ResolverKind::VectorIndex, matches: |r| r.has_any(VECTOR_WORDS) },
    Resolver { kind: ResolverKind::FileStore, matches: |r| r.has_any(&["filesystem", "file"]) },
    Resolver { kind: ResolverKind::RecordStore, matches: |r| r.has_any(&["mongo"]) },
    Resolver { kind: ResolverKind::ChatNotify, matches: |r| r.has_any(&["slack"]) },
    Resolver { kind: ResolverKind::WebSearch, matches: |r| r.has_any(&["web", "search"]) },
];

/// Resolve `name` without provisioning anything. `None` means the name was
/// not recognized and the sandbox fallback applies.
pub fn resolve(name: &str, category: Option<CapabilityCategory>) -> Option<ResolverKind> {
    let req = Request::new(name, category);
    RESOLVERS.iter().find(|r| (r.matches)(&req)).map(|r| r.kind)
}

// ---------------------------------------------------------------------------
// CapabilityRegistry
// ---------------------------------------------------------------------------

pub struct CapabilityRegistry {
    sandbox: CodeSandbox,
    vector: Arc<dyn VectorBackend>,
    vector_max_results: usize,
    file_root: PathBuf,
    upload_dir: PathBuf,
    slack_token: Option<String>,
    record_store_configured: bool,
    search: Option<Arc<dyn KnowledgeSearch>>,
    provider: Option<Arc<dyn LlmProvider>>,
    services: Arc<ServiceManager>,
}

impl CapabilityRegistry {
    /// Registry with an in-memory vector backend, integrations read from the
    /// configured env vars.
    pub fn from_config(cfg: &Config, services: Arc<ServiceManager>) -> Self {
        let search = TavilySearch::from_config(&cfg.integrations).map(|s| Arc::new(s) as Arc<dyn KnowledgeSearch>);
        if cfg.vector.backend != "memory" {
            warn!(backend = %cfg.vector.backend, "unsupported vector backend, using in-memory index");
        }
        Self {
            sandbox: CodeSandbox::from_config(cfg),
            vector: Arc::new(InMemoryVectorBackend::new()),
            vector_max_results: cfg.vector.max_results,
            file_root: cfg.filesystem_root(),
            upload_dir: PathBuf::from(&cfg.deploy.upload_dir),
            slack_token: CredentialProvider::from_env(&cfg.integrations.slack_bot_token_env),
            record_store_configured: CredentialProvider::from_env(&cfg.integrations.mongodb_uri_env).is_some(),
            search,
            provider: None,
            services,
        }
    }

    pub fn with_vector_backend(mut self, backend: Arc<dyn VectorBackend>) -> Self {
        self.vector = backend;
        self
    }

    pub fn with_search(mut self, search: Option<Arc<dyn KnowledgeSearch>>) -> Self {
        self.search = search;
        self
    }

    /// Provider `rag_chat` answers with.
    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_slack_token(mut self, token: Option<String>) -> Self {
        self.slack_token = token;
        self
    }

    pub fn vector_backend(&self) -> Arc<dyn VectorBackend> {
        self.vector.clone()
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    pub fn search(&self) -> Option<Arc<dyn KnowledgeSearch>> {
        self.search.clone()
    }

    /// Provision the capability `name` resolves to for `owner`.
    pub async fn provision(
        &self,
        name: &str,
        owner: &str,
        purpose: &str,
    ) -> Result<ProvisionedCapability, RegistryError> {
        self.provision_as(name, None, owner, purpose).await
    }

    /// Provision a unit's declared requirement; its category is consulted
    /// for deploy capabilities.
    pub async fn provision_requirement(
        &self,
        requirement: &CapabilityRequirement,
        owner: &str,
    ) -> Result<ProvisionedCapability, RegistryError> {
        self.provision_as(&requirement.name, Some(requirement.category), owner, &requirement.purpose)
            .await
    }

    async fn provision_as(
        &self,
        name: &str,
        category: Option<CapabilityCategory>,
        owner: &str,
        purpose: &str,
    ) -> Result<ProvisionedCapability, RegistryError> {
        let kind = resolve(name, category).unwrap_or_else(|| {
            warn!(capability = name, owner, "unrecognized capability, falling back to code sandbox");
            ResolverKind::CodeSandbox
        });

        let provisioned = match kind {
            ResolverKind::VectorIndex => {
                let cap = VectorIndexCapability::create(
                    &format!("{owner}_{name}"),
                    self.vector.clone(),
                    self.vector_max_results,
                )
                .await
                .map_err(|source| RegistryError::Provision {
                    name: name.to_string(),
                    source,
                })?;
                ProvisionedCapability::new(name, Arc::new(cap)).with_cleanup()
            }
            other => ProvisionedCapability::new(name, self.shared(other)),
        };

        if !provisioned.available() {
            warn!(capability = name, owner, "capability provisioned without required configuration");
        }
        debug!(capability = name, owner, ?kind, purpose, "capability provisioned");
        Ok(provisioned)
    }

    fn shared(&self, kind: ResolverKind) -> Arc<dyn Capability> {
        match kind {
            ResolverKind::RagBuilder => Arc::new(RagBuilderCapability::new(self.vector.clone())),
            ResolverKind::RagChat => Arc::new(RagChatCapability::new(self.vector.clone(), self.provider.clone())),
            ResolverKind::ReportGenerator => Arc::new(ReportGeneratorCapability::new(self.upload_dir.clone())),
            ResolverKind::WebSearch => Arc::new(
                WebSearchCapability::new(self.search.clone()).with_max_results(self.vector_max_results),
            ),
            ResolverKind::ServiceDeploy => Arc::new(ServiceDeployCapability::new(self.services.clone())),
            ResolverKind::FileStore => Arc::new(FileStoreCapability::new(self.file_root.clone())),
            ResolverKind::RecordStore => Arc::new(RecordStoreCapability::new(self.record_store_configured)),
            ResolverKind::ChatNotify => Arc::new(SlackCapability::new(self.slack_token.clone())),
            ResolverKind::CodeSandbox | ResolverKind::VectorIndex => {
                Arc::new(CodeCapability::new(self.sandbox.clone()))
            }
        }
    }

    /// Tear down `capability` if it owns resources. Teardown errors are
    /// logged, never returned.
    pub async fn release(&self, capability: ProvisionedCapability) {
        if !capability.needs_cleanup {
            return;
        }
        match capability.handle.teardown().await {
            Ok(()) => info!(capability = %capability.requested, "capability released"),
            Err(e) => warn!(capability = %capability.requested, error = %e, "capability teardown failed"),
        }
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("file_root", &self.file_root)
            .field("upload_dir", &self.upload_dir)
            .field("slack", &self.slack_token.is_some())
            .field("record_store", &self.record_store_configured)
            .field("search", &self.search.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &std::path::Path) -> CapabilityRegistry {
        let mut cfg = Config::default();
        cfg.deploy.upload_dir = dir.to_string_lossy().into_owned();
        cfg.deploy.port_start = 47610;
        cfg.deploy.port_end = 47611;
        let services = Arc::new(ServiceManager::new(cfg.deploy.clone()));
        CapabilityRegistry::from_config(&cfg, services)
            .with_search(None)
            .with_slack_token(None)
    }

    #[test]
    fn resolution_order() {
        use ResolverKind::*;
        let cases = [
            ("rag_builder", Some(RagBuilder)),
            ("RAG_Chat", Some(RagChat)),
            ("report_generator", Some(ReportGenerator)),
            ("web_search", Some(WebSearch)),
            ("Python Executor", Some(CodeSandbox)),
            ("csv-parser", Some(CodeSandbox)),
            ("chroma_store", Some(VectorIndex)),
            ("semantic-index", Some(VectorIndex)),
            // "rag" in a non-exact name is a keyword hit, not the reliable tool
            ("rag_builder_v2", Some(VectorIndex)),
            ("filesystem", Some(FileStore)),
            ("mongodb", Some(RecordStore)),
            ("slack_notifier", Some(ChatNotify)),
            ("tavily web lookup", Some(WebSearch)),
            ("streamlit_app", Some(ServiceDeploy)),
            // code vocabulary outranks framework names
            ("flask_code_runner", Some(CodeSandbox)),
            ("quantum_flux", None),
        ];
        for (name, expected) in cases {
            assert_eq!(resolve(name, None), expected, "{name}");
        }
        assert_eq!(
            resolve("publisher", Some(CapabilityCategory::ServiceDeploy)),
            Some(ServiceDeploy)
        );
    }

    #[tokio::test]
    async fn vector_indexes_are_fresh_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let backend = reg.vector_backend();

        let a = reg.provision("vector_db", "agent 1", "store").await.unwrap();
        let b = reg.provision("vector_db", "agent 1", "store").await.unwrap();
        assert!(a.needs_cleanup);
        assert_ne!(a.handle.name(), b.handle.name());
        assert!(a.handle.name().starts_with("agent_1_vector_db_"));

        let name = a.handle.name().to_string();
        assert!(backend.index_exists(&name).await);
        reg.release(a).await;
        assert!(!backend.index_exists(&name).await);
        reg.release(b).await;
    }

    #[tokio::test]
    async fn unknown_names_fall_back_to_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let cap = reg.provision("quantum_flux", "a1", "").await.unwrap();
        assert_eq!(cap.category, CapabilityCategory::CodeExecution);
        assert!(!cap.needs_cleanup);
        assert_eq!(cap.handle.tools()[0].name, "execute_python");
    }

    #[tokio::test]
    async fn unconfigured_integrations_are_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        assert!(!reg.provision("slack", "a1", "").await.unwrap().available());
        assert!(!reg.provision("web_search", "a1", "").await.unwrap().available());
        assert!(reg.provision("filesystem", "a1", "").await.unwrap().available());

        let req = CapabilityRequirement::new("publisher", CapabilityCategory::ServiceDeploy);
        let deploy = reg.provision_requirement(&req, "a1").await.unwrap();
        assert_eq!(deploy.category, CapabilityCategory::ServiceDeploy);
        assert!(!deploy.needs_cleanup);
    }
}
