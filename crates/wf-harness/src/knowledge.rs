//! External knowledge search, used to look up fixes for failing units.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use wf_core::config::{CredentialProvider, IntegrationConfig};

const TAVILY_ENDPOINT: &str = "https://api.tavily.com/search";

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("knowledge search unavailable: {0}")]
    Unavailable(String),

    #[error("search failed (status {status})")]
    Status { status: u16 },

    #[error("search request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub results: Vec<SearchHit>,
}

impl SearchResults {
    pub fn is_empty(&self) -> bool {
        self.answer.as_deref().is_none_or(str::is_empty) && self.results.is_empty()
    }
}

#[async_trait::async_trait]
pub trait KnowledgeSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<SearchResults, SearchError>;
}

// ---------------------------------------------------------------------------
// Tavily
// ---------------------------------------------------------------------------

pub struct TavilySearch {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl TavilySearch {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            endpoint: TAVILY_ENDPOINT.to_string(),
        }
    }

    /// `None` when the configured key variable is unset.
    pub fn from_config(cfg: &IntegrationConfig) -> Option<Self> {
        CredentialProvider::from_env(&cfg.tavily_api_key_env).map(Self::new)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait::async_trait]
impl KnowledgeSearch for TavilySearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<SearchResults, SearchError> {
        debug!(query, max_results, "knowledge search");
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "api_key": self.api_key,
                "query": query,
                "max_results": max_results,
                "include_answer": true,
                "search_depth": "advanced",
            }))
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SearchError::Status {
                status: status.as_u16(),
            });
        }
        let mut results: SearchResults = resp.json().await?;
        results.results.truncate(max_results);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tavily_shape() {
        let body = r#"{
            "query": "python KeyError solution fix",
            "answer": "Use dict.get",
            "results": [{"title": "SO", "url": "https://x", "content": "c", "score": 0.9}]
        }"#;
        let parsed: SearchResults = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.answer.as_deref(), Some("Use dict.get"));
        assert_eq!(parsed.results[0].title, "SO");
        assert!(!parsed.is_empty());
    }

    #[test]
    fn empty_results() {
        let parsed: SearchResults = serde_json::from_str(r#"{"answer": null, "results": []}"#).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn from_config_requires_key() {
        let cfg = IntegrationConfig {
            tavily_api_key_env: "WF_TEST_TAVILY_KEY_UNSET".into(),
            ..IntegrationConfig::default()
        };
        assert!(TavilySearch::from_config(&cfg).is_none());
    }
}
