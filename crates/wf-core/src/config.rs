use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.weft/config.toml`.
///
/// **Security**: this struct never stores API keys or tokens. Sections hold
/// env var *names*; [`CredentialProvider`] resolves them at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub integrations: IntegrationConfig,
}

impl Config {
    /// Load config from `~/.weft/config.toml`, falling back to defaults when
    /// the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.sandbox.validate()?;
        self.deploy.validate()?;
        Ok(())
    }

    /// Directory the code sandbox runs in.
    pub fn sandbox_work_dir(&self) -> PathBuf {
        self.sandbox
            .work_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&self.deploy.upload_dir))
    }

    /// Root the file-store capability is confined to.
    pub fn filesystem_root(&self) -> PathBuf {
        self.integrations
            .filesystem_root
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&self.deploy.upload_dir))
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".weft")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_project_name() -> String {
    "weft".into()
}
fn default_log_level() -> String {
    "info".into()
}

/// What happens to dependents of a unit that exhausted its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Dependents run and receive the failed unit's error payload.
    #[default]
    Propagate,
    /// Dependents (transitively) are marked skipped and never invoked.
    SkipDependents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_pause_ms")]
    pub retry_pause_ms: u64,
    #[serde(default = "default_true")]
    pub enable_error_learning: bool,
    #[serde(default = "default_true")]
    pub persist_failure_signatures: bool,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// 0 means every unit of a level runs at once.
    #[serde(default)]
    pub max_concurrent_units: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_pause_ms: default_retry_pause_ms(),
            enable_error_learning: true,
            persist_failure_signatures: true,
            failure_policy: FailurePolicy::Propagate,
            max_concurrent_units: 0,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "engine.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_retry_pause_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub work_dir: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python: default_python(),
            timeout_secs: default_sandbox_timeout(),
            work_dir: None,
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "sandbox.timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_python() -> String {
    "python3".into()
}
fn default_sandbox_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    #[serde(default = "default_vector_backend")]
    pub backend: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            backend: default_vector_backend(),
            max_results: default_max_results(),
        }
    }
}

fn default_vector_backend() -> String {
    "memory".into()
}
fn default_max_results() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
    #[serde(default = "default_port_start")]
    pub port_start: u16,
    #[serde(default = "default_port_end")]
    pub port_end: u16,
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,
    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_ms: u64,
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_streamlit_bin")]
    pub streamlit_bin: String,
    #[serde(default = "default_python")]
    pub python: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            port_start: default_port_start(),
            port_end: default_port_end(),
            readiness_timeout_secs: default_readiness_timeout(),
            readiness_interval_ms: default_readiness_interval(),
            stop_grace_secs: default_stop_grace(),
            streamlit_bin: default_streamlit_bin(),
            python: default_python(),
        }
    }
}

impl DeployConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_start == 0 || self.port_start > self.port_end {
            return Err(ConfigError::Validation(format!(
                "deploy port range {}..={} is empty",
                self.port_start, self.port_end
            )));
        }
        if self.readiness_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "deploy.readiness_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn port_count(&self) -> usize {
        usize::from(self.port_end.saturating_sub(self.port_start)) + 1
    }
}

fn default_upload_dir() -> String {
    "./data/uploads".into()
}
fn default_port_start() -> u16 {
    8501
}
fn default_port_end() -> u16 {
    8600
}
fn default_readiness_timeout() -> u64 {
    30
}
fn default_readiness_interval() -> u64 {
    1000
}
fn default_stop_grace() -> u64 {
    5
}
fn default_streamlit_bin() -> String {
    "streamlit".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    #[serde(default = "default_provider_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_provider_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tool_turns")]
    pub max_tool_turns: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            model: default_provider_model(),
            temperature: default_temperature(),
            api_key_env: default_provider_key_env(),
            max_tool_turns: default_max_tool_turns(),
        }
    }
}

fn default_provider_base_url() -> String {
    "https://api.openai.com".into()
}
fn default_provider_model() -> String {
    "gpt-4-turbo".into()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_provider_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_max_tool_turns() -> usize {
    8
}

/// External integrations. Stores env var *names*, never secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    #[serde(default = "default_tavily_env")]
    pub tavily_api_key_env: String,
    #[serde(default = "default_slack_env")]
    pub slack_bot_token_env: String,
    #[serde(default = "default_mongodb_env")]
    pub mongodb_uri_env: String,
    #[serde(default)]
    pub filesystem_root: Option<String>,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            tavily_api_key_env: default_tavily_env(),
            slack_bot_token_env: default_slack_env(),
            mongodb_uri_env: default_mongodb_env(),
            filesystem_root: None,
        }
    }
}

fn default_tavily_env() -> String {
    "TAVILY_API_KEY".into()
}
fn default_slack_env() -> String {
    "SLACK_BOT_TOKEN".into()
}
fn default_mongodb_env() -> String {
    "MONGODB_URI".into()
}

// ---------------------------------------------------------------------------
// CredentialProvider
// ---------------------------------------------------------------------------

/// Reads credentials from environment variables at runtime.
pub struct CredentialProvider;

impl CredentialProvider {
    /// Read a credential from a named env var. Empty values count as absent.
    pub fn from_env(var_name: &str) -> Option<String> {
        std::env::var(var_name).ok().filter(|v| !v.trim().is_empty())
    }

    /// Which integrations have credentials available.
    pub fn available_integrations(cfg: &IntegrationConfig) -> Vec<&'static str> {
        let mut found = Vec::new();
        if Self::from_env(&cfg.tavily_api_key_env).is_some() {
            found.push("tavily");
        }
        if Self::from_env(&cfg.slack_bot_token_env).is_some() {
            found.push("slack");
        }
        if Self::from_env(&cfg.mongodb_uri_env).is_some() {
            found.push("mongodb");
        }
        found
    }
}
