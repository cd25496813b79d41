//! Generation provider abstraction.
//!
//! [`LlmProvider`] is the seam between the engine and whatever model runs a
//! unit's instructions. [`OpenAiProvider`] speaks the `/v1/chat/completions`
//! protocol with function-style tool calling; [`StubProvider`] fails every
//! call and stands in where no provider is configured.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use wf_core::config::{CredentialProvider, ProviderConfig};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Missing API key or no concrete provider installed.
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("request timed out")]
    Timeout,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Other(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A single message in a conversation.
///
/// Assistant messages that requested tools carry the calls in `tool_calls`;
/// tool results link back through `tool_call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// Assistant turn that requested `calls`.
    pub fn assistant_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    /// Result of executing `call`.
    pub fn tool_result(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            name: Some(call.name.clone()),
            tool_call_id: Some(call.id.clone()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// Definition of a tool the model may call. `parameters` is a JSON Schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A tool invocation requested by the model. `arguments` is raw JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    /// Arguments parsed as JSON; non-JSON text becomes `{"input": text}`.
    pub fn parsed_arguments(&self) -> Value {
        serde_json::from_str(&self.arguments).unwrap_or_else(|_| json!({ "input": self.arguments }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub model: String,
    pub usage: Option<Usage>,
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, messages: Vec<Message>, tools: Option<Vec<Tool>>) -> Result<Response, ProviderError>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// StubProvider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StubProvider {
    provider_name: String,
}

impl StubProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            provider_name: name.into(),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for StubProvider {
    async fn chat(&self, _messages: Vec<Message>, _tools: Option<Vec<Tool>>) -> Result<Response, ProviderError> {
        Err(ProviderError::NotConfigured(format!(
            "{} provider has no API key",
            self.provider_name
        )))
    }

    fn name(&self) -> &str {
        &self.provider_name
    }
}

// ---------------------------------------------------------------------------
// OpenAiProvider
// ---------------------------------------------------------------------------

/// Chat Completions client with tool calling.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com".to_string(),
            model: model.into(),
            temperature: 0.3,
        }
    }

    /// Build from config, reading the key from the configured env var.
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self, ProviderError> {
        let key = CredentialProvider::from_env(&cfg.api_key_env).ok_or_else(|| {
            ProviderError::NotConfigured(format!("{} is not set", cfg.api_key_env))
        })?;
        Ok(Self::new(key, cfg.model.clone())
            .with_base_url(cfg.base_url.clone())
            .with_temperature(cfg.temperature))
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// JSON body for one chat completions request.
    pub fn build_request_body(&self, messages: &[Message], tools: Option<&[Tool]>) -> Value {
        let api_messages: Vec<Value> = messages.iter().map(message_to_api).collect();

        let mut body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": api_messages,
        });
        if let Some(tools) = tools.filter(|t| !t.is_empty()) {
            let defs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(defs);
        }
        body
    }
}

fn message_to_api(msg: &Message) -> Value {
    let mut v = json!({
        "role": msg.role.as_str(),
        "content": msg.content,
    });
    if let Some(ref id) = msg.tool_call_id {
        v["tool_call_id"] = json!(id);
    }
    if !msg.tool_calls.is_empty() {
        v["tool_calls"] = Value::Array(
            msg.tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments },
                    })
                })
                .collect(),
        );
    }
    v
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    model: String,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Parse a chat completions response body.
pub fn parse_response(body: &str) -> Result<Response, ProviderError> {
    let api: ApiResponse = serde_json::from_str(body).map_err(|e| ProviderError::Parse(e.to_string()))?;
    let choice = api
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Parse("no choices in response".into()))?;
    Ok(Response {
        content: choice.message.content,
        tool_calls: choice
            .message
            .tool_calls
            .into_iter()
            .map(|c| ToolCall {
                id: c.id,
                name: c.function.name,
                arguments: c.function.arguments,
            })
            .collect(),
        model: api.model,
        usage: api.usage.map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
    })
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiProvider {
    async fn chat(&self, messages: Vec<Message>, tools: Option<Vec<Tool>>) -> Result<Response, ProviderError> {
        let body = self.build_request_body(&messages, tools.as_deref());
        let url = format!("{}/v1/chat/completions", self.base_url);
        debug!(model = %self.model, messages = messages.len(), "chat completion request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry_after_ms = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(ProviderError::RateLimited { retry_after_ms });
        }

        let text = resp.text().await?;
        if !(200..300).contains(&status) {
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }
        parse_response(&text)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_provider_is_not_configured() {
        let p = StubProvider::new("none");
        let err = p.chat(vec![Message::user("hi")], None).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
        assert_eq!(p.name(), "none");
    }

    #[test]
    fn request_body_includes_tools_and_calls() {
        let p = OpenAiProvider::new("k", "gpt-test").with_base_url("http://localhost:1/");
        let call = ToolCall {
            id: "call_1".into(),
            name: "execute_python".into(),
            arguments: "{\"code\":\"print(1)\"}".into(),
        };
        let messages = vec![
            Message::system("sys"),
            Message::assistant_calls("", vec![call.clone()]),
            Message::tool_result(&call, "1"),
        ];
        let tools = vec![Tool::new("execute_python", "run code", json!({"type": "object"}))];
        let body = p.build_request_body(&messages, Some(&tools));

        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["tools"][0]["function"]["name"], "execute_python");
        assert_eq!(body["messages"][1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(body["messages"][2]["role"], "tool");
        assert_eq!(body["messages"][2]["tool_call_id"], "call_1");
    }

    #[test]
    fn empty_tool_list_is_omitted() {
        let p = OpenAiProvider::new("k", "m");
        let body = p.build_request_body(&[Message::user("x")], Some(&[]));
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn parses_tool_call_response() {
        let body = r#"{
            "model": "gpt-test",
            "choices": [{"message": {"content": null, "tool_calls": [
                {"id": "c1", "type": "function", "function": {"name": "search", "arguments": "{\"query\":\"x\"}"}}
            ]}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2}
        }"#;
        let resp = parse_response(body).unwrap();
        assert!(resp.content.is_none());
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].parsed_arguments()["query"], "x");
        assert_eq!(resp.usage.unwrap().input_tokens, 10);
    }

    #[test]
    fn parse_rejects_empty_choices() {
        let err = parse_response(r#"{"model":"m","choices":[]}"#).unwrap_err();
        assert!(matches!(err, ProviderError::Parse(_)));
    }

    #[test]
    fn non_json_arguments_are_wrapped() {
        let call = ToolCall {
            id: "c".into(),
            name: "execute_python".into(),
            arguments: "print('hi')".into(),
        };
        assert_eq!(call.parsed_arguments()["input"], "print('hi')");
    }
}
