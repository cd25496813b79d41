//! Executes one attempt's instructions, with or without tools.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use wf_harness::provider::{LlmProvider, Message, ProviderError};

use crate::capability::Toolbox;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("model returned no content")]
    NoContent,

    #[error("tool loop did not finish within {turns} turns")]
    TurnLimit { turns: usize },
}

// ---------------------------------------------------------------------------
// UnitRunner
// ---------------------------------------------------------------------------

#[async_trait]
pub trait UnitRunner: Send + Sync {
    /// Run with the toolbox's tools bound; the model may call them any
    /// number of times before answering.
    async fn run_with_tools(&self, instructions: &str, input: &str, tools: &Toolbox) -> Result<String, RunnerError>;

    /// Run the instructions directly, without tool access.
    async fn run_direct(&self, instructions: &str, input: &str) -> Result<String, RunnerError>;
}

/// Runner backed by a chat provider with tool calling.
pub struct LlmUnitRunner {
    provider: Arc<dyn LlmProvider>,
    max_tool_turns: usize,
}

impl LlmUnitRunner {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            max_tool_turns: 8,
        }
    }

    pub fn with_max_tool_turns(mut self, turns: usize) -> Self {
        self.max_tool_turns = turns.max(1);
        self
    }
}

#[async_trait]
impl UnitRunner for LlmUnitRunner {
    async fn run_with_tools(&self, instructions: &str, input: &str, tools: &Toolbox) -> Result<String, RunnerError> {
        let definitions = tools.definitions();
        let mut messages = vec![Message::system(instructions), Message::user(input)];

        for turn in 0..self.max_tool_turns {
            let resp = self
                .provider
                .chat(messages.clone(), Some(definitions.clone()))
                .await?;

            if resp.tool_calls.is_empty() {
                return resp.content.ok_or(RunnerError::NoContent);
            }

            debug!(turn, calls = resp.tool_calls.len(), provider = self.provider.name(), "tool calls requested");
            messages.push(Message::assistant_calls(
                resp.content.unwrap_or_default(),
                resp.tool_calls.clone(),
            ));
            for call in &resp.tool_calls {
                let result = tools.call(&call.name, &call.parsed_arguments()).await;
                if result.starts_with("Error:") {
                    warn!(tool = %call.name, "tool call failed");
                }
                messages.push(Message::tool_result(call, result));
            }
        }

        Err(RunnerError::TurnLimit {
            turns: self.max_tool_turns,
        })
    }

    async fn run_direct(&self, instructions: &str, input: &str) -> Result<String, RunnerError> {
        let messages = vec![Message::system(instructions), Message::user(input)];
        let resp = self.provider.chat(messages, None).await?;
        resp.content.ok_or(RunnerError::NoContent)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::testing::EchoCapability;
    use crate::capability::ProvisionedCapability;
    use std::sync::Mutex;
    use wf_harness::provider::{Response, Role, Tool, ToolCall};

    /// Replays scripted responses and records every request.
    struct ScriptedProvider {
        script: Mutex<Vec<Response>>,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedProvider {
        fn new(mut script: Vec<Response>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(&self, messages: Vec<Message>, _tools: Option<Vec<Tool>>) -> Result<Response, ProviderError> {
            self.seen.lock().unwrap().push(messages);
            self.script
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| ProviderError::Other("script exhausted".into()))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn text(content: &str) -> Response {
        Response {
            content: Some(content.into()),
            tool_calls: vec![],
            model: "m".into(),
            usage: None,
        }
    }

    fn calls(name: &str) -> Response {
        Response {
            content: None,
            tool_calls: vec![ToolCall {
                id: "call_1".into(),
                name: name.into(),
                arguments: "{\"q\":1}".into(),
            }],
            model: "m".into(),
            usage: None,
        }
    }

    fn toolbox() -> Toolbox {
        Toolbox::new(vec![ProvisionedCapability::new(
            "echo",
            Arc::new(EchoCapability {
                name: "echo".into(),
                tool: "ping".into(),
            }),
        )])
    }

    #[tokio::test]
    async fn tool_results_are_fed_back() {
        let provider = Arc::new(ScriptedProvider::new(vec![calls("ping"), text("✅ done")]));
        let runner = LlmUnitRunner::new(provider.clone());
        let out = runner.run_with_tools("sys", "task", &toolbox()).await.unwrap();
        assert_eq!(out, "✅ done");

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let second = &seen[1];
        assert_eq!(second.len(), 4);
        assert_eq!(second[2].role, Role::Assistant);
        assert_eq!(second[3].role, Role::Tool);
        assert_eq!(second[3].content, "echo:ping:{\"q\":1}");
        assert_eq!(second[3].tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn turn_limit_is_enforced() {
        let provider = Arc::new(ScriptedProvider::new(vec![calls("ping"), calls("ping"), calls("ping")]));
        let runner = LlmUnitRunner::new(provider).with_max_tool_turns(2);
        let err = runner.run_with_tools("sys", "task", &toolbox()).await.unwrap_err();
        assert!(matches!(err, RunnerError::TurnLimit { turns: 2 }));
    }

    #[tokio::test]
    async fn direct_mode_sends_system_and_user() {
        let provider = Arc::new(ScriptedProvider::new(vec![text("answer")]));
        let runner = LlmUnitRunner::new(provider.clone());
        assert_eq!(runner.run_direct("be terse", "2+2").await.unwrap(), "answer");
        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0][0].content, "be terse");
        assert_eq!(seen[0][1].role, Role::User);
    }
}
