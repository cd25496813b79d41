use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use wf_core::types::CapabilityCategory;
use wf_harness::provider::Tool;
use wf_harness::sandbox::CodeSandbox;

use super::{str_arg, Capability, CapabilityError};

pub const EXECUTE_PYTHON: &str = "execute_python";

/// Python execution in the shared sandbox directory.
#[derive(Debug, Clone)]
pub struct CodeCapability {
    sandbox: CodeSandbox,
}

impl CodeCapability {
    pub fn new(sandbox: CodeSandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Capability for CodeCapability {
    fn name(&self) -> &str {
        "code_executor"
    }

    fn category(&self) -> CapabilityCategory {
        CapabilityCategory::CodeExecution
    }

    fn tools(&self) -> Vec<Tool> {
        vec![Tool::new(
            EXECUTE_PYTHON,
            format!(
                "Execute Python code and return its output. Files are read from and written to {}.",
                self.sandbox.work_dir().display()
            ),
            json!({
                "type": "object",
                "properties": {
                    "code": {"type": "string", "description": "Complete Python script to run"}
                },
                "required": ["code"]
            }),
        )]
    }

    async fn call(&self, tool: &str, args: &Value) -> Result<String, CapabilityError> {
        if tool != EXECUTE_PYTHON {
            return Err(CapabilityError::UnknownTool {
                capability: self.name().to_string(),
                tool: tool.to_string(),
            });
        }
        let code = str_arg(args, tool, "code")?;
        let output = self
            .sandbox
            .run(code)
            .await
            .map_err(|e| CapabilityError::Backend(e.to_string()))?;
        debug!(success = output.is_success(), "sandbox run finished");
        Ok(output.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_missing_code_and_unknown_tool() {
        let cap = CodeCapability::new(CodeSandbox::new(std::env::temp_dir()));
        let err = cap.call(EXECUTE_PYTHON, &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("missing 'code'"));

        let err = cap.call("rm_rf", &json!({"code": "x"})).await.unwrap_err();
        assert!(matches!(err, CapabilityError::UnknownTool { .. }));
        assert_eq!(cap.tools()[0].name, EXECUTE_PYTHON);
    }
}
