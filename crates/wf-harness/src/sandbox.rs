use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use wf_core::config::Config;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to prepare script: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn {interpreter}: {source}")]
    Spawn {
        interpreter: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SandboxError>;

// ---------------------------------------------------------------------------
// SandboxOutput
// ---------------------------------------------------------------------------

/// How one script run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxOutput {
    Success { stdout: String },
    Failure { stderr: String, exit_code: Option<i32> },
    TimedOut { limit_secs: u64 },
}

impl SandboxOutput {
    pub fn is_success(&self) -> bool {
        matches!(self, SandboxOutput::Success { .. })
    }

    /// Text handed back to the model as the tool result.
    pub fn render(&self) -> String {
        match self {
            SandboxOutput::Success { stdout } if stdout.is_empty() => {
                "Code executed successfully (no output)".to_string()
            }
            SandboxOutput::Success { stdout } => format!("Code executed successfully:\n{stdout}"),
            SandboxOutput::Failure { stderr, .. } => format!("Error executing code:\n{stderr}"),
            SandboxOutput::TimedOut { limit_secs } => {
                format!("Error: Code execution timed out ({limit_secs}s limit)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CodeSandbox
// ---------------------------------------------------------------------------

/// Runs Python scripts in a working directory under a wall-clock limit.
///
/// Each run writes a uniquely named script so concurrent units sharing the
/// same directory never overwrite each other. The work dir is also put on
/// `PYTHONPATH`, and the child is killed if the limit expires.
#[derive(Debug, Clone)]
pub struct CodeSandbox {
    python: String,
    work_dir: PathBuf,
    timeout: Duration,
}

impl CodeSandbox {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            python: "python3".to_string(),
            work_dir: work_dir.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.sandbox_work_dir())
            .with_python(cfg.sandbox.python.clone())
            .with_timeout(Duration::from_secs(cfg.sandbox.timeout_secs))
    }

    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub async fn run(&self, code: &str) -> Result<SandboxOutput> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let script = self
            .work_dir
            .join(format!("temp_script_{}.py", Uuid::new_v4().simple()));
        tokio::fs::write(&script, strip_fences(code)).await?;

        let result = self.run_script(&script).await;

        if let Err(e) = tokio::fs::remove_file(&script).await {
            warn!(script = %script.display(), error = %e, "failed to remove sandbox script");
        }
        result
    }

    async fn run_script(&self, script: &Path) -> Result<SandboxOutput> {
        let child = Command::new(&self.python)
            .arg(script)
            .current_dir(&self.work_dir)
            .env("PYTHONPATH", &self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                interpreter: self.python.clone(),
                source,
            })?;

        // Dropping the future on timeout drops the child, which kills it.
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                debug!(status = ?output.status.code(), "sandbox script finished");
                if output.status.success() {
                    Ok(SandboxOutput::Success {
                        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    })
                } else {
                    Ok(SandboxOutput::Failure {
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                        exit_code: output.status.code(),
                    })
                }
            }
            Err(_) => {
                warn!(limit_secs = self.timeout.as_secs(), "sandbox script timed out");
                Ok(SandboxOutput::TimedOut {
                    limit_secs: self.timeout.as_secs(),
                })
            }
        }
    }
}

/// Drop a surrounding markdown code fence, if any.
pub fn strip_fences(code: &str) -> String {
    let trimmed = code.trim();
    if !trimmed.starts_with("```") {
        return code.to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().collect();
    lines.remove(0);
    if lines.last().is_some_and(|l| l.trim() == "```") {
        lines.pop();
    }
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_matches_tool_texts() {
        assert_eq!(
            SandboxOutput::Success { stdout: String::new() }.render(),
            "Code executed successfully (no output)"
        );
        assert_eq!(
            SandboxOutput::Success { stdout: "42\n".into() }.render(),
            "Code executed successfully:\n42\n"
        );
        assert_eq!(
            SandboxOutput::Failure {
                stderr: "boom".into(),
                exit_code: Some(1)
            }
            .render(),
            "Error executing code:\nboom"
        );
        assert_eq!(
            SandboxOutput::TimedOut { limit_secs: 30 }.render(),
            "Error: Code execution timed out (30s limit)"
        );
    }

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_fences("```python\nprint(1)\n```"), "print(1)");
        assert_eq!(strip_fences("```\nx = 1\ny = 2\n```\n"), "x = 1\ny = 2");
        assert_eq!(strip_fences("print(1)"), "print(1)");
    }

    #[tokio::test]
    async fn missing_interpreter_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = CodeSandbox::new(dir.path()).with_python("definitely-not-a-python-binary");
        let err = sandbox.run("print(1)").await.unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }));
        // The script is cleaned up even when the spawn fails.
        let leftover = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftover, 0);
    }
}
