//! Text handed to the unit runner: per-attempt instruction enhancements, the
//! assembled unit input, and parsing of what comes back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use wf_core::error_memory::truncate_chars;
use wf_core::types::FileRef;
use wf_harness::knowledge::SearchResults;

use crate::strategy::AttemptRecord;

/// Note appended when no knowledge search is configured.
pub const SEARCH_UNAVAILABLE: &str =
    "Web search unavailable (no Tavily API key). Add a Tavily key to the credential store.";

// ---------------------------------------------------------------------------
// Enhancements
// ---------------------------------------------------------------------------

pub fn targeted_fix(last_error: &str, upload_dir: &str) -> String {
    format!(
        "\n\nPREVIOUS ATTEMPT FAILED\n\
         Error: {}\n\n\
         COMMON FIXES TO TRY:\n\
         1. Check all imports are correct\n\
         2. Verify file paths are absolute ({upload_dir}/...)\n\
         3. Ensure variables are defined before use\n\
         4. Check for syntax errors\n\
         5. Validate function calls and parameters\n\n\
         FIX THE ISSUE AND TRY AGAIN:\n",
        truncate_chars(last_error, 300)
    )
}

pub fn externally_informed(solution: &str, last_error: &str) -> String {
    format!(
        "\n\nWEB SEARCH SOLUTION:\n\n\
         {solution}\n\n\
         PREVIOUS ERROR:\n\
         {}\n\n\
         APPLY THE WEB SEARCH SOLUTION TO FIX THIS ERROR:\n",
        truncate_chars(last_error, 300)
    )
}

pub fn full_rewrite(history: &[AttemptRecord], upload_dir: &str) -> String {
    format!(
        "\n\nCOMPLETE REWRITE REQUIRED\n\n\
         All previous attempts failed. Start from scratch with a fresh approach.\n\n\
         ERRORS TO AVOID:\n\
         {}\n\n\
         CRITICAL REQUIREMENTS:\n\
         1. Write COMPLETE working code (not partial)\n\
         2. Include ALL imports at the top\n\
         3. Use ABSOLUTE paths: {upload_dir}/filename\n\
         4. Add proper error handling\n\
         5. Test each step\n\
         6. Return ACTUAL results (not descriptions)\n\n\
         START FRESH - WRITE THE COMPLETE SOLUTION:\n",
        summarize_errors(history)
    )
}

pub fn alternative_approach(history: &[AttemptRecord]) -> String {
    format!(
        "\n\nALTERNATIVE APPROACH REQUIRED\n\n\
         All previous methods failed. Use a COMPLETELY DIFFERENT approach.\n\n\
         FAILED APPROACHES:\n\
         {}\n\n\
         NEW STRATEGY OPTIONS:\n\
         1. Use different library/tool if possible\n\
         2. Break task into smaller steps\n\
         3. Simplify the approach\n\
         4. Use alternative file formats\n\
         5. Try different vector DB or method\n\n\
         IMPLEMENT A COMPLETELY DIFFERENT SOLUTION:\n",
        summarize_errors(history)
    )
}

/// One line per failed attempt.
pub fn summarize_errors(history: &[AttemptRecord]) -> String {
    if history.is_empty() {
        return "No previous errors".to_string();
    }
    history
        .iter()
        .map(|rec| {
            format!(
                "• Attempt {} ({}): {}",
                rec.attempt,
                rec.strategy,
                truncate_chars(&rec.error, 150).replace('\n', " ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Knowledge search
// ---------------------------------------------------------------------------

/// Query used to look up a fix: the error type, or the head of the message.
pub fn search_query(error: &str) -> String {
    let error_type = match error.split_once(':') {
        Some((head, _)) => head.to_string(),
        None => truncate_chars(error, 100),
    };
    format!("python {} solution fix", error_type.trim())
}

pub fn format_search(results: &SearchResults) -> String {
    let mut parts = Vec::new();
    if let Some(answer) = results.answer.as_deref().filter(|a| !a.is_empty()) {
        parts.push(format!("DIRECT ANSWER:\n{answer}\n"));
    }
    parts.push("TOP SOLUTIONS:".to_string());
    for (idx, hit) in results.results.iter().take(3).enumerate() {
        parts.push(format!("\n{}. {}", idx + 1, hit.title));
        parts.push(format!("   Source: {}", hit.url));
        parts.push(format!("   {}...", truncate_chars(&hit.content, 250)));
    }
    parts.join("\n")
}

// ---------------------------------------------------------------------------
// Unit input
// ---------------------------------------------------------------------------

/// Resolved input for one unit: external files, its task, known error
/// patterns and upstream outputs in dependency order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitInput {
    pub files: Vec<FileRef>,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_guidance: Option<String>,
    #[serde(default)]
    pub upstream: Vec<(String, Value)>,
}

impl UnitInput {
    pub fn upstream(&self, unit_id: &str) -> Option<&Value> {
        self.upstream.iter().find(|(id, _)| id == unit_id).map(|(_, v)| v)
    }

    /// Plain-text rendering sent as the user message.
    pub fn render(&self) -> String {
        let task = if self.task.is_empty() { "Execute task" } else { &self.task };
        let mut parts = vec![format!("TASK: {task}")];

        if !self.files.is_empty() {
            parts.push("\nAVAILABLE FILES:".to_string());
            for file in &self.files {
                parts.push(format!("\n  File: {}", file.filename));
                parts.push(format!("    Path: {}", file.path));
                parts.push(format!("    Type: {}", file.file_type));
            }
        }

        for (unit_id, value) in &self.upstream {
            parts.push(format!("\nINPUT FROM {}:", unit_id.to_uppercase()));
            parts.push(match value {
                Value::String(s) => s.clone(),
                Value::Object(_) | Value::Array(_) => {
                    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
                }
                other => other.to_string(),
            });
        }

        if let Some(ref guidance) = self.error_guidance {
            parts.push(guidance.clone());
        }
        parts.join("\n")
    }
}

/// Known-error block built from the run's failure-signature map.
pub fn error_guidance(error_memory: &serde_json::Map<String, Value>) -> Option<String> {
    if error_memory.is_empty() {
        return None;
    }
    let mut out = String::from("\n\nKNOWN ERROR PATTERNS (avoid these):\n");
    for (sig, info) in error_memory {
        let error = info.get("error").and_then(Value::as_str).unwrap_or_default();
        out.push_str(&format!("- {sig}: {}\n", truncate_chars(error, 100)));
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

/// Structured value when the output is JSON or holds a fenced json block,
/// otherwise the raw text.
pub fn parse_output(output: &str) -> Value {
    let trimmed = output.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str(trimmed) {
            return v;
        }
    }
    if let Some(start) = trimmed.find("```json") {
        let body = &trimmed[start + "```json".len()..];
        if let Some(end) = body.find("```") {
            if let Ok(v) = serde_json::from_str(body[..end].trim()) {
                return v;
            }
        }
    }
    Value::String(output.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
