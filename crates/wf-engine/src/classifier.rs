//! Decides whether a unit actually did its work or only described it.

use serde_json::Value;

const PLAN_PHRASES: &[&str] = &[
    "here's what you should do",
    "you should",
    "steps to follow",
    "you need to",
    "first you would",
    "the process involves",
    "here's how to",
    "the steps are",
];

const COMPLETION_SIGNALS: &[&str] = &[
    "indexed",
    "created",
    "deployed",
    "processed",
    "generated",
    "saved",
    "completed",
    "✅",
    "success",
    ".png",
    ".pdf",
    ".docx",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Completed,
    /// Planning language present, or no sign of a concrete result.
    DescriptionOnly,
}

#[derive(Debug, Clone)]
pub struct OutputClassifier {
    upload_dir: String,
}

impl OutputClassifier {
    /// `upload_dir` counts as a completion signal: mentioning a path under
    /// it means an artifact was written.
    pub fn new(upload_dir: impl Into<String>) -> Self {
        Self {
            upload_dir: upload_dir.into().to_lowercase(),
        }
    }

    pub fn classify(&self, output: &Value) -> Verdict {
        let text = match output {
            Value::String(s) => s.to_lowercase(),
            other => other.to_string().to_lowercase(),
        };

        let planning = PLAN_PHRASES.iter().any(|p| text.contains(p));
        let completed = COMPLETION_SIGNALS.iter().any(|s| text.contains(s))
            || (!self.upload_dir.is_empty() && text.contains(&self.upload_dir));

        if completed && !planning {
            Verdict::Completed
        } else {
            Verdict::DescriptionOnly
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classifier() -> OutputClassifier {
        OutputClassifier::new("/data/uploads")
    }

    #[test]
    fn planning_language_is_not_completion() {
        let c = classifier();
        let out = json!("To do this, you should load the CSV. The steps are: read, group, plot.");
        assert_eq!(c.classify(&out), Verdict::DescriptionOnly);
    }

    #[test]
    fn planning_wins_over_signals() {
        let out = json!("Here's how to do it: once the chart is generated you need to save it.");
        assert_eq!(classifier().classify(&out), Verdict::DescriptionOnly);
    }

    #[test]
    fn signals_mark_completion() {
        let c = classifier();
        assert_eq!(c.classify(&json!("Indexed 42 chunks into sales_idx")), Verdict::Completed);
        assert_eq!(c.classify(&json!("✅ Report ready")), Verdict::Completed);
        assert_eq!(
            c.classify(&json!({"report": "/DATA/UPLOADS/q3.md"})),
            Verdict::Completed
        );
    }

    #[test]
    fn bare_answers_without_signals_fail() {
        assert_eq!(classifier().classify(&json!({"total": 5})), Verdict::DescriptionOnly);
        assert_eq!(classifier().classify(&json!("")), Verdict::DescriptionOnly);
    }
}
