//! Cross-run failure memory: error signatures and the remediations that
//! resolved them.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::StoreError;

// ---------------------------------------------------------------------------
// Known patterns
// ---------------------------------------------------------------------------

struct KnownPattern {
    signature: &'static str,
    pattern: &'static str,
    solutions: &'static [&'static str],
}

const KNOWN_PATTERNS: &[KnownPattern] = &[
    KnownPattern {
        signature: "KeyError",
        pattern: r"KeyError: '(.+?)'",
        solutions: &[
            "Check if key exists: if 'key' in dict:",
            "Use .get() method: dict.get('key', default_value)",
            "Check column names: df.columns.tolist()",
        ],
    },
    KnownPattern {
        signature: "AttributeError_applymap",
        pattern: r"AttributeError.*applymap",
        solutions: &[
            "Replace df.applymap() with df.map() (pandas >= 2.1.0)",
            "Use df.apply(lambda col: col.map(func))",
        ],
    },
    KnownPattern {
        signature: "ModuleNotFoundError",
        pattern: r"ModuleNotFoundError: No module named '(.+?)'",
        solutions: &[
            "Install the missing package",
            "Check package name spelling",
            "Add it to requirements.txt",
        ],
    },
    KnownPattern {
        signature: "FileNotFoundError",
        pattern: r"FileNotFoundError.*'(.+?)'",
        solutions: &[
            "Check file path is correct",
            "Use an absolute path under the upload directory",
            "Verify the file was uploaded",
        ],
    },
    KnownPattern {
        signature: "ValueError_trailing_spaces",
        pattern: r"ValueError.*trailing",
        solutions: &[
            "Strip column names: df.columns = df.columns.str.strip()",
            "Strip whitespace in object columns before comparing",
        ],
    },
];

fn compiled_patterns() -> &'static [(Regex, &'static KnownPattern)] {
    static COMPILED: OnceLock<Vec<(Regex, &'static KnownPattern)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        KNOWN_PATTERNS
            .iter()
            .filter_map(|known| {
                match RegexBuilder::new(known.pattern).case_insensitive(true).build() {
                    Ok(re) => Some((re, known)),
                    Err(e) => {
                        warn!(signature = known.signature, error = %e, "skipping invalid error pattern");
                        None
                    }
                }
            })
            .collect()
    })
}

fn matching_pattern(error: &str) -> Option<&'static KnownPattern> {
    compiled_patterns()
        .iter()
        .find(|(re, _)| re.is_match(error))
        .map(|(_, known)| *known)
}

/// Stable signature for an error message.
///
/// Named patterns win; otherwise the last non-empty line, capped at 100
/// characters.
pub fn error_signature(error: &str) -> String {
    if let Some(known) = matching_pattern(error) {
        return known.signature.to_string();
    }
    let last = error
        .trim()
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("");
    truncate_chars(last.trim(), 100)
}

/// First `max` characters of `s`, on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationSource {
    PatternMatching,
    Learned,
}

/// Advice found for an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remediation {
    pub error_type: String,
    pub solutions: Vec<String>,
    pub source: RemediationSource,
    #[serde(default)]
    pub success_count: u64,
}

impl Remediation {
    /// Guidance block appended to a unit's instructions.
    pub fn guidance(&self) -> String {
        let mut lines = vec![
            String::new(),
            "ERROR PREVENTION GUIDANCE:".to_string(),
            format!("Similar error detected: {}", self.error_type),
            String::new(),
            "KNOWN SOLUTIONS:".to_string(),
        ];
        for (idx, sol) in self.solutions.iter().enumerate() {
            lines.push(format!("{}. {}", idx + 1, sol));
        }
        if self.success_count > 0 {
            lines.push(format!(
                "This solution worked {} times before",
                self.success_count
            ));
        }
        lines.join("\n")
    }
}

/// One stored signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub signature: String,
    pub error_example: String,
    pub solution: String,
    pub success_count: u64,
    pub last_used: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// FailureMemory
// ---------------------------------------------------------------------------

#[async_trait]
pub trait FailureMemory: Send + Sync {
    /// Remediation for `error`, from built-in patterns or learned solutions.
    async fn lookup(&self, error: &str) -> Result<Option<Remediation>, StoreError>;

    /// Upsert the solution for `error`'s signature.
    async fn store(&self, error: &str, solution: &str, success: bool) -> Result<(), StoreError>;

    /// Most useful records first: by success count, then recency.
    async fn recent(&self, limit: usize) -> Result<Vec<FailureRecord>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryFailureMemory {
    records: Mutex<HashMap<String, FailureRecord>>,
}

impl InMemoryFailureMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, FailureRecord>> {
        self.records.lock().unwrap_or_else(|e| {
            warn!("failure memory lock was poisoned, recovering");
            e.into_inner()
        })
    }
}

#[async_trait]
impl FailureMemory for InMemoryFailureMemory {
    async fn lookup(&self, error: &str) -> Result<Option<Remediation>, StoreError> {
        if let Some(known) = matching_pattern(error) {
            return Ok(Some(Remediation {
                error_type: known.signature.to_string(),
                solutions: known.solutions.iter().map(|s| s.to_string()).collect(),
                source: RemediationSource::PatternMatching,
                success_count: 0,
            }));
        }
        let signature = error_signature(error);
        Ok(self.records().get(&signature).map(|rec| Remediation {
            error_type: rec.signature.clone(),
            solutions: vec![rec.solution.clone()],
            source: RemediationSource::Learned,
            success_count: rec.success_count,
        }))
    }

    async fn store(&self, error: &str, solution: &str, success: bool) -> Result<(), StoreError> {
        let signature = error_signature(error);
        let mut records = self.records();
        let entry = records
            .entry(signature.clone())
            .or_insert_with(|| FailureRecord {
                signature: signature.clone(),
                error_example: String::new(),
                solution: String::new(),
                success_count: 0,
                last_used: Utc::now(),
            });
        entry.error_example = truncate_chars(error, 500);
        entry.solution = solution.to_string();
        entry.last_used = Utc::now();
        if success {
            entry.success_count += 1;
        }
        debug!(%signature, success, "stored failure signature");
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<FailureRecord>, StoreError> {
        let mut all: Vec<FailureRecord> = self.records().values().cloned().collect();
        all.sort_by(|a, b| {
            b.success_count
                .cmp(&a.success_count)
                .then(b.last_used.cmp(&a.last_used))
        });
        all.truncate(limit);
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_patterns_win() {
        assert_eq!(error_signature("Traceback\nKeyError: 'Revenue'"), "KeyError");
        assert_eq!(
            error_signature("AttributeError: 'DataFrame' object has no attribute 'applymap'"),
            "AttributeError_applymap"
        );
        assert_eq!(
            error_signature("modulenotfounderror: no module named 'plotly'"),
            "ModuleNotFoundError"
        );
        assert_eq!(
            error_signature("FileNotFoundError: [Errno 2] No such file: 'x.csv'"),
            "FileNotFoundError"
        );
        assert_eq!(
            error_signature("ValueError: column has trailing spaces"),
            "ValueError_trailing_spaces"
        );
    }

    #[test]
    fn fallback_is_last_line_capped() {
        let long = format!("first line\n{}\n\n", "x".repeat(250));
        let sig = error_signature(&long);
        assert_eq!(sig.len(), 100);
        assert!(sig.chars().all(|c| c == 'x'));
        assert_eq!(error_signature("boom"), "boom");
    }

    #[tokio::test]
    async fn lookup_prefers_builtin_patterns() {
        let mem = InMemoryFailureMemory::new();
        let rem = mem.lookup("KeyError: 'col'").await.unwrap().unwrap();
        assert_eq!(rem.source, RemediationSource::PatternMatching);
        assert_eq!(rem.solutions.len(), 3);
        assert!(rem.guidance().contains("KNOWN SOLUTIONS"));
    }

    #[tokio::test]
    async fn store_then_lookup_learned() {
        let mem = InMemoryFailureMemory::new();
        assert!(mem.lookup("RuntimeError: flaky api").await.unwrap().is_none());

        mem.store("RuntimeError: flaky api", "Strategy 'targeted_fix' worked", true)
            .await
            .unwrap();
        mem.store("RuntimeError: flaky api", "Strategy 'full_rewrite' worked", true)
            .await
            .unwrap();

        let rem = mem.lookup("RuntimeError: flaky api").await.unwrap().unwrap();
        assert_eq!(rem.source, RemediationSource::Learned);
        assert_eq!(rem.success_count, 2);
        assert_eq!(rem.solutions, vec!["Strategy 'full_rewrite' worked".to_string()]);
    }

    #[tokio::test]
    async fn failures_do_not_count_as_success() {
        let mem = InMemoryFailureMemory::new();
        mem.store("oops", "No solution found after all retries", false)
            .await
            .unwrap();
        let recent = mem.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].success_count, 0);
        assert_eq!(recent[0].signature, "oops");
    }
}
