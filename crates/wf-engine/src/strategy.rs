use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remediation tactic applied on one attempt, chosen by attempt index alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Baseline,
    TargetedFix,
    ExternallyInformed,
    FullRewrite,
    AlternativeApproach,
}

impl RetryStrategy {
    pub const ESCALATION: [RetryStrategy; 5] = [
        RetryStrategy::Baseline,
        RetryStrategy::TargetedFix,
        RetryStrategy::ExternallyInformed,
        RetryStrategy::FullRewrite,
        RetryStrategy::AlternativeApproach,
    ];

    /// Strategy for a 1-based attempt number. Attempts past the fifth keep
    /// using the alternative approach.
    pub fn for_attempt(attempt: u32) -> Self {
        let idx = attempt.saturating_sub(1) as usize;
        Self::ESCALATION[idx.min(Self::ESCALATION.len() - 1)]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::Baseline => "baseline",
            RetryStrategy::TargetedFix => "targeted_fix",
            RetryStrategy::ExternallyInformed => "externally_informed",
            RetryStrategy::FullRewrite => "full_rewrite",
            RetryStrategy::AlternativeApproach => "alternative_approach",
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed attempt in a unit's error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub strategy: RetryStrategy,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn new(attempt: u32, strategy: RetryStrategy, error: impl Into<String>) -> Self {
        Self {
            attempt,
            strategy,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_order() {
        let names: Vec<&str> = (1..=5).map(|a| RetryStrategy::for_attempt(a).as_str()).collect();
        assert_eq!(
            names,
            ["baseline", "targeted_fix", "externally_informed", "full_rewrite", "alternative_approach"]
        );
    }

    #[test]
    fn attempts_past_five_stay_alternative() {
        assert_eq!(RetryStrategy::for_attempt(9), RetryStrategy::AlternativeApproach);
        assert_eq!(RetryStrategy::for_attempt(0), RetryStrategy::Baseline);
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&RetryStrategy::FullRewrite).unwrap();
        assert_eq!(json, "\"full_rewrite\"");
    }
}
