//! Resilient unit invoker.
//!
//! Each attempt derives its instructions from the stored unit plus the
//! enhancement for that attempt's [`RetryStrategy`]; the unit itself is never
//! modified. Capabilities are provisioned per attempt and always released
//! before the result is judged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use wf_core::error_memory::error_signature;
use wf_core::store::credential_service_for;
use wf_core::types::TaskUnit;

use crate::capability::{ProvisionedCapability, Toolbox};
use crate::classifier::{OutputClassifier, Verdict};
use crate::context::EngineContext;
use crate::prompts::{self, UnitInput};
use crate::runner::RunnerError;
use crate::strategy::{AttemptRecord, RetryStrategy};

/// Error recorded when a response only describes the work.
pub const DESCRIPTION_ONLY: &str = "unit returned a description instead of execution";

/// Capability bound to every unit in addition to its declared requirements.
const IMPLICIT_CODE_CAPABILITY: &str = "code_executor";

/// Terminal result of one unit invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Succeeded {
        output: Value,
        attempts: u32,
        strategy: RetryStrategy,
        /// Failed attempts before the successful one.
        history: Vec<AttemptRecord>,
    },
    Failed {
        error: String,
        history: Vec<AttemptRecord>,
        /// Signature of the last error.
        signature: String,
    },
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Succeeded { .. })
    }

    pub fn history(&self) -> &[AttemptRecord] {
        match self {
            UnitOutcome::Succeeded { history, .. } | UnitOutcome::Failed { history, .. } => history,
        }
    }
}

pub struct UnitInvoker {
    ctx: Arc<EngineContext>,
    classifier: OutputClassifier,
}

impl UnitInvoker {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let classifier = OutputClassifier::new(ctx.upload_dir());
        Self { ctx, classifier }
    }

    /// Run `unit` until an attempt completes or the attempt budget is spent.
    /// `owner` scopes credential lookups.
    pub async fn invoke(&self, unit: &TaskUnit, input: &UnitInput, owner: &str) -> UnitOutcome {
        let engine = &self.ctx.config.engine;
        let max_attempts = engine.max_attempts.max(1);
        let started = Instant::now();
        let rendered = input.render();
        let mut history: Vec<AttemptRecord> = Vec::new();

        for attempt in 1..=max_attempts {
            let strategy = RetryStrategy::for_attempt(attempt);
            self.ctx.metrics.record_attempt(strategy.as_str());
            info!(unit_id = %unit.id, attempt, max_attempts, %strategy, "running unit attempt");

            let instructions = format!("{}{}", unit.instructions, self.enhancement(strategy, &history).await);
            let error = match self.attempt(unit, &instructions, &rendered, owner).await {
                Ok(output) => match self.classifier.classify(&output) {
                    Verdict::Completed => {
                        self.learn(strategy, &history).await;
                        self.ctx.metrics.record_unit("succeeded", started.elapsed().as_secs_f64());
                        info!(unit_id = %unit.id, attempt, %strategy, "unit completed");
                        return UnitOutcome::Succeeded {
                            output,
                            attempts: attempt,
                            strategy,
                            history,
                        };
                    }
                    Verdict::DescriptionOnly => DESCRIPTION_ONLY.to_string(),
                },
                Err(e) => e,
            };

            warn!(unit_id = %unit.id, attempt, %strategy, error = %error, "unit attempt failed");
            history.push(AttemptRecord::new(attempt, strategy, error));

            if attempt < max_attempts && engine.retry_pause_ms > 0 {
                tokio::time::sleep(Duration::from_millis(engine.retry_pause_ms)).await;
            }
        }

        let last_error = history.last().map(|r| r.error.clone()).unwrap_or_default();
        let signature = error_signature(&last_error);
        self.ctx.metrics.record_unit("failed", started.elapsed().as_secs_f64());
        warn!(unit_id = %unit.id, attempts = max_attempts, %signature, "unit exhausted retries");
        UnitOutcome::Failed {
            error: format!("Failed after {max_attempts} attempts. Last error: {last_error}"),
            history,
            signature,
        }
    }

    /// One attempt: bind capabilities, run, release, parse.
    async fn attempt(&self, unit: &TaskUnit, instructions: &str, input: &str, owner: &str) -> Result<Value, String> {
        let bound = self.bind(unit, owner).await;
        let toolbox = Toolbox::new(bound);

        let result = if toolbox.is_empty() {
            self.ctx.runner.run_direct(instructions, input).await
        } else {
            match self.ctx.runner.run_with_tools(instructions, input, &toolbox).await {
                Ok(text) => Ok(text),
                Err(e) => {
                    warn!(unit_id = %unit.id, error = %e, "tool mode failed, retrying without tools");
                    self.ctx.runner.run_direct(instructions, input).await
                }
            }
        };

        for capability in toolbox.into_inner() {
            self.ctx.registry.release(capability).await;
        }

        result
            .map(|text| prompts::parse_output(&text))
            .map_err(|e: RunnerError| e.to_string())
    }

    /// Provision the implicit sandbox and every declared requirement.
    /// Failures and missing credentials leave the capability out.
    async fn bind(&self, unit: &TaskUnit, owner: &str) -> Vec<ProvisionedCapability> {
        let registry = &self.ctx.registry;
        let mut bound = Vec::with_capacity(unit.requirements.len() + 1);

        match registry
            .provision(IMPLICIT_CODE_CAPABILITY, &unit.id, "execute unit code")
            .await
        {
            Ok(cap) => bound.push(cap),
            Err(e) => warn!(unit_id = %unit.id, error = %e, "code sandbox unavailable"),
        }

        for req in &unit.requirements {
            let cap = match registry.provision_requirement(req, &unit.id).await {
                Ok(cap) => cap,
                Err(e) => {
                    warn!(unit_id = %unit.id, capability = %req.name, error = %e, "capability omitted");
                    continue;
                }
            };
            if self.has_credentials(&req.name, owner).await {
                bound.push(cap);
            } else {
                warn!(unit_id = %unit.id, capability = %req.name, "credentials missing, capability omitted");
                registry.release(cap).await;
            }
        }
        debug!(unit_id = %unit.id, bound = bound.len(), "capabilities bound");
        bound
    }

    async fn has_credentials(&self, capability: &str, owner: &str) -> bool {
        let Some(service) = credential_service_for(capability) else {
            return true;
        };
        match self.ctx.credentials.get(owner, service).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(capability, service, error = %e, "credential lookup failed");
                false
            }
        }
    }

    /// Text appended to the unit's instructions for `strategy`.
    async fn enhancement(&self, strategy: RetryStrategy, history: &[AttemptRecord]) -> String {
        let Some(last) = history.last() else {
            return String::new();
        };
        let last_error = last.error.as_str();

        let mut text = match strategy {
            RetryStrategy::Baseline => String::new(),
            RetryStrategy::TargetedFix => prompts::targeted_fix(last_error, self.ctx.upload_dir()),
            RetryStrategy::ExternallyInformed => self.externally_informed(last_error).await,
            RetryStrategy::FullRewrite => prompts::full_rewrite(history, self.ctx.upload_dir()),
            RetryStrategy::AlternativeApproach => prompts::alternative_approach(history),
        };

        if self.ctx.config.engine.enable_error_learning {
            match self.ctx.failure_memory.lookup(last_error).await {
                Ok(Some(remediation)) => text.push_str(&remediation.guidance()),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failure memory lookup failed"),
            }
        }
        text
    }

    async fn externally_informed(&self, last_error: &str) -> String {
        let Some(ref search) = self.ctx.search else {
            return format!("\n\n{}\n", prompts::SEARCH_UNAVAILABLE);
        };
        let query = prompts::search_query(last_error);
        match search.search(&query, 3).await {
            Ok(results) if !results.is_empty() => {
                prompts::externally_informed(&prompts::format_search(&results), last_error)
            }
            Ok(_) => {
                debug!(%query, "knowledge search returned nothing");
                String::new()
            }
            Err(e) => {
                warn!(%query, error = %e, "knowledge search failed");
                String::new()
            }
        }
    }

    /// Remember what fixed the previous error.
    async fn learn(&self, strategy: RetryStrategy, history: &[AttemptRecord]) {
        if !self.ctx.config.engine.enable_error_learning {
            return;
        }
        let Some(last) = history.last() else {
            return;
        };
        let solution = format!("Strategy '{strategy}' worked");
        if let Err(e) = self.ctx.failure_memory.store(&last.error, &solution, true).await {
            warn!(error = %e, "failed to store learned solution");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
