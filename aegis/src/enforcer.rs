//! Evaluation orchestration.
//!
//! The enforcer resolves a constitution, evaluates its rules in dependency
//! order, classifies failures by enforcement action and records them. Rules
//! within one call are evaluated strictly one after another.
//!
//! `validate` never fails. `enforce` raises [`EnforcementError`] when the
//! decision did not pass; everything else degrades to logs and result fields.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{AegisConfig, ValidateOptions};
use crate::context::EvalContext;
use crate::decision::{AggregateDecision, Decision, OverrideOutcome, OverrideResult, RuleViolation};
use crate::error::EnforcementError;
use crate::loader::RuleLoader;
use crate::recorder::ViolationRecorder;
use crate::store::GovernanceStore;
use crate::types::{
    Constitution, EnforcementAction, EnforcementMode, RuleStatOutcome, ValidationResult,
};
use crate::validators::{Validator, ValidatorRegistry};

/// Policy enforcement engine.
pub struct Enforcer {
    loader: RuleLoader,
    validators: ValidatorRegistry,
    recorder: ViolationRecorder,
    store: Option<Arc<dyn GovernanceStore>>,
    config: AegisConfig,
}

impl Enforcer {
    /// Create an enforcer over a store with default configuration.
    pub fn new(store: Arc<dyn GovernanceStore>) -> Self {
        Self::with_config(Some(store), AegisConfig::default())
    }

    /// Create an enforcer from configuration. Without a store, rules come
    /// from the fallback snapshot and nothing is recorded.
    pub fn with_config(store: Option<Arc<dyn GovernanceStore>>, config: AegisConfig) -> Self {
        Self {
            loader: RuleLoader::with_config(store.clone(), &config),
            validators: ValidatorRegistry::with_defaults(store.clone()),
            recorder: ViolationRecorder::with_config(store.clone(), &config),
            store,
            config,
        }
    }

    /// Builder: replace the rule loader.
    pub fn with_loader(mut self, loader: RuleLoader) -> Self {
        self.loader = loader;
        self
    }

    /// Builder: register a validator, replacing the built-in one for its type.
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.register(validator);
        self
    }

    pub fn loader(&self) -> &RuleLoader {
        &self.loader
    }

    pub fn recorder(&self) -> &ViolationRecorder {
        &self.recorder
    }

    pub fn config(&self) -> &AegisConfig {
        &self.config
    }

    /// Per-call options from the configured defaults.
    pub fn default_options(&self) -> ValidateOptions {
        self.config.default_options()
    }

    /// Evaluate one constitution against a context.
    pub async fn validate(
        &self,
        constitution_code: &str,
        ctx: &EvalContext,
        options: ValidateOptions,
    ) -> Decision {
        let Some(constitution) = self.loader.get_constitution(constitution_code).await else {
            warn!(constitution = %constitution_code, "Constitution not found, skipping");
            return Decision::skipped(constitution_code, None, "Constitution not found");
        };
        self.evaluate(&constitution, ctx, options).await
    }

    /// Evaluate one constitution and fail if it did not pass.
    pub async fn enforce(
        &self,
        constitution_code: &str,
        ctx: &EvalContext,
        options: ValidateOptions,
    ) -> Result<Decision, EnforcementError> {
        let decision = self.validate(constitution_code, ctx, options).await;

        if !decision.passed {
            return Err(EnforcementError::new(
                vec![decision.constitution_code.clone()],
                decision.violations.clone(),
                vec![decision.decision_id.clone()],
            ));
        }
        log_warnings(&decision.warnings);
        Ok(decision)
    }

    /// Evaluate every enforced constitution. Disabled ones are skipped.
    pub async fn validate_all(&self, ctx: &EvalContext, options: ValidateOptions) -> AggregateDecision {
        let constitutions = self.loader.load_constitutions().await;

        let mut aggregate = AggregateDecision {
            passed: true,
            decisions: Vec::new(),
            violations: Vec::new(),
            warnings: Vec::new(),
            constitutions_checked: Vec::new(),
            constitutions_skipped: Vec::new(),
            timestamp: chrono::Utc::now(),
        };

        for constitution in &constitutions {
            if !constitution.is_enforced() {
                debug!(constitution = %constitution.code, "Constitution disabled, skipping");
                aggregate.constitutions_skipped.push(constitution.code.clone());
                continue;
            }

            let decision = self.evaluate(constitution, ctx, options).await;
            aggregate.constitutions_checked.push(constitution.code.clone());
            aggregate.violations.extend(decision.violations.iter().cloned());
            aggregate.warnings.extend(decision.warnings.iter().cloned());
            aggregate.decisions.push(decision);
        }

        aggregate.passed = aggregate.violations.is_empty();
        aggregate
    }

    /// Evaluate every enforced constitution and fail once if any did not pass.
    pub async fn enforce_all(
        &self,
        ctx: &EvalContext,
        options: ValidateOptions,
    ) -> Result<AggregateDecision, EnforcementError> {
        let aggregate = self.validate_all(ctx, options).await;

        if !aggregate.passed {
            let failed: Vec<&Decision> = aggregate.decisions.iter().filter(|d| !d.passed).collect();
            return Err(EnforcementError::new(
                failed.iter().map(|d| d.constitution_code.clone()).collect(),
                aggregate.violations.clone(),
                failed.iter().map(|d| d.decision_id.clone()).collect(),
            ));
        }
        log_warnings(&aggregate.warnings);
        Ok(aggregate)
    }

    /// Whether a human may override every violation in the list. A single
    /// hard `BLOCK` makes the whole set non-overridable.
    pub fn can_override(violations: &[RuleViolation]) -> bool {
        !violations
            .iter()
            .any(|v| v.enforcement_action == EnforcementAction::Block)
    }

    /// Override recorded violations.
    ///
    /// A short justification rejects the whole request before any write.
    /// Otherwise each id is attempted and its outcome reported separately.
    pub async fn override_violations(
        &self,
        violation_ids: &[String],
        justification: &str,
        actor: &str,
    ) -> OverrideOutcome {
        let min = self.recorder.min_justification_len();
        if justification.chars().count() < min {
            return OverrideOutcome::rejected(format!(
                "Justification must be at least {} characters",
                min
            ));
        }
        if self.store.is_none() {
            return OverrideOutcome::rejected("No governance store configured");
        }

        let mut results = Vec::with_capacity(violation_ids.len());
        for id in violation_ids {
            match self.recorder.override_violation(id, justification, actor).await {
                Ok(_) => results.push(OverrideResult {
                    violation_id: id.clone(),
                    success: true,
                    error: None,
                }),
                Err(e) => {
                    warn!(violation_id = %id, error = %e, "Override failed");
                    results.push(OverrideResult {
                        violation_id: id.clone(),
                        success: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let overridden_count = results.iter().filter(|r| r.success).count();
        info!(
            actor = %actor,
            requested = violation_ids.len(),
            overridden = overridden_count,
            "Override request processed"
        );

        OverrideOutcome {
            success: true,
            overridden_count,
            results,
            error: None,
        }
    }

    async fn evaluate(
        &self,
        constitution: &Constitution,
        ctx: &EvalContext,
        options: ValidateOptions,
    ) -> Decision {
        let mode = constitution.enforcement_mode;
        if mode == EnforcementMode::Disabled {
            debug!(constitution = %constitution.code, "Constitution disabled, skipping");
            return Decision::skipped(&constitution.code, Some(mode), "Constitution disabled");
        }

        let ordered = self.loader.load_rules_with_dependencies(&constitution.code).await;
        let mut decision = Decision::new(&constitution.code, Some(mode));
        decision.cycle_warnings = ordered.cycles;

        for rule in &ordered.rules {
            let result = self.validators.evaluate(rule, ctx).await;
            decision.rules_evaluated += 1;

            if options.increment_stats {
                self.spawn_stats_increment(&rule.id, &result);
            }
            if result.passed {
                continue;
            }

            let mut violation = RuleViolation::from_result(rule, &constitution.code, &result);
            if options.record_violations {
                let outcome = self
                    .recorder
                    .record_violation(rule, &result, ctx, Some(&decision.decision_id))
                    .await;
                violation.violation_id = outcome.violation_id;
            }

            match rule.enforcement_action {
                EnforcementAction::Block | EnforcementAction::BlockOverridable => {
                    if mode == EnforcementMode::Advisory {
                        decision.warnings.push(violation);
                    } else {
                        decision.violations.push(violation);
                    }
                }
                EnforcementAction::WarnAndLog => decision.warnings.push(violation),
                EnforcementAction::AuditOnly => decision.audit_entries.push(violation),
                EnforcementAction::TriggerSd => decision.triggers.push(violation),
                EnforcementAction::Unknown => warn!(
                    constitution = %constitution.code,
                    rule_code = %rule.rule_code,
                    "Unrecognised enforcement action, failure not classified"
                ),
            }
        }

        decision.passed = decision.violations.is_empty();
        debug!(
            constitution = %constitution.code,
            decision_id = %decision.decision_id,
            rules = decision.rules_evaluated,
            violations = decision.violations.len(),
            warnings = decision.warnings.len(),
            passed = decision.passed,
            "Constitution evaluated"
        );
        decision
    }

    /// Bump the rule's counter on a detached task. Failures are logged only.
    fn spawn_stats_increment(&self, rule_id: &str, result: &ValidationResult) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let rule_id = rule_id.to_string();
        let outcome = if result.passed {
            RuleStatOutcome::Passed
        } else {
            RuleStatOutcome::Blocked
        };

        tokio::spawn(async move {
            if let Err(e) = store.increment_rule_stats(&rule_id, outcome).await {
                debug!(rule_id = %rule_id, error = %e, "Rule stats increment failed");
            }
        });
    }
}

fn log_warnings(warnings: &[RuleViolation]) {
    for warning in warnings {
        warn!(
            constitution = %warning.constitution_code,
            rule_code = %warning.rule_code,
            message = %warning.message,
            "Constitution warning"
        );
    }
}
