//! Per-evaluation results returned by the enforcer.
//!
//! A [`Decision`] is never persisted as a unit; only the violations it
//! contains are written to the audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::loader::CycleWarning;
use crate::types::{EnforcementAction, EnforcementMode, Rule, Severity, ValidationResult};

/// One failed rule inside a decision, tagged with its constitution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleViolation {
    pub rule_id: String,
    pub rule_code: String,
    pub rule_name: String,
    pub constitution_code: String,
    pub category: Option<String>,
    pub severity: Severity,
    pub enforcement_action: EnforcementAction,
    pub message: String,
    pub details: Map<String, Value>,
    /// Audit record id, when the failure was persisted
    pub violation_id: Option<String>,
}

impl RuleViolation {
    pub fn from_result(rule: &Rule, constitution_code: &str, result: &ValidationResult) -> Self {
        Self {
            rule_id: rule.id.clone(),
            rule_code: rule.rule_code.clone(),
            rule_name: rule.rule_name.clone(),
            constitution_code: constitution_code.to_string(),
            category: rule.category.clone(),
            severity: rule.severity,
            enforcement_action: rule.enforcement_action,
            message: result.message.clone(),
            details: result.details.clone(),
            violation_id: None,
        }
    }
}

/// Result of evaluating one constitution against one context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Correlates the audit records written by this evaluation
    pub decision_id: String,
    pub constitution_code: String,
    /// `None` when the constitution was not found
    pub enforcement_mode: Option<EnforcementMode>,
    /// True iff there are no blocking violations
    pub passed: bool,
    /// Blocking failures (BLOCK, BLOCK_OVERRIDABLE)
    pub violations: Vec<RuleViolation>,
    /// WARN_AND_LOG failures, and blocking failures under advisory mode
    pub warnings: Vec<RuleViolation>,
    /// AUDIT_ONLY failures
    pub audit_entries: Vec<RuleViolation>,
    /// TRIGGER_SD failures
    pub triggers: Vec<RuleViolation>,
    pub rules_evaluated: usize,
    pub cycle_warnings: Vec<CycleWarning>,
    /// Set when evaluation short-circuited
    pub skipped_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    pub(crate) fn new(constitution_code: &str, mode: Option<EnforcementMode>) -> Self {
        Self {
            decision_id: uuid::Uuid::new_v4().to_string(),
            constitution_code: constitution_code.to_string(),
            enforcement_mode: mode,
            passed: true,
            violations: Vec::new(),
            warnings: Vec::new(),
            audit_entries: Vec::new(),
            triggers: Vec::new(),
            rules_evaluated: 0,
            cycle_warnings: Vec::new(),
            skipped_reason: None,
            timestamp: Utc::now(),
        }
    }

    /// A passing decision with no rules evaluated.
    pub(crate) fn skipped(
        constitution_code: &str,
        mode: Option<EnforcementMode>,
        reason: impl Into<String>,
    ) -> Self {
        let mut decision = Self::new(constitution_code, mode);
        decision.skipped_reason = Some(reason.into());
        decision
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn violation_count(&self) -> usize {
        self.violations.len()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    /// Whether any violation blocks until overridden.
    pub fn is_blocking(&self) -> bool {
        self.violations
            .iter()
            .any(|v| v.enforcement_action.is_blocking())
    }
}

/// Result of evaluating every enabled constitution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateDecision {
    pub passed: bool,
    pub decisions: Vec<Decision>,
    /// Violations across constitutions, each tagged with its constitution code
    pub violations: Vec<RuleViolation>,
    pub warnings: Vec<RuleViolation>,
    /// Codes of the constitutions that were evaluated
    pub constitutions_checked: Vec<String>,
    /// Codes of the disabled constitutions that were skipped
    pub constitutions_skipped: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl AggregateDecision {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Per-id outcome of an override request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideResult {
    pub violation_id: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Outcome of [`Enforcer::override_violations`](crate::Enforcer::override_violations).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideOutcome {
    /// False only when the request itself was rejected
    pub success: bool,
    pub overridden_count: usize,
    pub results: Vec<OverrideResult>,
    /// Why the request was rejected
    pub error: Option<String>,
}

impl OverrideOutcome {
    pub(crate) fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            overridden_count: 0,
            results: Vec::new(),
            error: Some(error.into()),
        }
    }
}
