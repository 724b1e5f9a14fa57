//! Error types for the enforcement engine.
//!
//! Each concern has its own error type. Only [`EnforcementError`] is ever
//! raised to callers of the evaluation path; everything else degrades to a
//! validation result, a log line, or a structured return value.

use crate::decision::RuleViolation;
use crate::types::ViolationStatus;

/// Error types for backing store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Store is not reachable
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Query or write failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Query was rejected before execution
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Row could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error types a validator may return.
///
/// The enforcer converts both variants into a failed validation result; they
/// are kept apart so audit records show whether a rule was unverifiable or
/// the validator itself broke.
#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    /// The check could not be performed; the rule is treated as violated
    #[error("Unable to verify rule {rule_code}: {reason}")]
    Verification { rule_code: String, reason: String },

    /// Unexpected validator failure
    #[error("Validator error: {0}")]
    Runtime(String),
}

/// Error types for violation recorder operations.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    /// No store configured
    #[error("No governance store configured")]
    NoStore,

    /// Violation not found
    #[error("Violation not found: {0}")]
    NotFound(String),

    /// Justification shorter than the configured minimum
    #[error("Justification must be at least {min} characters (got {actual})")]
    JustificationTooShort { min: usize, actual: usize },

    /// Violation is not in a state that allows the transition
    #[error(
        "Cannot move violation {id} from {from_status} to {to_status}",
        from_status = .from.as_str(),
        to_status = .to.as_str()
    )]
    InvalidTransition {
        id: String,
        from: ViolationStatus,
        to: ViolationStatus,
    },

    /// The violated rule's action forbids overrides
    #[error("Violation {id} comes from a {action} rule and cannot be overridden")]
    NotOverridable { id: String, action: String },

    /// Store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Error types for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Raised by `enforce`/`enforce_all` when an evaluation produced violations.
#[derive(Debug, Clone, thiserror::Error)]
#[error(
    "Constitution {codes} blocked the operation with {count} violation(s)",
    codes = .constitution_codes.join(", "),
    count = .violations.len()
)]
pub struct EnforcementError {
    /// Constitutions that produced violations
    pub constitution_codes: Vec<String>,
    pub violations: Vec<RuleViolation>,
    /// True iff any violation is BLOCK or BLOCK_OVERRIDABLE
    pub is_blocking: bool,
    /// Decision ids whose audit records carry these violations
    pub decision_ids: Vec<String>,
}

impl EnforcementError {
    pub(crate) fn new(
        constitution_codes: Vec<String>,
        violations: Vec<RuleViolation>,
        decision_ids: Vec<String>,
    ) -> Self {
        let is_blocking = violations
            .iter()
            .any(|v| v.enforcement_action.is_blocking());
        Self {
            constitution_codes,
            violations,
            is_blocking,
            decision_ids,
        }
    }

    /// Whether every violation may be overridden by a human.
    pub fn can_override(&self) -> bool {
        crate::enforcer::Enforcer::can_override(&self.violations)
    }
}
