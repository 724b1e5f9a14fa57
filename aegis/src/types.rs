//! Core types for the enforcement engine.
//!
//! Constitutions and rules mirror the rows of the backing store; violations are
//! the durable audit records the engine writes. Enumerations serialize to the
//! same strings the store holds so rows round-trip through serde unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_true() -> bool {
    true
}

/// How a constitution is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// Failed blocking rules fail the decision
    Enforced,
    /// Constitution is skipped entirely
    Disabled,
    /// Rules are evaluated and recorded, but nothing blocks
    Advisory,
}

impl EnforcementMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enforced => "enforced",
            Self::Disabled => "disabled",
            Self::Advisory => "advisory",
        }
    }
}

impl Default for EnforcementMode {
    fn default() -> Self {
        Self::Enforced
    }
}

/// A named policy group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constitution {
    /// Store identifier
    pub id: String,
    /// Unique code, e.g. `CONST-001`
    pub code: String,
    /// Display name
    pub name: String,
    /// Domain tag
    #[serde(default)]
    pub domain: Option<String>,
    /// How failures are applied
    #[serde(default)]
    pub enforcement_mode: EnforcementMode,
    /// Inactive constitutions are never returned by the loader
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl Constitution {
    pub fn new(id: impl Into<String>, code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
            name: name.into(),
            domain: None,
            enforcement_mode: EnforcementMode::Enforced,
            is_active: true,
        }
    }

    /// Builder: set enforcement mode.
    pub fn with_mode(mut self, mode: EnforcementMode) -> Self {
        self.enforcement_mode = mode;
        self
    }

    /// Builder: set domain tag.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Active and not disabled.
    pub fn is_enforced(&self) -> bool {
        self.is_active && self.enforcement_mode != EnforcementMode::Disabled
    }
}

/// Rule severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Advisory,
    /// Any value this engine does not know
    #[serde(other)]
    Unknown,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
            Self::Advisory => "ADVISORY",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// How a failed rule affects the outcome of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnforcementAction {
    /// Hard block, never overridable
    Block,
    /// Blocks until explicitly overridden with justification
    BlockOverridable,
    /// Logged as a warning, does not block
    WarnAndLog,
    /// Informational audit entry only
    AuditOnly,
    /// Requests follow-up work; reported separately
    TriggerSd,
    /// Any value this engine does not know; failures are not classified
    #[serde(other)]
    Unknown,
}

impl EnforcementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "BLOCK",
            Self::BlockOverridable => "BLOCK_OVERRIDABLE",
            Self::WarnAndLog => "WARN_AND_LOG",
            Self::AuditOnly => "AUDIT_ONLY",
            Self::TriggerSd => "TRIGGER_SD",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Whether a failure with this action fails the decision.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Block | Self::BlockOverridable)
    }

    /// Whether a human may override a failure with this action.
    pub fn is_overridable(&self) -> bool {
        matches!(self, Self::BlockOverridable | Self::WarnAndLog)
    }
}

/// Built-in validator variants, selected by a rule's `validation_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationType {
    FieldCheck,
    Threshold,
    RoleForbidden,
    CountLimit,
    Custom,
}

impl ValidationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FieldCheck => "field_check",
            Self::Threshold => "threshold",
            Self::RoleForbidden => "role_forbidden",
            Self::CountLimit => "count_limit",
            Self::Custom => "custom",
        }
    }

    /// Parse a store value. Unknown types yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "field_check" => Some(Self::FieldCheck),
            "threshold" => Some(Self::Threshold),
            "role_forbidden" => Some(Self::RoleForbidden),
            "count_limit" => Some(Self::CountLimit),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// A single policy check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Store identifier
    pub id: String,
    /// Owning constitution id
    pub constitution_id: String,
    /// Human code, e.g. `CONST-001-R3`
    pub rule_code: String,
    /// Display name
    pub rule_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub severity: Severity,
    pub enforcement_action: EnforcementAction,
    /// Kept as the raw store value so unknown types degrade instead of failing to load
    pub validation_type: String,
    /// Parameters interpreted only by the selected validator
    #[serde(default)]
    pub validation_config: Value,
    /// Ids of rules that must be evaluated first
    #[serde(default)]
    pub depends_on_rules: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl Rule {
    pub fn new(
        id: impl Into<String>,
        constitution_id: impl Into<String>,
        rule_code: impl Into<String>,
        validation_type: ValidationType,
    ) -> Self {
        let rule_code = rule_code.into();
        Self {
            id: id.into(),
            constitution_id: constitution_id.into(),
            rule_name: rule_code.clone(),
            rule_code,
            description: None,
            category: None,
            severity: Severity::Medium,
            enforcement_action: EnforcementAction::Block,
            validation_type: validation_type.as_str().to_string(),
            validation_config: Value::Object(Map::new()),
            depends_on_rules: Vec::new(),
            is_active: true,
        }
    }

    /// Builder: set display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.rule_name = name.into();
        self
    }

    /// Builder: set severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Builder: set enforcement action.
    pub fn with_action(mut self, action: EnforcementAction) -> Self {
        self.enforcement_action = action;
        self
    }

    /// Builder: set category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Builder: set validation config.
    pub fn with_config(mut self, config: Value) -> Self {
        self.validation_config = config;
        self
    }

    /// Builder: add a prerequisite rule id.
    pub fn depends_on(mut self, rule_id: impl Into<String>) -> Self {
        self.depends_on_rules.push(rule_id.into());
        self
    }

    /// Validator variant for this rule, if the type is known.
    pub fn validation_kind(&self) -> Option<ValidationType> {
        ValidationType::parse(&self.validation_type)
    }
}

/// Outcome of one validator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl ValidationResult {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Map::new(),
        }
    }

    /// Builder: attach a detail value.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Lifecycle state of a recorded violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationStatus {
    Open,
    Acknowledged,
    Overridden,
    Remediated,
    FalsePositive,
}

impl ViolationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Acknowledged => "acknowledged",
            Self::Overridden => "overridden",
            Self::Remediated => "remediated",
            Self::FalsePositive => "false_positive",
        }
    }
}

/// Durable record of one failed rule evaluation.
///
/// Records are append-only: status transitions fill in the
/// acknowledgement/override/remediation fields, nothing is ever deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub id: String,
    pub rule_id: String,
    pub constitution_id: String,
    pub violation_type: String,
    pub severity: Severity,
    #[serde(default)]
    pub enforcement_action: Option<EnforcementAction>,
    pub message: String,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub operation_type: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub work_item_key: Option<String>,
    /// Validator details
    #[serde(default)]
    pub payload: Value,
    /// SHA-256 of the evaluated context
    #[serde(default)]
    pub context_hash: Option<String>,
    /// Evaluation that produced this record
    #[serde(default)]
    pub decision_id: Option<String>,
    pub status: ViolationStatus,
    #[serde(default)]
    pub acknowledged_by: Option<String>,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub override_justification: Option<String>,
    #[serde(default)]
    pub overridden_by: Option<String>,
    #[serde(default)]
    pub overridden_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub remediation_ref: Option<String>,
    #[serde(default)]
    pub remediated_by: Option<String>,
    #[serde(default)]
    pub remediated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A requested status transition, applied by the store as a compare-and-set
/// against `expected_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationUpdate {
    pub expected_status: ViolationStatus,
    pub status: ViolationStatus,
    pub actor: Option<String>,
    pub justification: Option<String>,
    pub remediation_ref: Option<String>,
    pub at: DateTime<Utc>,
}

impl Violation {
    /// Apply a transition in place. Returns false if the current status does
    /// not match `expected_status`.
    pub fn apply(&mut self, update: &ViolationUpdate) -> bool {
        if self.status != update.expected_status {
            return false;
        }

        self.status = update.status;
        match update.status {
            ViolationStatus::Acknowledged => {
                self.acknowledged_by = update.actor.clone();
                self.acknowledged_at = Some(update.at);
            }
            ViolationStatus::Overridden | ViolationStatus::FalsePositive => {
                self.override_justification = update.justification.clone();
                self.overridden_by = update.actor.clone();
                self.overridden_at = Some(update.at);
            }
            ViolationStatus::Remediated => {
                self.remediation_ref = update.remediation_ref.clone();
                self.remediated_by = update.actor.clone();
                self.remediated_at = Some(update.at);
            }
            ViolationStatus::Open => {}
        }
        true
    }
}

/// A violation joined with its rule and constitution display names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    #[serde(flatten)]
    pub violation: Violation,
    pub rule_code: Option<String>,
    pub rule_name: Option<String>,
    pub constitution_code: Option<String>,
    pub constitution_name: Option<String>,
}

/// Pass/block tally written after each rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatOutcome {
    Passed,
    Blocked,
}

/// Aggregate usage counters for a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStats {
    pub times_passed: u64,
    pub times_blocked: u64,
    pub last_evaluated_at: Option<DateTime<Utc>>,
}

impl RuleStats {
    pub fn record(&mut self, outcome: RuleStatOutcome) {
        match outcome {
            RuleStatOutcome::Passed => self.times_passed += 1,
            RuleStatOutcome::Blocked => self.times_blocked += 1,
        }
        self.last_evaluated_at = Some(Utc::now());
    }
}
