//! Rule validators.
//!
//! Each validator evaluates one rule against one context. Validators never
//! fail on missing data: an absent field is a validation failure, an absent
//! or malformed configuration is a pass with a diagnostic. The only error a
//! validator returns on purpose is [`ValidatorError::Verification`], used by
//! the fail-closed count limit.

pub mod count_limit;
pub mod custom;
pub mod field_check;
pub mod role_forbidden;
pub mod threshold;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::context::EvalContext;
use crate::error::ValidatorError;
use crate::store::GovernanceStore;
use crate::types::{Rule, ValidationResult, ValidationType};

pub use count_limit::CountLimitValidator;
pub use custom::CustomValidator;
pub use field_check::FieldCheckValidator;
pub use role_forbidden::RoleForbiddenValidator;
pub use threshold::ThresholdValidator;

/// Trait for rule validators.
#[async_trait]
pub trait Validator: Send + Sync {
    /// The `validation_type` this validator handles.
    fn validation_type(&self) -> ValidationType;

    /// Evaluate a rule against a context.
    async fn validate(
        &self,
        rule: &Rule,
        ctx: &EvalContext,
    ) -> Result<ValidationResult, ValidatorError>;
}

/// Validators keyed by validation type.
pub struct ValidatorRegistry {
    validators: HashMap<ValidationType, Arc<dyn Validator>>,
}

impl ValidatorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            validators: HashMap::new(),
        }
    }

    /// Registry with the five built-in validators.
    pub fn with_defaults(store: Option<Arc<dyn GovernanceStore>>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FieldCheckValidator));
        registry.register(Arc::new(ThresholdValidator));
        registry.register(Arc::new(RoleForbiddenValidator));
        registry.register(Arc::new(CountLimitValidator::new(store.clone())));
        registry.register(Arc::new(CustomValidator::new(store)));
        registry
    }

    /// Register a validator, replacing any existing one for its type.
    pub fn register(&mut self, validator: Arc<dyn Validator>) {
        self.validators.insert(validator.validation_type(), validator);
    }

    pub fn get(&self, validation_type: ValidationType) -> Option<&Arc<dyn Validator>> {
        self.validators.get(&validation_type)
    }

    /// Dispatch a rule to its validator.
    ///
    /// Never fails: unknown types pass with a diagnostic, validator errors
    /// become failed results carrying the error text.
    pub async fn evaluate(&self, rule: &Rule, ctx: &EvalContext) -> ValidationResult {
        let validator = rule.validation_kind().and_then(|kind| self.get(kind));
        let Some(validator) = validator else {
            warn!(
                rule_code = %rule.rule_code,
                validation_type = %rule.validation_type,
                "No validator registered, skipping rule"
            );
            return ValidationResult::pass(format!(
                "No validator for type {}",
                rule.validation_type
            ))
            .with_detail("skipped", true);
        };

        debug!(rule_code = %rule.rule_code, validation_type = %rule.validation_type, "Dispatching rule");

        match validator.validate(rule, ctx).await {
            Ok(result) => result,
            Err(e @ ValidatorError::Verification { .. }) => {
                warn!(rule_code = %rule.rule_code, error = %e, "Rule could not be verified");
                ValidationResult::fail(e.to_string()).with_detail("verification_error", true)
            }
            Err(e @ ValidatorError::Runtime(_)) => {
                warn!(rule_code = %rule.rule_code, error = %e, "Validator failed");
                ValidationResult::fail(e.to_string()).with_detail("validator_error", true)
            }
        }
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::with_defaults(None)
    }
}

/// Parse a rule's validation config. Null or missing config yields the
/// default; a malformed one yields `None` and a warning.
pub(crate) fn config_for<T: DeserializeOwned + Default>(rule: &Rule) -> Option<T> {
    if rule.validation_config.is_null() {
        return Some(T::default());
    }
    match serde_json::from_value(rule.validation_config.clone()) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!(rule_code = %rule.rule_code, error = %e, "Invalid validation_config");
            None
        }
    }
}

/// Result for a rule whose configuration could not be read.
pub(crate) fn misconfigured(rule: &Rule) -> ValidationResult {
    ValidationResult::pass(format!(
        "Rule {} has an unreadable validation_config, skipped",
        rule.rule_code
    ))
    .with_detail("misconfigured", true)
}

/// Display form of a JSON value for messages.
pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
