//! Field presence and value checks.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::{config_for, display_value, misconfigured, Validator};
use crate::context::{is_truthy, EvalContext};
use crate::error::ValidatorError;
use crate::types::{Rule, ValidationResult, ValidationType};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FieldCheckConfig {
    /// Paths that must hold a non-empty value
    required_fields: Vec<String>,
    /// Single forbidden value on `field`
    field: Option<String>,
    forbidden_value: Option<Value>,
    forbidden_values: Vec<ForbiddenValue>,
    /// Substrings the target identifier must not contain (case-insensitive)
    forbidden_patterns: Vec<String>,
    target_field: Option<String>,
    /// Minimum character count per path
    min_lengths: BTreeMap<String, usize>,
    /// Paths required when the operation is a delete
    delete_required_fields: Vec<String>,
    allowed_buckets: Vec<String>,
    bucket_field: Option<String>,
    /// Categories that must be escalated
    escalation_categories: Vec<String>,
    category_field: Option<String>,
    escalation_field: Option<String>,
}

impl FieldCheckConfig {
    fn is_empty(&self) -> bool {
        self.required_fields.is_empty()
            && self.forbidden_value.is_none()
            && self.forbidden_values.is_empty()
            && self.forbidden_patterns.is_empty()
            && self.min_lengths.is_empty()
            && self.delete_required_fields.is_empty()
            && self.allowed_buckets.is_empty()
            && self.escalation_categories.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct ForbiddenValue {
    field: String,
    value: Value,
}

/// Validator for `field_check` rules.
pub struct FieldCheckValidator;

#[async_trait]
impl Validator for FieldCheckValidator {
    fn validation_type(&self) -> ValidationType {
        ValidationType::FieldCheck
    }

    async fn validate(
        &self,
        rule: &Rule,
        ctx: &EvalContext,
    ) -> Result<ValidationResult, ValidatorError> {
        let Some(config) = config_for::<FieldCheckConfig>(rule) else {
            return Ok(misconfigured(rule));
        };
        if config.is_empty() {
            return Ok(ValidationResult::pass("No field checks configured"));
        }

        let checks = [
            check_required(&config.required_fields, ctx),
            check_forbidden_values(&config, ctx),
            check_patterns(&config, ctx),
            check_min_lengths(&config.min_lengths, ctx),
            check_delete_fields(&config.delete_required_fields, ctx),
            check_buckets(&config, ctx),
            check_escalation(&config, ctx),
        ];

        Ok(checks
            .into_iter()
            .flatten()
            .next()
            .unwrap_or_else(|| ValidationResult::pass("All field checks passed")))
    }
}

fn check_required(fields: &[String], ctx: &EvalContext) -> Option<ValidationResult> {
    let missing: Vec<&str> = fields
        .iter()
        .filter(|f| !ctx.is_present(f))
        .map(String::as_str)
        .collect();

    match missing.as_slice() {
        [] => None,
        [one] => Some(
            ValidationResult::fail(format!("Missing required field: {}", one))
                .with_detail("missing_fields", vec![*one]),
        ),
        many => Some(
            ValidationResult::fail(format!("Missing required fields: {}", many.join(", ")))
                .with_detail("missing_fields", many.to_vec()),
        ),
    }
}

fn check_forbidden_values(config: &FieldCheckConfig, ctx: &EvalContext) -> Option<ValidationResult> {
    let single = config
        .field
        .as_deref()
        .zip(config.forbidden_value.as_ref());
    let listed = config
        .forbidden_values
        .iter()
        .map(|f| (f.field.as_str(), &f.value));

    single.into_iter().chain(listed).find_map(|(field, forbidden)| {
        (ctx.lookup(field) == Some(forbidden)).then(|| {
            ValidationResult::fail(format!(
                "Field {} has forbidden value {}",
                field,
                display_value(forbidden)
            ))
            .with_detail("field", field)
            .with_detail("value", forbidden.clone())
        })
    })
}

fn check_patterns(config: &FieldCheckConfig, ctx: &EvalContext) -> Option<ValidationResult> {
    if config.forbidden_patterns.is_empty() {
        return None;
    }
    let target_field = config.target_field.as_deref().unwrap_or("target");
    let target = ctx.get_str(target_field)?;
    let lowered = target.to_lowercase();

    config
        .forbidden_patterns
        .iter()
        .find(|p| lowered.contains(&p.to_lowercase()))
        .map(|pattern| {
            ValidationResult::fail(format!(
                "Target {} matches forbidden pattern {}",
                target, pattern
            ))
            .with_detail("pattern", pattern.as_str())
            .with_detail("target", target)
        })
}

fn check_min_lengths(
    min_lengths: &BTreeMap<String, usize>,
    ctx: &EvalContext,
) -> Option<ValidationResult> {
    min_lengths.iter().find_map(|(field, &min)| {
        let actual = ctx
            .get_str(field)
            .map(|s| s.trim().chars().count())
            .unwrap_or(0);
        (actual < min).then(|| {
            ValidationResult::fail(format!(
                "Field {} must be at least {} characters (got {})",
                field, min, actual
            ))
            .with_detail("field", field.as_str())
            .with_detail("min_length", min)
            .with_detail("actual_length", actual)
        })
    })
}

fn check_delete_fields(fields: &[String], ctx: &EvalContext) -> Option<ValidationResult> {
    let is_delete = ctx
        .operation_type()
        .map(|op| op.to_lowercase().contains("delete"))
        .unwrap_or(false);
    if !is_delete {
        return None;
    }

    check_required(fields, ctx).map(|result| {
        let message = format!("Delete operation: {}", result.message);
        ValidationResult { message, ..result }
    })
}

fn check_buckets(config: &FieldCheckConfig, ctx: &EvalContext) -> Option<ValidationResult> {
    if config.allowed_buckets.is_empty() {
        return None;
    }
    let field = config.bucket_field.as_deref().unwrap_or("bucket");
    let buckets: Vec<&Value> = match ctx.lookup(field)? {
        Value::Object(map) => map.values().collect(),
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    buckets.into_iter().find_map(|bucket| {
        let name = display_value(bucket);
        (!config.allowed_buckets.iter().any(|b| b == &name)).then(|| {
            ValidationResult::fail(format!("Bucket {} is not allowed", name))
                .with_detail("bucket", name)
                .with_detail("allowed_buckets", config.allowed_buckets.clone())
        })
    })
}

fn check_escalation(config: &FieldCheckConfig, ctx: &EvalContext) -> Option<ValidationResult> {
    if config.escalation_categories.is_empty() {
        return None;
    }
    let category_field = config.category_field.as_deref().unwrap_or("category");
    let escalation_field = config.escalation_field.as_deref().unwrap_or("escalated");
    let category = ctx.get_str(category_field)?;

    let requires = config
        .escalation_categories
        .iter()
        .any(|c| c.eq_ignore_ascii_case(category));
    let escalated = ctx.lookup(escalation_field).map(is_truthy).unwrap_or(false);

    (requires && !escalated).then(|| {
        ValidationResult::fail(format!("Category {} requires escalation", category))
            .with_detail("category", category)
    })
}
