//! Numeric bounds and authority-level limits.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;

use super::{config_for, misconfigured, Validator};
use crate::context::{is_truthy, EvalContext};
use crate::error::ValidatorError;
use crate::types::{Rule, ValidationResult, ValidationType};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ThresholdConfig {
    field: Option<String>,
    min: Option<f64>,
    max: Option<f64>,
    /// Maximum spend per authority level
    spend_limits: BTreeMap<String, f64>,
    authority_field: Option<String>,
    amount_field: Option<String>,
    /// Minimum confidence per authority level below which escalation is required
    confidence_thresholds: BTreeMap<String, f64>,
    confidence_field: Option<String>,
    escalated_field: Option<String>,
    /// Upper bound on the serialized payload
    max_payload_bytes: Option<usize>,
    payload_field: Option<String>,
}

/// Validator for `threshold` rules.
pub struct ThresholdValidator;

#[async_trait]
impl Validator for ThresholdValidator {
    fn validation_type(&self) -> ValidationType {
        ValidationType::Threshold
    }

    async fn validate(
        &self,
        rule: &Rule,
        ctx: &EvalContext,
    ) -> Result<ValidationResult, ValidatorError> {
        let Some(config) = config_for::<ThresholdConfig>(rule) else {
            return Ok(misconfigured(rule));
        };

        let bounded = config.field.is_some() && (config.min.is_some() || config.max.is_some());
        if !bounded
            && config.spend_limits.is_empty()
            && config.confidence_thresholds.is_empty()
            && config.max_payload_bytes.is_none()
        {
            return Ok(ValidationResult::pass("No threshold configured"));
        }

        let authority_field = config.authority_field.as_deref().unwrap_or("authority_level");
        let authority = ctx.get_str(authority_field);

        if let Some(field) = config.field.as_deref().filter(|_| bounded) {
            if let Some(result) = check_bounds(field, config.min, config.max, ctx) {
                return Ok(result);
            }
        }

        if !config.spend_limits.is_empty() {
            let amount_field = config.amount_field.as_deref().unwrap_or("amount");
            if let Some(amount) = ctx.get_f64(amount_field) {
                let limit = authority.and_then(|level| config.spend_limits.get(level));
                match limit {
                    None => {
                        return Ok(ValidationResult::fail(format!(
                            "No spend limit defined for authority level {}",
                            authority.unwrap_or("(none)")
                        ))
                        .with_detail("amount", amount));
                    }
                    Some(&limit) if amount > limit => {
                        return Ok(ValidationResult::fail(format!(
                            "Amount {} exceeds spend limit {} for authority level {}",
                            amount,
                            limit,
                            authority.unwrap_or_default()
                        ))
                        .with_detail("amount", amount)
                        .with_detail("limit", limit));
                    }
                    Some(_) => {}
                }
            }
        }

        if let Some(&required) = authority.and_then(|level| config.confidence_thresholds.get(level)) {
            let confidence_field = config.confidence_field.as_deref().unwrap_or("confidence");
            let escalated_field = config.escalated_field.as_deref().unwrap_or("escalated");
            let escalated = ctx.lookup(escalated_field).map(is_truthy).unwrap_or(false);

            match ctx.get_f64(confidence_field) {
                None => {
                    return Ok(ValidationResult::fail(format!(
                        "Missing confidence field: {}",
                        confidence_field
                    )));
                }
                Some(confidence) if confidence < required && !escalated => {
                    return Ok(ValidationResult::fail(format!(
                        "Confidence {} below {} requires escalation",
                        confidence, required
                    ))
                    .with_detail("confidence", confidence)
                    .with_detail("required", required));
                }
                Some(_) => {}
            }
        }

        if let Some(max_bytes) = config.max_payload_bytes {
            let payload_field = config.payload_field.as_deref().unwrap_or("payload");
            if let Some(payload) = ctx.lookup(payload_field) {
                let size = serde_json::to_vec(payload).map(|b| b.len()).unwrap_or(0);
                if size > max_bytes {
                    return Ok(ValidationResult::fail(format!(
                        "Payload is {} bytes, limit is {}",
                        size, max_bytes
                    ))
                    .with_detail("size_bytes", size)
                    .with_detail("max_bytes", max_bytes));
                }
            }
        }

        Ok(ValidationResult::pass("Within thresholds"))
    }
}

fn check_bounds(
    field: &str,
    min: Option<f64>,
    max: Option<f64>,
    ctx: &EvalContext,
) -> Option<ValidationResult> {
    let Some(value) = ctx.get_f64(field) else {
        return Some(ValidationResult::fail(format!("Missing numeric field: {}", field)));
    };

    if let Some(min) = min.filter(|&min| value < min) {
        return Some(
            ValidationResult::fail(format!("{} is {}, below minimum {}", field, value, min))
                .with_detail("value", value)
                .with_detail("min", min),
        );
    }
    if let Some(max) = max.filter(|&max| value > max) {
        return Some(
            ValidationResult::fail(format!("{} is {}, above maximum {}", field, value, max))
                .with_detail("value", value)
                .with_detail("max", max),
        );
    }
    None
}
