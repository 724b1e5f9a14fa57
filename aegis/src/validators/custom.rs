//! Named cross-cutting checks.
//!
//! The rule config selects a check by name (`{"check": "kill_switch", ...}`).
//! Unknown names and store failures pass with a diagnostic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use super::{config_for, misconfigured, Validator};
use crate::context::{is_present_value, is_truthy, EvalContext};
use crate::error::{StoreError, ValidatorError};
use crate::store::{GovernanceStore, RowQuery};
use crate::types::{Rule, ValidationResult, ValidationType};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CustomConfig {
    check: Option<String>,
    #[serde(flatten)]
    params: serde_json::Map<String, Value>,
}

/// Validator for `custom` rules.
pub struct CustomValidator {
    store: Option<Arc<dyn GovernanceStore>>,
}

impl CustomValidator {
    pub fn new(store: Option<Arc<dyn GovernanceStore>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Validator for CustomValidator {
    fn validation_type(&self) -> ValidationType {
        ValidationType::Custom
    }

    async fn validate(
        &self,
        rule: &Rule,
        ctx: &EvalContext,
    ) -> Result<ValidationResult, ValidatorError> {
        let Some(config) = config_for::<CustomConfig>(rule) else {
            return Ok(misconfigured(rule));
        };
        let Some(check) = config.check.as_deref() else {
            return Ok(ValidationResult::pass("No custom check configured"));
        };
        let params = Params(&config.params);

        let result = match check {
            "tier_approval" => tier_approval(&params, ctx),
            "no_self_approval" => no_self_approval(&params, ctx),
            "suspicious_confidence" => suspicious_confidence(&params, ctx),
            "kill_switch" => self.kill_switch(&params).await,
            "halt_state" => self.halt_state(&params, ctx).await,
            "dead_man_switch" => self.dead_man_switch(&params, ctx).await,
            unknown => {
                warn!(rule_code = %rule.rule_code, check = %unknown, "Unknown custom check");
                ValidationResult::pass(format!("Unknown custom check: {}", unknown))
                    .with_detail("skipped", true)
            }
        };

        Ok(result.with_detail("check", check))
    }
}

/// Typed access to check parameters with defaults.
struct Params<'a>(&'a serde_json::Map<String, Value>);

impl Params<'_> {
    fn str<'b>(&'b self, key: &str, default: &'b str) -> &'b str {
        self.0.get(key).and_then(Value::as_str).unwrap_or(default)
    }

    fn f64(&self, key: &str, default: f64) -> f64 {
        self.0.get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    fn strings(&self, key: &str, default: &[&str]) -> Vec<String> {
        match self.0.get(key).and_then(Value::as_array) {
            Some(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
            None => default.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn store_unavailable(check: &str, error: &StoreError) -> ValidationResult {
    warn!(check = %check, error = %error, "Custom check could not read store, allowing");
    ValidationResult::pass(format!("{} not verified: {}", check, error))
        .with_detail("store_error", error.to_string())
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

fn tier_approval(params: &Params<'_>, ctx: &EvalContext) -> ValidationResult {
    let tier_field = params.str("tier_field", "tier");
    let approval_field = params.str("approval_field", "approved_by");
    let max_auto = params.f64("max_auto_apply_tier", 1.0);

    let Some(tier) = ctx.get_f64(tier_field) else {
        return ValidationResult::fail(format!("Missing required field: {}", tier_field));
    };
    if tier <= max_auto || ctx.is_present(approval_field) {
        return ValidationResult::pass(format!("Tier {} permitted", tier));
    }
    ValidationResult::fail(format!(
        "Tier {} changes require human approval (auto-apply up to tier {})",
        tier, max_auto
    ))
    .with_detail("tier", tier)
}

/// Coarse vendor family of a model identifier.
pub fn model_family(model: &str) -> String {
    let m = model.trim().to_lowercase();
    let family = if m.contains("claude") || m.contains("anthropic") {
        "anthropic"
    } else if m.contains("gpt")
        || m.contains("openai")
        || m.starts_with("o1")
        || m.starts_with("o3")
        || m.starts_with("o4")
    {
        "openai"
    } else if m.contains("gemini") || m.contains("google") || m.contains("palm") {
        "google"
    } else if m.contains("llama") || m.contains("meta") {
        "meta"
    } else if m.contains("mistral") || m.contains("mixtral") {
        "mistral"
    } else {
        return m
            .split(|c: char| c == '-' || c == '/' || c == ':')
            .next()
            .unwrap_or_default()
            .to_string();
    };
    family.to_string()
}

fn no_self_approval(params: &Params<'_>, ctx: &EvalContext) -> ValidationResult {
    let evaluator_field = params.str("evaluator_field", "evaluator_model");
    let proposer_field = params.str("proposer_field", "proposer_model");

    let (Some(evaluator), Some(proposer)) = (ctx.get_str(evaluator_field), ctx.get_str(proposer_field))
    else {
        return ValidationResult::pass("Evaluator or proposer model not supplied");
    };

    let evaluator_family = model_family(evaluator);
    let proposer_family = model_family(proposer);
    if evaluator_family == proposer_family {
        return ValidationResult::fail(format!(
            "Evaluator {} and proposer {} are both {} models",
            evaluator, proposer, evaluator_family
        ))
        .with_detail("family", evaluator_family);
    }
    ValidationResult::pass("Evaluator is independent of proposer")
}

fn suspicious_confidence(params: &Params<'_>, ctx: &EvalContext) -> ValidationResult {
    let confidence_field = params.str("confidence_field", "confidence");
    let unknowns_field = params.str("unknowns_field", "unknowns");
    let threshold = params.f64("threshold", 0.95);

    let Some(mut confidence) = ctx.get_f64(confidence_field) else {
        return ValidationResult::pass("No confidence stated");
    };
    // Percentages
    if confidence > 1.0 {
        confidence /= 100.0;
    }

    if confidence >= threshold && !ctx.is_present(unknowns_field) {
        return ValidationResult::fail(format!(
            "Confidence {:.2} with no acknowledged unknowns",
            confidence
        ))
        .with_detail("confidence", confidence);
    }
    ValidationResult::pass("Confidence plausible")
}

impl CustomValidator {
    async fn kill_switch(&self, params: &Params<'_>) -> ValidationResult {
        let Some(store) = &self.store else {
            return ValidationResult::pass("No store configured for kill switch");
        };
        let flag = params.str("flag_key", "global_kill_switch");
        let query = RowQuery::table(params.str("table", "feature_flags"))
            .eq(params.str("key_column", "flag_key"), flag);

        match store.find_row(&query).await {
            Ok(Some(row)) => {
                let active = row
                    .get(params.str("active_column", "is_active"))
                    .map(is_truthy)
                    .unwrap_or(false);
                if active {
                    ValidationResult::fail(format!("Kill switch {} is active", flag))
                } else {
                    ValidationResult::pass(format!("Kill switch {} is off", flag))
                }
            }
            Ok(None) => ValidationResult::pass(format!("Kill switch {} not set", flag)),
            Err(e) => store_unavailable("kill_switch", &e),
        }
    }

    async fn halt_state(&self, params: &Params<'_>, ctx: &EvalContext) -> ValidationResult {
        let Some(store) = &self.store else {
            return ValidationResult::pass("No store configured for halt state");
        };
        let query = RowQuery::table(params.str("table", "system_halt_state"));

        let row = match store.find_row(&query).await {
            Ok(Some(row)) => row,
            Ok(None) => return ValidationResult::pass("No halt state recorded"),
            Err(e) => return store_unavailable("halt_state", &e),
        };

        let halted = row
            .get(params.str("halted_column", "is_halted"))
            .map(is_truthy)
            .unwrap_or(false);
        if !halted {
            return ValidationResult::pass("System is not halted");
        }

        let level = ctx.get_str(params.str("level_field", "authority_level"));
        let exempt = params.strings("exempt_levels", &["L0"]);
        if let Some(level) = level.filter(|l| exempt.iter().any(|e| e == l)) {
            return ValidationResult::pass(format!("Authority level {} is exempt from halt", level));
        }

        let reason = row
            .get(params.str("reason_column", "halt_reason"))
            .filter(|v| is_present_value(v))
            .and_then(Value::as_str)
            .unwrap_or("no reason given");
        ValidationResult::fail(format!("System is halted: {}", reason))
            .with_detail("authority_level", level.unwrap_or_default())
    }

    async fn dead_man_switch(&self, params: &Params<'_>, ctx: &EvalContext) -> ValidationResult {
        let warn_after = params.f64("warn_after_hours", 48.0);
        let fail_after = params.f64("fail_after_hours", 72.0);
        let checkin_field = params.str("checkin_field", "last_checkin_at");

        let last_checkin = match ctx.lookup(checkin_field) {
            Some(value) => value.clone(),
            None => {
                let Some(store) = &self.store else {
                    return ValidationResult::pass("No store configured for dead man switch");
                };
                let query = RowQuery::table(params.str("table", "operator_checkins"));
                match store.find_row(&query).await {
                    Ok(Some(row)) => row
                        .get(params.str("timestamp_column", "checked_in_at"))
                        .cloned()
                        .unwrap_or(Value::Null),
                    Ok(None) => return ValidationResult::fail("No check-in recorded"),
                    Err(e) => return store_unavailable("dead_man_switch", &e),
                }
            }
        };

        let Some(at) = parse_timestamp(&last_checkin) else {
            return ValidationResult::fail(format!(
                "Unreadable check-in timestamp: {}",
                last_checkin
            ));
        };

        let hours = (Utc::now() - at).num_minutes() as f64 / 60.0;
        if hours >= fail_after {
            ValidationResult::fail(format!(
                "Last check-in {:.1} hours ago exceeds {} hour limit",
                hours, fail_after
            ))
            .with_detail("hours_since_checkin", hours)
        } else if hours >= warn_after {
            ValidationResult::pass(format!(
                "Last check-in {:.1} hours ago, limit is {} hours",
                hours, fail_after
            ))
            .with_detail("hours_since_checkin", hours)
            .with_detail("warning", true)
        } else {
            ValidationResult::pass("Check-in is current").with_detail("hours_since_checkin", hours)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, StoreOperation};
    use chrono::Duration;
    use serde_json::json;

    fn rule(config: Value) -> Rule {
        Rule::new("r1", "c1", "R1", ValidationType::Custom).with_config(config)
    }

    async fn run(store: Option<Arc<InMemoryStore>>, config: Value, ctx: Value) -> ValidationResult {
        let store = store.map(|s| s as Arc<dyn GovernanceStore>);
        CustomValidator::new(store)
            .validate(&rule(config), &EvalContext::from_value(ctx))
            .await
            .unwrap()
    }

    #[test]
    fn test_model_family() {
        assert_eq!(model_family("claude-3-opus"), "anthropic");
        assert_eq!(model_family("gpt-4o"), "openai");
        assert_eq!(model_family("o3-mini"), "openai");
        assert_eq!(model_family("gemini-1.5-pro"), "google");
        assert_eq!(model_family("qwen2-72b"), "qwen2");
    }

    #[tokio::test]
    async fn test_self_approval() {
        let config = json!({"check": "no_self_approval"});
        let same = json!({"evaluator_model": "claude-sonnet", "proposer_model": "Claude-Haiku"});
        assert!(!run(None, config.clone(), same).await.passed);

        let different = json!({"evaluator_model": "gpt-4o", "proposer_model": "claude-haiku"});
        assert!(run(None, config, different).await.passed);
    }

    #[tokio::test]
    async fn test_tier_approval() {
        let config = json!({"check": "tier_approval", "max_auto_apply_tier": 1});
        assert!(run(None, config.clone(), json!({"tier": 1})).await.passed);
        assert!(!run(None, config.clone(), json!({"tier": 2})).await.passed);
        assert!(run(None, config, json!({"tier": 2, "approved_by": "chair"})).await.passed);
    }

    #[tokio::test]
    async fn test_kill_switch() {
        let store = Arc::new(
            InMemoryStore::new()
                .with_row("feature_flags", json!({"flag_key": "global_kill_switch", "is_active": true})),
        );
        let config = json!({"check": "kill_switch"});
        assert!(!run(Some(store.clone()), config.clone(), json!({})).await.passed);

        store.fail_on(StoreOperation::FindRow);
        let result = run(Some(store), config, json!({})).await;
        assert!(result.passed);
        assert!(result.details.contains_key("store_error"));
    }

    #[tokio::test]
    async fn test_halt_state_exempts_levels() {
        let store = Arc::new(InMemoryStore::new().with_row(
            "system_halt_state",
            json!({"is_halted": true, "halt_reason": "incident"}),
        ));
        let config = json!({"check": "halt_state"});

        let result = run(Some(store.clone()), config.clone(), json!({"authority_level": "L2"})).await;
        assert!(!result.passed);
        assert!(result.message.contains("incident"));

        assert!(run(Some(store), config, json!({"authority_level": "L0"})).await.passed);
    }

    #[tokio::test]
    async fn test_dead_man_switch() {
        let config = json!({"check": "dead_man_switch"});
        let recent = (Utc::now() - Duration::hours(1)).to_rfc3339();
        let stale = (Utc::now() - Duration::hours(50)).to_rfc3339();
        let dead = (Utc::now() - Duration::hours(80)).to_rfc3339();

        assert!(run(None, config.clone(), json!({"last_checkin_at": recent})).await.passed);

        let result = run(None, config.clone(), json!({"last_checkin_at": stale})).await;
        assert!(result.passed);
        assert_eq!(result.details["warning"], json!(true));

        assert!(!run(None, config.clone(), json!({"last_checkin_at": dead})).await.passed);

        let empty = Arc::new(InMemoryStore::new());
        assert!(!run(Some(empty), config, json!({})).await.passed);
    }

    #[tokio::test]
    async fn test_suspicious_confidence() {
        let config = json!({"check": "suspicious_confidence"});
        assert!(!run(None, config.clone(), json!({"confidence": 99})).await.passed);
        assert!(run(None, config.clone(), json!({"confidence": 0.99, "unknowns": ["scope"]})).await.passed);
        assert!(run(None, config, json!({"confidence": 0.7})).await.passed);
    }

    #[tokio::test]
    async fn test_unknown_check_passes() {
        let result = run(None, json!({"check": "astrology"}), json!({})).await;
        assert!(result.passed);
        assert_eq!(result.details["skipped"], json!(true));
    }
}
