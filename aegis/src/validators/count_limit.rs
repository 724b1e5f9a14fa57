//! Historical count limits.
//!
//! The one fail-closed validator: when the count cannot be read, the rule is
//! reported as violated.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{config_for, misconfigured, Validator};
use crate::context::EvalContext;
use crate::error::ValidatorError;
use crate::store::{GovernanceStore, RowQuery};
use crate::types::{Rule, ValidationResult, ValidationType};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CountLimitConfig {
    table: Option<String>,
    max_count: Option<u64>,
    /// Column to context path; the row column must equal the context value
    match_fields: BTreeMap<String, String>,
    /// Column to literal value
    filters: BTreeMap<String, Value>,
    window_minutes: Option<i64>,
    window_hours: Option<i64>,
    timestamp_column: Option<String>,
}

impl CountLimitConfig {
    /// Start of the counting window. `None` when no window is configured,
    /// `Some(None)` when the configured span falls outside the representable range.
    fn window_start(&self, now: DateTime<Utc>) -> Option<Option<DateTime<Utc>>> {
        let span = match (self.window_minutes, self.window_hours) {
            (Some(minutes), _) => TimeDelta::try_minutes(minutes),
            (None, Some(hours)) => TimeDelta::try_hours(hours),
            (None, None) => return None,
        };
        Some(span.and_then(|span| now.checked_sub_signed(span)))
    }
}

/// Validator for `count_limit` rules.
pub struct CountLimitValidator {
    store: Option<Arc<dyn GovernanceStore>>,
}

impl CountLimitValidator {
    pub fn new(store: Option<Arc<dyn GovernanceStore>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Validator for CountLimitValidator {
    fn validation_type(&self) -> ValidationType {
        ValidationType::CountLimit
    }

    async fn validate(
        &self,
        rule: &Rule,
        ctx: &EvalContext,
    ) -> Result<ValidationResult, ValidatorError> {
        let Some(config) = config_for::<CountLimitConfig>(rule) else {
            return Ok(misconfigured(rule));
        };
        let (Some(table), Some(max_count)) = (config.table.as_deref(), config.max_count) else {
            return Ok(ValidationResult::pass("Count limit requires table and max_count"));
        };
        let Some(store) = &self.store else {
            debug!(rule_code = %rule.rule_code, "No store configured, count limit skipped");
            return Ok(ValidationResult::pass("No store configured for count limit"));
        };

        let mut query = RowQuery::table(table);
        for (column, path) in &config.match_fields {
            let Some(value) = ctx.lookup(path) else {
                return Ok(ValidationResult::fail(format!(
                    "Missing required field: {}",
                    path
                )));
            };
            query = query.eq(column.as_str(), value.clone());
        }
        for (column, value) in &config.filters {
            query = query.eq(column.as_str(), value.clone());
        }
        match config.window_start(Utc::now()) {
            Some(Some(since)) => {
                let column = config.timestamp_column.as_deref().unwrap_or("created_at");
                query = query.since(column, since);
            }
            Some(None) => {
                warn!(rule_code = %rule.rule_code, "Count window out of range, rule skipped");
                return Ok(misconfigured(rule));
            }
            None => {}
        }

        let count = store
            .count_rows(&query)
            .await
            .map_err(|e| ValidatorError::Verification {
                rule_code: rule.rule_code.clone(),
                reason: e.to_string(),
            })?;

        if count >= max_count {
            Ok(ValidationResult::fail(format!(
                "Count limit reached: {} of {} in {}",
                count, max_count, table
            ))
            .with_detail("count", count)
            .with_detail("max_count", max_count))
        } else {
            Ok(ValidationResult::pass(format!("{} of {} used", count, max_count))
                .with_detail("count", count))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, StoreOperation};
    use serde_json::json;

    fn rule() -> Rule {
        Rule::new("r1", "c1", "R1", ValidationType::CountLimit).with_config(json!({
            "table": "deployments",
            "max_count": 2,
            "match_fields": {"actor_id": "actor_id"},
            "window_hours": 1
        }))
    }

    fn store() -> Arc<InMemoryStore> {
        let now = Utc::now();
        Arc::new(
            InMemoryStore::new()
                .with_row("deployments", json!({"actor_id": "a", "created_at": now.to_rfc3339()}))
                .with_row(
                    "deployments",
                    json!({"actor_id": "a", "created_at": (now - TimeDelta::hours(2)).to_rfc3339()}),
                )
                .with_row("deployments", json!({"actor_id": "b", "created_at": now.to_rfc3339()})),
        )
    }

    #[tokio::test]
    async fn test_under_and_at_limit() {
        let store = store();
        let validator = CountLimitValidator::new(Some(store.clone()));
        let ctx = EvalContext::new().with("actor_id", "a");

        let result = validator.validate(&rule(), &ctx).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.details["count"], json!(1));

        store
            .insert_row("deployments", json!({"actor_id": "a", "created_at": Utc::now().to_rfc3339()}))
            .await;
        let result = validator.validate(&rule(), &ctx).await.unwrap();
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn test_store_error_fails_closed() {
        let store = store();
        store.fail_on(StoreOperation::CountRows);
        let validator = CountLimitValidator::new(Some(store));

        let err = validator
            .validate(&rule(), &EvalContext::new().with("actor_id", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, ValidatorError::Verification { .. }));
    }

    #[tokio::test]
    async fn test_missing_store_or_config_passes() {
        let ctx = EvalContext::new().with("actor_id", "a");
        let result = CountLimitValidator::new(None).validate(&rule(), &ctx).await.unwrap();
        assert!(result.passed);

        let bare = Rule::new("r2", "c1", "R2", ValidationType::CountLimit);
        let result = CountLimitValidator::new(Some(store())).validate(&bare, &ctx).await.unwrap();
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_out_of_range_window_is_misconfigured() {
        let ctx = EvalContext::new().with("actor_id", "a");
        let validator = CountLimitValidator::new(Some(store()));

        for window in [json!({"window_hours": 100000000000_i64}), json!({"window_minutes": i64::MAX})] {
            let mut config = json!({
                "table": "deployments",
                "max_count": 2,
                "match_fields": {"actor_id": "actor_id"}
            });
            config.as_object_mut().unwrap().extend(window.as_object().unwrap().clone());
            let huge = Rule::new("r3", "c1", "R3", ValidationType::CountLimit).with_config(config);

            let result = validator.validate(&huge, &ctx).await.unwrap();
            assert!(result.passed);
            assert_eq!(result.details["misconfigured"], json!(true));
        }
    }
}
