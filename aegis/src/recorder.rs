//! Violation audit trail.
//!
//! Violations are append-only. The recorder writes one row per failed rule
//! and moves rows out of `open` through explicit transitions; it never
//! deletes. Every transition is a compare-and-set against `open`, so two
//! concurrent reviewers cannot both win.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::AegisConfig;
use crate::context::EvalContext;
use crate::error::RecorderError;
use crate::store::{GovernanceStore, ViolationQuery};
use crate::types::{
    Rule, ValidationResult, Violation, ViolationRecord, ViolationStatus, ViolationUpdate,
};

const FALSE_POSITIVE_PREFIX: &str = "[FALSE POSITIVE] ";

/// Result of persisting one violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub recorded: bool,
    pub violation_id: Option<String>,
    pub error: Option<String>,
}

/// Violation counts over a trailing window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViolationStats {
    pub period_days: u32,
    pub total: usize,
    /// Still in `open`
    pub open: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
}

/// Writes and transitions violation records.
pub struct ViolationRecorder {
    store: Option<Arc<dyn GovernanceStore>>,
    min_justification_len: usize,
    default_limit: usize,
}

impl ViolationRecorder {
    pub fn new(store: Option<Arc<dyn GovernanceStore>>) -> Self {
        Self::with_config(store, &AegisConfig::default())
    }

    pub fn with_config(store: Option<Arc<dyn GovernanceStore>>, config: &AegisConfig) -> Self {
        Self {
            store,
            min_justification_len: config.min_justification_len,
            default_limit: config.default_query_limit,
        }
    }

    pub fn min_justification_len(&self) -> usize {
        self.min_justification_len
    }

    /// An unfiltered query using the configured page size.
    pub fn violation_query(&self) -> ViolationQuery {
        ViolationQuery::default().page(self.default_limit, 0)
    }

    fn store(&self) -> Result<&Arc<dyn GovernanceStore>, RecorderError> {
        self.store.as_ref().ok_or(RecorderError::NoStore)
    }

    /// Persist a failed rule evaluation. Never fails; the outcome says
    /// whether the row was written.
    pub async fn record_violation(
        &self,
        rule: &Rule,
        result: &ValidationResult,
        ctx: &EvalContext,
        decision_id: Option<&str>,
    ) -> RecordOutcome {
        let Some(store) = &self.store else {
            debug!(rule_code = %rule.rule_code, "No store configured, violation not recorded");
            return RecordOutcome {
                recorded: false,
                violation_id: None,
                error: Some(RecorderError::NoStore.to_string()),
            };
        };

        let violation = Violation {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            constitution_id: rule.constitution_id.clone(),
            violation_type: rule.validation_type.clone(),
            severity: rule.severity,
            enforcement_action: Some(rule.enforcement_action),
            message: result.message.clone(),
            actor_id: ctx.actor_id().map(String::from),
            operation_type: ctx.operation_type().map(String::from),
            target: ctx.target().map(String::from),
            work_item_key: ctx.work_item_key().map(String::from),
            payload: Value::Object(result.details.clone()),
            context_hash: Some(ctx.fingerprint()),
            decision_id: decision_id.map(String::from),
            status: ViolationStatus::Open,
            acknowledged_by: None,
            acknowledged_at: None,
            override_justification: None,
            overridden_by: None,
            overridden_at: None,
            remediation_ref: None,
            remediated_by: None,
            remediated_at: None,
            created_at: Utc::now(),
        };

        match store.insert_violation(&violation).await {
            Ok(()) => {
                debug!(
                    violation_id = %violation.id,
                    rule_code = %rule.rule_code,
                    severity = %rule.severity.as_str(),
                    "Violation recorded"
                );
                RecordOutcome {
                    recorded: true,
                    violation_id: Some(violation.id),
                    error: None,
                }
            }
            Err(e) => {
                warn!(rule_code = %rule.rule_code, error = %e, "Failed to record violation");
                RecordOutcome {
                    recorded: false,
                    violation_id: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Filtered, paginated violations, newest first.
    pub async fn get_violations(
        &self,
        query: &ViolationQuery,
    ) -> Result<Vec<ViolationRecord>, RecorderError> {
        Ok(self.store()?.query_violations(query).await?)
    }

    pub async fn get_violation(&self, id: &str) -> Result<Violation, RecorderError> {
        self.store()?
            .get_violation(id)
            .await?
            .ok_or_else(|| RecorderError::NotFound(id.to_string()))
    }

    /// `open -> acknowledged`
    pub async fn acknowledge(&self, id: &str, actor: &str) -> Result<Violation, RecorderError> {
        self.transition(id, ViolationStatus::Acknowledged, actor, None, None)
            .await
    }

    /// `open -> overridden`. Requires a justification of the configured
    /// minimum length and an overridable enforcement action.
    pub async fn override_violation(
        &self,
        id: &str,
        justification: &str,
        actor: &str,
    ) -> Result<Violation, RecorderError> {
        self.check_justification(justification)?;

        let current = self.get_violation(id).await?;
        if let Some(action) = current.enforcement_action {
            if !action.is_overridable() {
                return Err(RecorderError::NotOverridable {
                    id: id.to_string(),
                    action: action.as_str().to_string(),
                });
            }
        }

        self.transition(
            id,
            ViolationStatus::Overridden,
            actor,
            Some(justification.to_string()),
            None,
        )
        .await
    }

    /// `open -> remediated`, optionally linked to the remediating work item.
    pub async fn mark_remediated(
        &self,
        id: &str,
        actor: &str,
        remediation_ref: Option<&str>,
    ) -> Result<Violation, RecorderError> {
        self.transition(
            id,
            ViolationStatus::Remediated,
            actor,
            None,
            remediation_ref.map(String::from),
        )
        .await
    }

    /// `open -> false_positive`. The justification is stored with a marker
    /// prefix.
    pub async fn mark_false_positive(
        &self,
        id: &str,
        justification: &str,
        actor: &str,
    ) -> Result<Violation, RecorderError> {
        self.check_justification(justification)?;
        self.transition(
            id,
            ViolationStatus::FalsePositive,
            actor,
            Some(format!("{}{}", FALSE_POSITIVE_PREFIX, justification)),
            None,
        )
        .await
    }

    /// Counts by severity and status over the last `period_days` days. A period
    /// reaching past the earliest representable time covers all history.
    pub async fn get_stats(&self, period_days: u32) -> Result<ViolationStats, RecorderError> {
        let since = TimeDelta::try_days(i64::from(period_days))
            .and_then(|period| Utc::now().checked_sub_signed(period))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let violations = self.store()?.violations_since(since).await?;

        let mut stats = ViolationStats {
            period_days,
            total: violations.len(),
            ..Default::default()
        };
        for violation in &violations {
            *stats
                .by_severity
                .entry(violation.severity.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_status
                .entry(violation.status.as_str().to_string())
                .or_default() += 1;
            if violation.status == ViolationStatus::Open {
                stats.open += 1;
            }
        }
        Ok(stats)
    }

    fn check_justification(&self, justification: &str) -> Result<(), RecorderError> {
        let actual = justification.chars().count();
        if actual < self.min_justification_len {
            return Err(RecorderError::JustificationTooShort {
                min: self.min_justification_len,
                actual,
            });
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: &str,
        to: ViolationStatus,
        actor: &str,
        justification: Option<String>,
        remediation_ref: Option<String>,
    ) -> Result<Violation, RecorderError> {
        let store = self.store()?;
        let update = ViolationUpdate {
            expected_status: ViolationStatus::Open,
            status: to,
            actor: Some(actor.to_string()),
            justification,
            remediation_ref,
            at: Utc::now(),
        };

        match store.update_violation(id, &update).await? {
            Some(updated) => {
                info!(
                    violation_id = %id,
                    status = %to.as_str(),
                    actor = %actor,
                    "Violation status changed"
                );
                Ok(updated)
            }
            None => match store.get_violation(id).await? {
                Some(current) => Err(RecorderError::InvalidTransition {
                    id: id.to_string(),
                    from: current.status,
                    to,
                }),
                None => Err(RecorderError::NotFound(id.to_string())),
            },
        }
    }
}
