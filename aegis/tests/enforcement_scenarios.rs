//! End-to-end enforcement scenarios against the in-memory store.

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio_test::{assert_err, assert_ok};

use aegis::store::StoreOperation;
use aegis::{
    AegisConfig, Constitution, EnforcementAction, EnforcementMode, Enforcer, EvalContext,
    FallbackSnapshot, FallbackSource, GovernanceStore, InMemoryStore, Rule, RuleLoader, Severity,
    ValidateOptions, ValidationResult, ValidationType, Validator, ValidatorError, ViolationStatus,
};

fn required(id: &str, constitution_id: &str, field: &str, action: EnforcementAction) -> Rule {
    Rule::new(id, constitution_id, format!("{}-{}", constitution_id, id), ValidationType::FieldCheck)
        .with_action(action)
        .with_severity(Severity::High)
        .with_config(json!({"required_fields": [field]}))
}

fn store() -> Arc<InMemoryStore> {
    Arc::new(
        InMemoryStore::new()
            .with_constitution(Constitution::new("c1", "CONST-001", "Change Safety"))
            .with_constitution(Constitution::new("c2", "CONST-002", "Data Handling"))
            .with_constitution(Constitution::new("c3", "CONST-003", "Autonomy"))
            .with_constitution(
                Constitution::new("c4", "CONST-004", "Retired Rules").with_mode(EnforcementMode::Disabled),
            )
            .with_rule(required("block", "c1", "owner", EnforcementAction::Block))
            .with_rule(required("warn", "c2", "ticket", EnforcementAction::WarnAndLog))
            .with_rule(required("soft", "c3", "approver", EnforcementAction::BlockOverridable))
            .with_rule(required("off", "c4", "anything", EnforcementAction::Block)),
    )
}

fn enforcer(store: &Arc<InMemoryStore>) -> Enforcer {
    Enforcer::new(store.clone())
}

fn dry_run() -> ValidateOptions {
    ValidateOptions::dry_run()
}

#[tokio::test]
async fn scenario_a_disabled_constitution_is_skipped() {
    let store = store();
    let enforcer = enforcer(&store);

    let decision = enforcer
        .validate("CONST-004", &EvalContext::new(), ValidateOptions::default())
        .await;

    assert!(decision.passed);
    assert_eq!(decision.rules_evaluated, 0);
    assert_eq!(decision.enforcement_mode, Some(EnforcementMode::Disabled));
    assert_eq!(store.call_count(StoreOperation::ListRules), 0);
}

#[tokio::test]
async fn scenario_b_block_failure_raises_blocking_error() {
    let store = store();
    let enforcer = enforcer(&store);
    let ctx = EvalContext::new().with("actor_id", "agent-7");

    let decision = enforcer.validate("CONST-001", &ctx, dry_run()).await;
    assert!(!decision.passed);
    assert_eq!(decision.violation_count(), 1);
    assert!(decision.violations[0].message.contains("owner"));

    let err = assert_err!(enforcer.enforce("CONST-001", &ctx, dry_run()).await);
    assert!(err.is_blocking);
    assert!(!err.can_override());
    assert_eq!(err.constitution_codes, vec!["CONST-001".to_string()]);

    let ctx = ctx.with("owner", "team-a");
    assert_ok!(enforcer.enforce("CONST-001", &ctx, dry_run()).await);
}

#[tokio::test]
async fn scenario_c_warning_does_not_block() {
    let store = store();
    let enforcer = enforcer(&store);
    let ctx = EvalContext::new();

    let decision = enforcer.validate("CONST-002", &ctx, dry_run()).await;
    assert!(decision.passed);
    assert!(decision.has_warnings());
    assert_eq!(decision.warning_count(), 1);

    let decision = assert_ok!(enforcer.enforce("CONST-002", &ctx, dry_run()).await);
    assert!(decision.has_warnings());
}

#[tokio::test]
async fn scenario_d_justification_length_boundary() {
    let store = store();
    let enforcer = enforcer(&store);

    let decision = enforcer
        .validate("CONST-003", &EvalContext::new(), ValidateOptions::default())
        .await;
    let id = decision.violations[0].violation_id.clone().unwrap();
    let ids = vec![id.clone()];

    let rejected = enforcer.override_violations(&ids, "123456789", "chair").await;
    assert!(!rejected.success);
    assert_eq!(rejected.overridden_count, 0);
    assert!(rejected.error.is_some());
    assert_eq!(store.call_count(StoreOperation::UpdateViolation), 0);
    assert_eq!(store.call_count(StoreOperation::GetViolation), 0);

    let accepted = enforcer.override_violations(&ids, "1234567890", "chair").await;
    assert!(accepted.success);
    assert_eq!(accepted.overridden_count, 1);

    let violation = enforcer.recorder().get_violation(&id).await.unwrap();
    assert_eq!(violation.status, ViolationStatus::Overridden);
    assert_eq!(violation.override_justification.as_deref(), Some("1234567890"));
}

#[tokio::test]
async fn scenario_e_validate_all_skips_disabled_and_tags_sources() {
    let store = store();
    let enforcer = enforcer(&store);

    let aggregate = enforcer.validate_all(&EvalContext::new(), dry_run()).await;

    assert_eq!(aggregate.constitutions_checked, vec!["CONST-001", "CONST-002", "CONST-003"]);
    assert_eq!(aggregate.constitutions_skipped, vec!["CONST-004"]);
    assert!(!aggregate.passed);

    let mut sources: Vec<_> = aggregate
        .violations
        .iter()
        .map(|v| v.constitution_code.as_str())
        .collect();
    sources.sort();
    assert_eq!(sources, vec!["CONST-001", "CONST-003"]);
    assert_eq!(aggregate.warnings[0].constitution_code, "CONST-002");

    let err = assert_err!(enforcer.enforce_all(&EvalContext::new(), dry_run()).await);
    assert_eq!(err.violations.len(), 2);
    assert_eq!(err.decision_ids.len(), 2);
    assert!(!err.can_override());
}

#[tokio::test]
async fn repeated_dry_runs_are_identical() {
    let store = store();
    let enforcer = enforcer(&store);
    let ctx = EvalContext::new().with("ticket", "T-1");

    let first = enforcer.validate_all(&ctx, dry_run()).await;
    let second = enforcer.validate_all(&ctx, dry_run()).await;

    assert_eq!(first.passed, second.passed);
    assert_eq!(first.violations, second.violations);
    assert_eq!(first.warnings, second.warnings);
    assert!(store.violations().await.is_empty());
}

#[tokio::test]
async fn recorded_violations_carry_decision_and_context() {
    let store = store();
    let enforcer = enforcer(&store);
    let ctx = EvalContext::new()
        .with("actor_id", "agent-7")
        .with("work_item_key", "SD-1");

    let decision = enforcer
        .validate("CONST-001", &ctx, ValidateOptions::default())
        .await;

    let stored = store.violations().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].decision_id.as_deref(), Some(decision.decision_id.as_str()));
    assert_eq!(stored[0].context_hash.as_deref(), Some(ctx.fingerprint().as_str()));
    assert_eq!(stored[0].actor_id.as_deref(), Some("agent-7"));
    assert_eq!(decision.violations[0].violation_id.as_deref(), Some(stored[0].id.as_str()));
}

#[tokio::test]
async fn persistence_failure_does_not_change_decision() {
    let store = store();
    store.fail_on(StoreOperation::InsertViolation);
    store.fail_on(StoreOperation::IncrementStats);
    let enforcer = enforcer(&store);

    let decision = enforcer
        .validate("CONST-001", &EvalContext::new(), ValidateOptions::default())
        .await;
    assert!(!decision.passed);
    assert_eq!(decision.violations[0].violation_id, None);
}

#[tokio::test]
async fn stats_are_incremented_in_background() {
    let store = store();
    let enforcer = enforcer(&store);

    enforcer
        .validate("CONST-001", &EvalContext::new(), ValidateOptions::default())
        .await;

    let mut stats = None;
    for _ in 0..100 {
        stats = store.rule_stats("block");
        if stats.is_some() {
            break;
        }
        tokio::task::yield_now().await;
    }
    let stats = stats.expect("stats task never ran");
    assert_eq!(stats.times_blocked, 1);
    assert_eq!(stats.times_passed, 0);
}

#[tokio::test]
async fn count_limit_fails_closed_while_others_fail_open() {
    let store = Arc::new(
        InMemoryStore::new()
            .with_constitution(Constitution::new("c1", "CONST-010", "Rate Limits"))
            .with_rule(
                Rule::new("limit", "c1", "RATE-1", ValidationType::CountLimit)
                    .with_config(json!({"table": "deployments", "max_count": 5})),
            )
            .with_rule(
                Rule::new("kill", "c1", "KILL-1", ValidationType::Custom)
                    .with_config(json!({"check": "kill_switch"})),
            ),
    );
    store.fail_on(StoreOperation::CountRows);
    store.fail_on(StoreOperation::FindRow);
    let enforcer = enforcer(&store);

    let decision = enforcer.validate("CONST-010", &EvalContext::new(), dry_run()).await;

    assert_eq!(decision.rules_evaluated, 2);
    assert_eq!(decision.violations.len(), 1);
    assert_eq!(decision.violations[0].rule_code, "RATE-1");
    assert_eq!(decision.violations[0].details["verification_error"], json!(true));
}

#[tokio::test]
async fn out_of_range_count_window_does_not_abort_evaluation() {
    let store = Arc::new(
        InMemoryStore::new()
            .with_constitution(Constitution::new("c1", "CONST-010", "Rate Limits"))
            .with_rule(
                Rule::new("limit", "c1", "RATE-1", ValidationType::CountLimit).with_config(json!({
                    "table": "deployments",
                    "max_count": 5,
                    "window_hours": 100000000000_i64
                })),
            )
            .with_rule(required("block", "c1", "owner", EnforcementAction::Block)),
    );
    let enforcer = enforcer(&store);

    let decision = enforcer.validate("CONST-010", &EvalContext::new(), dry_run()).await;

    assert_eq!(decision.rules_evaluated, 2);
    assert!(!decision.passed);
    assert_eq!(decision.violations.len(), 1);
    assert_eq!(decision.violations[0].rule_code, "c1-block");
}

struct OrderRecorder(Arc<Mutex<Vec<String>>>);

#[async_trait]
impl Validator for OrderRecorder {
    fn validation_type(&self) -> ValidationType {
        ValidationType::Threshold
    }

    async fn validate(
        &self,
        rule: &Rule,
        _ctx: &EvalContext,
    ) -> Result<ValidationResult, ValidatorError> {
        self.0.lock().unwrap().push(rule.id.clone());
        if rule.id == "explode" {
            return Err(ValidatorError::Runtime("boom".into()));
        }
        Ok(ValidationResult::pass("seen"))
    }
}

#[tokio::test]
async fn rules_run_in_dependency_order() {
    let store = Arc::new(
        InMemoryStore::new()
            .with_constitution(Constitution::new("c1", "CONST-020", "Ordered"))
            .with_rule(Rule::new("third", "c1", "A-THIRD", ValidationType::Threshold).depends_on("second"))
            .with_rule(Rule::new("second", "c1", "B-SECOND", ValidationType::Threshold).depends_on("first"))
            .with_rule(Rule::new("first", "c1", "C-FIRST", ValidationType::Threshold))
            .with_rule(
                Rule::new("explode", "c1", "D-EXPLODE", ValidationType::Threshold)
                    .with_action(EnforcementAction::AuditOnly),
            ),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    let enforcer = Enforcer::new(store.clone()).with_validator(Arc::new(OrderRecorder(seen.clone())));

    let decision = enforcer.validate("CONST-020", &EvalContext::new(), dry_run()).await;

    assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third", "explode"]);
    assert!(decision.passed);
    assert_eq!(decision.audit_entries.len(), 1);
    assert!(decision.audit_entries[0].message.contains("boom"));
}

#[tokio::test]
async fn dependency_cycle_is_reported_not_fatal() {
    let store = Arc::new(
        InMemoryStore::new()
            .with_constitution(Constitution::new("c1", "CONST-030", "Cyclic"))
            .with_rule(required("a", "c1", "x", EnforcementAction::WarnAndLog).depends_on("b"))
            .with_rule(required("b", "c1", "y", EnforcementAction::WarnAndLog).depends_on("a")),
    );
    let enforcer = enforcer(&store);

    let decision = enforcer.validate("CONST-030", &EvalContext::new(), dry_run()).await;
    assert_eq!(decision.rules_evaluated, 2);
    assert_eq!(decision.cycle_warnings.len(), 1);
    assert!(decision.passed);
}

#[tokio::test]
async fn advisory_mode_and_triggers_never_block() {
    let store = Arc::new(
        InMemoryStore::new()
            .with_constitution(
                Constitution::new("c1", "CONST-040", "Advisory").with_mode(EnforcementMode::Advisory),
            )
            .with_constitution(Constitution::new("c2", "CONST-041", "Follow-ups"))
            .with_rule(required("adv", "c1", "owner", EnforcementAction::Block))
            .with_rule(required("sd", "c2", "owner", EnforcementAction::TriggerSd)),
    );
    let enforcer = enforcer(&store);
    let ctx = EvalContext::new();

    let advisory = assert_ok!(enforcer.enforce("CONST-040", &ctx, dry_run()).await);
    assert!(advisory.violations.is_empty());
    assert_eq!(advisory.warnings[0].enforcement_action, EnforcementAction::Block);

    let triggers = assert_ok!(enforcer.enforce("CONST-041", &ctx, dry_run()).await);
    assert_eq!(triggers.triggers.len(), 1);
    assert!(triggers.warnings.is_empty());
}

#[tokio::test]
async fn unknown_constitution_passes() {
    let store = store();
    let decision = enforcer(&store)
        .validate("CONST-404", &EvalContext::new(), dry_run())
        .await;
    assert!(decision.passed);
    assert!(decision.skipped_reason.is_some());
    assert_eq!(decision.enforcement_mode, None);
}

#[tokio::test]
async fn unreachable_store_uses_fallback_snapshot() {
    let store = store();
    store.set_available(false);

    let snapshot = FallbackSnapshot {
        constitutions: vec![Constitution::new("c1", "CONST-001", "Change Safety")],
        rules: vec![required("block", "c1", "owner", EnforcementAction::Block)],
    };
    let dyn_store: Arc<dyn GovernanceStore> = store.clone();
    let enforcer = Enforcer::with_config(Some(dyn_store.clone()), AegisConfig::default()).with_loader(
        RuleLoader::new(dyn_store).with_fallback(FallbackSource::from_snapshot(snapshot)),
    );

    let err = assert_err!(
        enforcer
            .enforce("CONST-001", &EvalContext::new(), ValidateOptions::default())
            .await
    );
    assert!(err.is_blocking);
    assert_eq!(err.violations[0].violation_id, None);
}
