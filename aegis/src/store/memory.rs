//! In-memory governance store.
//!
//! Used for tests and for embedding the engine without a database. Supports
//! an availability switch and per-operation failure injection so the
//! fallback and fail-open/fail-closed paths can be exercised.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::{GovernanceStore, RowQuery, RuleFilter, ViolationQuery};
use crate::error::StoreError;
use crate::types::{
    Constitution, Rule, RuleStatOutcome, RuleStats, Violation, ViolationRecord, ViolationUpdate,
};

/// Store operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    ListConstitutions,
    ListRules,
    CountRows,
    FindRow,
    InsertViolation,
    UpdateViolation,
    GetViolation,
    QueryViolations,
    IncrementStats,
}

/// Process-local store.
pub struct InMemoryStore {
    constitutions: RwLock<Vec<Constitution>>,
    rules: RwLock<Vec<Rule>>,
    violations: RwLock<Vec<Violation>>,
    tables: RwLock<HashMap<String, Vec<Value>>>,
    rule_stats: DashMap<String, RuleStats>,
    available: AtomicBool,
    failing: DashSet<StoreOperation>,
    calls: DashMap<StoreOperation, u64>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            constitutions: RwLock::new(Vec::new()),
            rules: RwLock::new(Vec::new()),
            violations: RwLock::new(Vec::new()),
            tables: RwLock::new(HashMap::new()),
            rule_stats: DashMap::new(),
            available: AtomicBool::new(true),
            failing: DashSet::new(),
            calls: DashMap::new(),
        }
    }

    /// Builder: add a constitution.
    pub fn with_constitution(mut self, constitution: Constitution) -> Self {
        self.constitutions.get_mut().push(constitution);
        self
    }

    /// Builder: add a rule.
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.get_mut().push(rule);
        self
    }

    /// Builder: add a row to a generic table.
    pub fn with_row(mut self, table: impl Into<String>, row: Value) -> Self {
        self.tables.get_mut().entry(table.into()).or_default().push(row);
        self
    }

    /// Add a row to a generic table.
    pub async fn insert_row(&self, table: impl Into<String>, row: Value) {
        let mut tables = self.tables.write().await;
        tables.entry(table.into()).or_default().push(row);
    }

    /// Toggle availability; an unavailable store fails every operation.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make one operation fail until cleared.
    pub fn fail_on(&self, operation: StoreOperation) {
        self.failing.insert(operation);
    }

    /// Number of times an operation was attempted.
    pub fn call_count(&self, operation: StoreOperation) -> u64 {
        self.calls.get(&operation).map(|c| *c.value()).unwrap_or(0)
    }

    /// Counters recorded for a rule.
    pub fn rule_stats(&self, rule_id: &str) -> Option<RuleStats> {
        self.rule_stats.get(rule_id).map(|s| s.value().clone())
    }

    /// Snapshot of all stored violations.
    pub async fn violations(&self) -> Vec<Violation> {
        self.violations.read().await.clone()
    }

    fn check(&self, operation: StoreOperation) -> Result<(), StoreError> {
        *self.calls.entry(operation).or_insert(0) += 1;

        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".to_string()));
        }
        if self.failing.contains(&operation) {
            return Err(StoreError::QueryFailed(format!(
                "injected failure for {:?}",
                operation
            )));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GovernanceStore for InMemoryStore {
    async fn list_constitutions(&self) -> Result<Vec<Constitution>, StoreError> {
        self.check(StoreOperation::ListConstitutions)?;

        let mut active: Vec<Constitution> = self
            .constitutions
            .read()
            .await
            .iter()
            .filter(|c| c.is_active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(active)
    }

    async fn list_rules(&self, filter: &RuleFilter) -> Result<Vec<Rule>, StoreError> {
        self.check(StoreOperation::ListRules)?;

        let codes: HashMap<String, String> = self
            .constitutions
            .read()
            .await
            .iter()
            .map(|c| (c.id.clone(), c.code.clone()))
            .collect();

        let mut rules: Vec<Rule> = self
            .rules
            .read()
            .await
            .iter()
            .filter(|r| r.is_active)
            .filter(|r| {
                filter.matches(r, codes.get(&r.constitution_id).map(String::as_str))
            })
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.rule_code.cmp(&b.rule_code));
        Ok(rules)
    }

    async fn count_rows(&self, query: &RowQuery) -> Result<u64, StoreError> {
        self.check(StoreOperation::CountRows)?;

        let tables = self.tables.read().await;
        let count = tables
            .get(&query.table)
            .map(|rows| rows.iter().filter(|row| query.matches(row)).count())
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn find_row(&self, query: &RowQuery) -> Result<Option<Value>, StoreError> {
        self.check(StoreOperation::FindRow)?;

        let tables = self.tables.read().await;
        Ok(tables
            .get(&query.table)
            .and_then(|rows| rows.iter().rev().find(|row| query.matches(row)))
            .cloned())
    }

    async fn insert_violation(&self, violation: &Violation) -> Result<(), StoreError> {
        self.check(StoreOperation::InsertViolation)?;

        let mut violations = self.violations.write().await;
        violations.push(violation.clone());
        Ok(())
    }

    async fn update_violation(
        &self,
        id: &str,
        update: &ViolationUpdate,
    ) -> Result<Option<Violation>, StoreError> {
        self.check(StoreOperation::UpdateViolation)?;

        let mut violations = self.violations.write().await;
        let Some(violation) = violations.iter_mut().find(|v| v.id == id) else {
            return Ok(None);
        };
        if violation.apply(update) {
            Ok(Some(violation.clone()))
        } else {
            Ok(None)
        }
    }

    async fn get_violation(&self, id: &str) -> Result<Option<Violation>, StoreError> {
        self.check(StoreOperation::GetViolation)?;

        let violations = self.violations.read().await;
        Ok(violations.iter().find(|v| v.id == id).cloned())
    }

    async fn query_violations(
        &self,
        query: &ViolationQuery,
    ) -> Result<Vec<ViolationRecord>, StoreError> {
        self.check(StoreOperation::QueryViolations)?;

        let constitutions = self.constitutions.read().await;
        let rules = self.rules.read().await;
        let violations = self.violations.read().await;

        let mut records: Vec<ViolationRecord> = violations
            .iter()
            .map(|v| {
                let rule = rules.iter().find(|r| r.id == v.rule_id);
                let constitution = constitutions.iter().find(|c| c.id == v.constitution_id);
                ViolationRecord {
                    violation: v.clone(),
                    rule_code: rule.map(|r| r.rule_code.clone()),
                    rule_name: rule.map(|r| r.rule_name.clone()),
                    constitution_code: constitution.map(|c| c.code.clone()),
                    constitution_name: constitution.map(|c| c.name.clone()),
                }
            })
            .filter(|r| query.status.map_or(true, |s| r.violation.status == s))
            .filter(|r| query.severity.map_or(true, |s| r.violation.severity == s))
            .filter(|r| {
                query
                    .constitution_code
                    .as_ref()
                    .map_or(true, |code| r.constitution_code.as_ref() == Some(code))
            })
            .filter(|r| {
                query
                    .work_item_key
                    .as_ref()
                    .map_or(true, |key| r.violation.work_item_key.as_ref() == Some(key))
            })
            .collect();

        records.sort_by(|a, b| b.violation.created_at.cmp(&a.violation.created_at));

        Ok(records
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn violations_since(&self, since: DateTime<Utc>) -> Result<Vec<Violation>, StoreError> {
        self.check(StoreOperation::QueryViolations)?;

        let violations = self.violations.read().await;
        Ok(violations
            .iter()
            .filter(|v| v.created_at >= since)
            .cloned()
            .collect())
    }

    async fn increment_rule_stats(
        &self,
        rule_id: &str,
        outcome: RuleStatOutcome,
    ) -> Result<(), StoreError> {
        self.check(StoreOperation::IncrementStats)?;

        self.rule_stats
            .entry(rule_id.to_string())
            .or_default()
            .record(outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EnforcementMode, ValidationType};
    use serde_json::json;

    fn store() -> InMemoryStore {
        InMemoryStore::new()
            .with_constitution(Constitution::new("c2", "CONST-002", "Second"))
            .with_constitution(Constitution::new("c1", "CONST-001", "First"))
            .with_constitution(Constitution {
                is_active: false,
                ..Constitution::new("c3", "CONST-003", "Retired")
            })
            .with_rule(Rule::new("r2", "c1", "R-B", ValidationType::Threshold))
            .with_rule(Rule::new("r1", "c1", "R-A", ValidationType::FieldCheck))
            .with_rule(Rule::new("r3", "c2", "R-C", ValidationType::Custom))
    }

    #[tokio::test]
    async fn test_active_constitutions_ordered_by_code() {
        let store = store();
        let list = store.list_constitutions().await.unwrap();
        let codes: Vec<_> = list.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(codes, vec!["CONST-001", "CONST-002"]);
        assert_eq!(list[0].enforcement_mode, EnforcementMode::Enforced);
    }

    #[tokio::test]
    async fn test_rules_filtered_by_constitution_code() {
        let store = store();
        let rules = store
            .list_rules(&RuleFilter::for_constitution("CONST-001"))
            .await
            .unwrap();
        let codes: Vec<_> = rules.iter().map(|r| r.rule_code.as_str()).collect();
        assert_eq!(codes, vec!["R-A", "R-B"]);
    }

    #[tokio::test]
    async fn test_failure_injection_and_call_counts() {
        let store = store();
        store.fail_on(StoreOperation::CountRows);

        assert!(store.count_rows(&RowQuery::table("t")).await.is_err());
        assert!(store.list_constitutions().await.is_ok());
        assert_eq!(store.call_count(StoreOperation::CountRows), 1);

        store.set_available(false);
        assert!(matches!(
            store.list_constitutions().await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_find_row_returns_newest_match() {
        let store = InMemoryStore::new()
            .with_row("flags", json!({"flag_key": "k", "is_active": false}))
            .with_row("flags", json!({"flag_key": "k", "is_active": true}));

        let row = store
            .find_row(&RowQuery::table("flags").eq("flag_key", "k"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["is_active"], json!(true));
    }
}
