//! Backing store abstraction.
//!
//! The store is the engine's only I/O dependency. [`GovernanceStore`] covers
//! the reads the loader and validators need, the violation writes the
//! recorder needs, and the best-effort counter increment. Implementations
//! provide their own concurrency control; the engine holds no locks on them.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::types::{
    Constitution, Rule, RuleStatOutcome, Severity, Violation, ViolationRecord, ViolationStatus,
    ViolationUpdate,
};

pub use memory::{InMemoryStore, StoreOperation};

/// Trait for the relational store holding constitutions, rules and violations.
#[async_trait]
pub trait GovernanceStore: Send + Sync {
    /// Active constitutions ordered by code.
    async fn list_constitutions(&self) -> Result<Vec<Constitution>, StoreError>;

    /// Active rules matching the filter, ordered by rule code.
    async fn list_rules(&self, filter: &RuleFilter) -> Result<Vec<Rule>, StoreError>;

    /// Number of rows matching the query.
    async fn count_rows(&self, query: &RowQuery) -> Result<u64, StoreError>;

    /// Most recently inserted row matching the query.
    async fn find_row(&self, query: &RowQuery) -> Result<Option<Value>, StoreError>;

    /// Append a violation record.
    async fn insert_violation(&self, violation: &Violation) -> Result<(), StoreError>;

    /// Apply a status transition. Returns `None` when no row with the id is in
    /// the expected status.
    async fn update_violation(
        &self,
        id: &str,
        update: &ViolationUpdate,
    ) -> Result<Option<Violation>, StoreError>;

    /// Fetch one violation by id.
    async fn get_violation(&self, id: &str) -> Result<Option<Violation>, StoreError>;

    /// Filtered, paginated violations joined with rule/constitution names,
    /// newest first.
    async fn query_violations(
        &self,
        query: &ViolationQuery,
    ) -> Result<Vec<ViolationRecord>, StoreError>;

    /// Violations created at or after `since`.
    async fn violations_since(&self, since: DateTime<Utc>) -> Result<Vec<Violation>, StoreError>;

    /// Bump a rule's pass/block counter.
    async fn increment_rule_stats(
        &self,
        rule_id: &str,
        outcome: RuleStatOutcome,
    ) -> Result<(), StoreError>;
}

/// Store-side rule predicates. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFilter {
    pub constitution_code: Option<String>,
    pub category: Option<String>,
    pub severity: Option<Severity>,
    pub validation_type: Option<String>,
}

impl RuleFilter {
    pub fn for_constitution(code: impl Into<String>) -> Self {
        Self {
            constitution_code: Some(code.into()),
            ..Default::default()
        }
    }

    /// Builder: filter by category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Builder: filter by severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Builder: filter by validation type.
    pub fn with_validation_type(mut self, validation_type: impl Into<String>) -> Self {
        self.validation_type = Some(validation_type.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.constitution_code.is_none()
            && self.category.is_none()
            && self.severity.is_none()
            && self.validation_type.is_none()
    }

    /// In-process evaluation, given the code of the rule's constitution.
    pub fn matches(&self, rule: &Rule, constitution_code: Option<&str>) -> bool {
        if let Some(code) = &self.constitution_code {
            if constitution_code != Some(code.as_str()) {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if rule.category.as_deref() != Some(category.as_str()) {
                return false;
            }
        }
        if let Some(severity) = self.severity {
            if rule.severity != severity {
                return false;
            }
        }
        if let Some(validation_type) = &self.validation_type {
            if &rule.validation_type != validation_type {
                return false;
            }
        }
        true
    }
}

/// Generic row lookup: equality filters plus an optional timestamp lower bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowQuery {
    pub table: String,
    pub equals: Vec<(String, Value)>,
    /// `(column, lower bound)`; rows with the column at or after the bound match
    pub since: Option<(String, DateTime<Utc>)>,
}

impl RowQuery {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            equals: Vec::new(),
            since: None,
        }
    }

    /// Builder: add an equality filter.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((column.into(), value.into()));
        self
    }

    /// Builder: set the timestamp lower bound.
    pub fn since(mut self, column: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.since = Some((column.into(), at));
        self
    }

    /// In-process evaluation against a JSON row.
    pub fn matches(&self, row: &Value) -> bool {
        let equal = self
            .equals
            .iter()
            .all(|(column, expected)| row.get(column).map(|v| v == expected).unwrap_or(false));
        if !equal {
            return false;
        }

        match &self.since {
            None => true,
            Some((column, bound)) => row
                .get(column)
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|ts| ts.with_timezone(&Utc) >= *bound)
                .unwrap_or(false),
        }
    }
}

/// Violation query with pagination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationQuery {
    pub status: Option<ViolationStatus>,
    pub severity: Option<Severity>,
    pub constitution_code: Option<String>,
    pub work_item_key: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ViolationQuery {
    fn default() -> Self {
        Self {
            status: None,
            severity: None,
            constitution_code: None,
            work_item_key: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl ViolationQuery {
    /// Builder: filter by status.
    pub fn with_status(mut self, status: ViolationStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Builder: filter by severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Builder: filter by constitution code.
    pub fn with_constitution(mut self, code: impl Into<String>) -> Self {
        self.constitution_code = Some(code.into());
        self
    }

    /// Builder: filter by work item key.
    pub fn with_work_item(mut self, key: impl Into<String>) -> Self {
        self.work_item_key = Some(key.into());
        self
    }

    /// Builder: set pagination.
    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}
