//! SQLite implementation of [`GovernanceStore`].
//!
//! One connection behind a mutex. Each trait call takes the lock for the
//! duration of its statements, so a status update and its read-back are
//! atomic with respect to other callers of the same store.

use std::path::Path;
use std::sync::Mutex;

use aegis::{
    Constitution, GovernanceStore, RowQuery, Rule, RuleFilter, RuleStatOutcome, RuleStats,
    StoreError, Violation, ViolationQuery, ViolationRecord, ViolationStatus, ViolationUpdate,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::schema;

/// SQLite-backed governance store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!("Opening governance database at {:?}", path);

        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::Unavailable(format!("Failed to set PRAGMA: {}", e)))?;

        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("Opening in-memory governance database");

        let conn = Connection::open_in_memory().map_err(|e| {
            StoreError::Unavailable(format!("Failed to open in-memory SQLite: {}", e))
        })?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a closure with the connection locked
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Insert or replace a constitution
    pub fn insert_constitution(&self, constitution: &Constitution) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO constitutions (id, code, name, domain, enforcement_mode, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    constitution.id,
                    constitution.code,
                    constitution.name,
                    constitution.domain,
                    constitution.enforcement_mode.as_str(),
                    constitution.is_active,
                ],
            )
            .map_err(query_err)?;
            Ok(())
        })
    }

    /// Insert or replace a rule
    pub fn insert_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        let config = serde_json::to_string(&rule.validation_config)?;
        let depends_on = serde_json::to_string(&rule.depends_on_rules)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO rules (id, constitution_id, rule_code, rule_name, description,
                     category, severity, enforcement_action, validation_type, validation_config,
                     depends_on_rules, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    rule.id,
                    rule.constitution_id,
                    rule.rule_code,
                    rule.rule_name,
                    rule.description,
                    rule.category,
                    rule.severity.as_str(),
                    rule.enforcement_action.as_str(),
                    rule.validation_type,
                    config,
                    depends_on,
                    rule.is_active,
                ],
            )
            .map_err(query_err)?;
            Ok(())
        })
    }

    /// Usage counters for a rule
    pub fn rule_stats(&self, rule_id: &str) -> Result<Option<RuleStats>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT times_passed, times_blocked, last_evaluated_at FROM rule_stats WHERE rule_id = ?1",
                [rule_id],
                |row| {
                    Ok(RuleStats {
                        times_passed: row.get::<_, i64>(0)? as u64,
                        times_blocked: row.get::<_, i64>(1)? as u64,
                        last_evaluated_at: get_opt_timestamp(row, "last_evaluated_at")?,
                    })
                },
            )
            .optional()
            .map_err(query_err)
        })
    }
}

#[async_trait]
impl GovernanceStore for SqliteStore {
    async fn list_constitutions(&self) -> Result<Vec<Constitution>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM constitutions WHERE is_active = 1 ORDER BY code")
                .map_err(query_err)?;
            let rows = stmt.query_map([], constitution_from_row).map_err(query_err)?;
            collect_decodable(rows, "constitutions")
        })
    }

    async fn list_rules(&self, filter: &RuleFilter) -> Result<Vec<Rule>, StoreError> {
        let mut sql = String::from(
            "SELECT r.* FROM rules r LEFT JOIN constitutions c ON r.constitution_id = c.id WHERE r.is_active = 1",
        );
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(code) = &filter.constitution_code {
            sql.push_str(" AND c.code = ?");
            values.push(SqlValue::Text(code.clone()));
        }
        if let Some(category) = &filter.category {
            sql.push_str(" AND r.category = ?");
            values.push(SqlValue::Text(category.clone()));
        }
        if let Some(severity) = filter.severity {
            sql.push_str(" AND r.severity = ?");
            values.push(SqlValue::Text(severity.as_str().to_string()));
        }
        if let Some(validation_type) = &filter.validation_type {
            sql.push_str(" AND r.validation_type = ?");
            values.push(SqlValue::Text(validation_type.clone()));
        }
        sql.push_str(" ORDER BY r.rule_code");

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql).map_err(query_err)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), rule_from_row)
                .map_err(query_err)?;
            collect_decodable(rows, "rules")
        })
    }

    async fn count_rows(&self, query: &RowQuery) -> Result<u64, StoreError> {
        let (clause, values) = row_filter(query)?;
        let sql = format!("SELECT COUNT(*) FROM \"{}\"{}", identifier(&query.table)?, clause);
        debug!("Executing count: {}", sql);

        self.with_conn(|conn| {
            let count: i64 = conn
                .query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))
                .map_err(query_err)?;
            Ok(count.max(0) as u64)
        })
    }

    async fn find_row(&self, query: &RowQuery) -> Result<Option<Value>, StoreError> {
        let (clause, values) = row_filter(query)?;
        let sql = format!(
            "SELECT * FROM \"{}\"{} ORDER BY rowid DESC LIMIT 1",
            identifier(&query.table)?,
            clause
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql).map_err(query_err)?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            stmt.query_row(params_from_iter(values.iter()), |row| {
                let mut object = Map::new();
                for (i, column) in columns.iter().enumerate() {
                    object.insert(column.clone(), json_from_sql(row.get_ref(i)?));
                }
                Ok(Value::Object(object))
            })
            .optional()
            .map_err(query_err)
        })
    }

    async fn insert_violation(&self, violation: &Violation) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&violation.payload)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO violations (id, rule_id, constitution_id, violation_type, severity,
                     enforcement_action, message, actor_id, operation_type, target, work_item_key,
                     payload, context_hash, decision_id, status, acknowledged_by, acknowledged_at,
                     override_justification, overridden_by, overridden_at, remediation_ref,
                     remediated_by, remediated_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
                params![
                    violation.id,
                    violation.rule_id,
                    violation.constitution_id,
                    violation.violation_type,
                    violation.severity.as_str(),
                    violation.enforcement_action.map(|a| a.as_str()),
                    violation.message,
                    violation.actor_id,
                    violation.operation_type,
                    violation.target,
                    violation.work_item_key,
                    payload,
                    violation.context_hash,
                    violation.decision_id,
                    violation.status.as_str(),
                    violation.acknowledged_by,
                    violation.acknowledged_at.as_ref().map(timestamp),
                    violation.override_justification,
                    violation.overridden_by,
                    violation.overridden_at.as_ref().map(timestamp),
                    violation.remediation_ref,
                    violation.remediated_by,
                    violation.remediated_at.as_ref().map(timestamp),
                    timestamp(&violation.created_at),
                ],
            )
            .map_err(query_err)?;
            Ok(())
        })
    }

    async fn update_violation(
        &self,
        id: &str,
        update: &ViolationUpdate,
    ) -> Result<Option<Violation>, StoreError> {
        let at = timestamp(&update.at);
        let (assignments, values): (&str, Vec<SqlValue>) = match update.status {
            ViolationStatus::Acknowledged => (
                ", acknowledged_by = ?, acknowledged_at = ?",
                vec![opt_text(&update.actor), SqlValue::Text(at)],
            ),
            ViolationStatus::Overridden | ViolationStatus::FalsePositive => (
                ", override_justification = ?, overridden_by = ?, overridden_at = ?",
                vec![
                    opt_text(&update.justification),
                    opt_text(&update.actor),
                    SqlValue::Text(at),
                ],
            ),
            ViolationStatus::Remediated => (
                ", remediation_ref = ?, remediated_by = ?, remediated_at = ?",
                vec![
                    opt_text(&update.remediation_ref),
                    opt_text(&update.actor),
                    SqlValue::Text(at),
                ],
            ),
            ViolationStatus::Open => ("", Vec::new()),
        };

        let sql = format!(
            "UPDATE violations SET status = ?{} WHERE id = ? AND status = ?",
            assignments
        );
        let mut all = vec![SqlValue::Text(update.status.as_str().to_string())];
        all.extend(values);
        all.push(SqlValue::Text(id.to_string()));
        all.push(SqlValue::Text(update.expected_status.as_str().to_string()));

        self.with_conn(|conn| {
            let changed = conn
                .execute(&sql, params_from_iter(all.iter()))
                .map_err(query_err)?;
            if changed == 0 {
                return Ok(None);
            }
            fetch_violation(conn, id)
        })
    }

    async fn get_violation(&self, id: &str) -> Result<Option<Violation>, StoreError> {
        self.with_conn(|conn| fetch_violation(conn, id))
    }

    async fn query_violations(
        &self,
        query: &ViolationQuery,
    ) -> Result<Vec<ViolationRecord>, StoreError> {
        let mut sql = String::from(
            "SELECT v.*, r.rule_code AS joined_rule_code, r.rule_name AS joined_rule_name,
                    c.code AS joined_constitution_code, c.name AS joined_constitution_name
             FROM violations v
             LEFT JOIN rules r ON v.rule_id = r.id
             LEFT JOIN constitutions c ON v.constitution_id = c.id",
        );
        let mut conditions = vec![];
        let mut values: Vec<SqlValue> = vec![];

        if let Some(status) = query.status {
            conditions.push("v.status = ?");
            values.push(SqlValue::Text(status.as_str().to_string()));
        }
        if let Some(severity) = query.severity {
            conditions.push("v.severity = ?");
            values.push(SqlValue::Text(severity.as_str().to_string()));
        }
        if let Some(code) = &query.constitution_code {
            conditions.push("c.code = ?");
            values.push(SqlValue::Text(code.clone()));
        }
        if let Some(key) = &query.work_item_key {
            conditions.push("v.work_item_key = ?");
            values.push(SqlValue::Text(key.clone()));
        }

        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY v.created_at DESC LIMIT ? OFFSET ?");
        values.push(SqlValue::Integer(query.limit as i64));
        values.push(SqlValue::Integer(query.offset as i64));

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql).map_err(query_err)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    Ok(ViolationRecord {
                        violation: violation_from_row(row)?,
                        rule_code: row.get("joined_rule_code")?,
                        rule_name: row.get("joined_rule_name")?,
                        constitution_code: row.get("joined_constitution_code")?,
                        constitution_name: row.get("joined_constitution_name")?,
                    })
                })
                .map_err(query_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
        })
    }

    async fn violations_since(&self, since: DateTime<Utc>) -> Result<Vec<Violation>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM violations WHERE created_at >= ?1 ORDER BY created_at")
                .map_err(query_err)?;
            let rows = stmt
                .query_map([timestamp(&since)], violation_from_row)
                .map_err(query_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
        })
    }

    async fn increment_rule_stats(
        &self,
        rule_id: &str,
        outcome: RuleStatOutcome,
    ) -> Result<(), StoreError> {
        let (passed, blocked) = match outcome {
            RuleStatOutcome::Passed => (1, 0),
            RuleStatOutcome::Blocked => (0, 1),
        };

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rule_stats (rule_id, times_passed, times_blocked, last_evaluated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(rule_id) DO UPDATE SET
                     times_passed = times_passed + excluded.times_passed,
                     times_blocked = times_blocked + excluded.times_blocked,
                     last_evaluated_at = excluded.last_evaluated_at",
                params![rule_id, passed, blocked, timestamp(&Utc::now())],
            )
            .map_err(query_err)?;
            Ok(())
        })
    }
}

fn query_err(e: rusqlite::Error) -> StoreError {
    StoreError::QueryFailed(e.to_string())
}

/// Keep every row that decodes. A row with bad column data is skipped on its
/// own; any other error fails the query.
fn collect_decodable<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    table: &str,
) -> Result<Vec<T>, StoreError> {
    let mut decoded = Vec::new();
    for row in rows {
        match row {
            Ok(item) => decoded.push(item),
            Err(
                e @ (rusqlite::Error::FromSqlConversionFailure(..)
                | rusqlite::Error::InvalidColumnType(..)),
            ) => {
                warn!(table = %table, error = %e, "Skipping undecodable row");
            }
            Err(e) => return Err(query_err(e)),
        }
    }
    Ok(decoded)
}

/// Timestamps are stored with fixed precision so text order is time order.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_text(value: &Option<String>) -> SqlValue {
    value
        .as_ref()
        .map(|s| SqlValue::Text(s.clone()))
        .unwrap_or(SqlValue::Null)
}

/// Accept only plain identifiers for caller-supplied table/column names.
fn identifier(name: &str) -> Result<&str, StoreError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(StoreError::InvalidQuery(format!("Invalid identifier: {:?}", name)))
    }
}

fn row_filter(query: &RowQuery) -> Result<(String, Vec<SqlValue>), StoreError> {
    let mut conditions = vec![];
    let mut values = vec![];

    for (column, value) in &query.equals {
        conditions.push(format!("\"{}\" = ?", identifier(column)?));
        values.push(sql_from_json(value));
    }
    if let Some((column, since)) = &query.since {
        conditions.push(format!("julianday(\"{}\") >= julianday(?)", identifier(column)?));
        values.push(SqlValue::Text(timestamp(since)));
    }

    let clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    Ok((clause, values))
}

fn sql_from_json(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn json_from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) | ValueRef::Blob(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    }
}

fn conversion_error<E>(row: &Row<'_>, column: &str, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    let index = row.as_ref().column_index(column).unwrap_or_default();
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

/// Enum columns hold the serde string form.
fn get_enum<T: DeserializeOwned>(row: &Row<'_>, column: &str) -> rusqlite::Result<T> {
    let text: String = row.get(column)?;
    serde_json::from_value(Value::String(text)).map_err(|e| conversion_error(row, column, e))
}

fn get_opt_enum<T: DeserializeOwned>(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(column)?;
    text.map(|t| serde_json::from_value(Value::String(t)))
        .transpose()
        .map_err(|e| conversion_error(row, column, e))
}

fn get_json(row: &Row<'_>, column: &str) -> rusqlite::Result<Value> {
    let text: Option<String> = row.get(column)?;
    match text {
        Some(t) => serde_json::from_str(&t).map_err(|e| conversion_error(row, column, e)),
        None => Ok(Value::Null),
    }
}

fn get_timestamp(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(row, column, e))
}

fn get_opt_timestamp(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(column)?;
    text.map(|t| DateTime::parse_from_rfc3339(&t).map(|ts| ts.with_timezone(&Utc)))
        .transpose()
        .map_err(|e| conversion_error(row, column, e))
}

fn constitution_from_row(row: &Row<'_>) -> rusqlite::Result<Constitution> {
    Ok(Constitution {
        id: row.get("id")?,
        code: row.get("code")?,
        name: row.get("name")?,
        domain: row.get("domain")?,
        enforcement_mode: get_enum(row, "enforcement_mode")?,
        is_active: row.get("is_active")?,
    })
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<Rule> {
    let depends_on = get_json(row, "depends_on_rules")?;
    Ok(Rule {
        id: row.get("id")?,
        constitution_id: row.get("constitution_id")?,
        rule_code: row.get("rule_code")?,
        rule_name: row.get("rule_name")?,
        description: row.get("description")?,
        category: row.get("category")?,
        severity: get_enum(row, "severity")?,
        enforcement_action: get_enum(row, "enforcement_action")?,
        validation_type: row.get("validation_type")?,
        validation_config: get_json(row, "validation_config")?,
        depends_on_rules: serde_json::from_value(depends_on)
            .map_err(|e| conversion_error(row, "depends_on_rules", e))?,
        is_active: row.get("is_active")?,
    })
}

fn violation_from_row(row: &Row<'_>) -> rusqlite::Result<Violation> {
    Ok(Violation {
        id: row.get("id")?,
        rule_id: row.get("rule_id")?,
        constitution_id: row.get("constitution_id")?,
        violation_type: row.get("violation_type")?,
        severity: get_enum(row, "severity")?,
        enforcement_action: get_opt_enum(row, "enforcement_action")?,
        message: row.get("message")?,
        actor_id: row.get("actor_id")?,
        operation_type: row.get("operation_type")?,
        target: row.get("target")?,
        work_item_key: row.get("work_item_key")?,
        payload: get_json(row, "payload")?,
        context_hash: row.get("context_hash")?,
        decision_id: row.get("decision_id")?,
        status: get_enum(row, "status")?,
        acknowledged_by: row.get("acknowledged_by")?,
        acknowledged_at: get_opt_timestamp(row, "acknowledged_at")?,
        override_justification: row.get("override_justification")?,
        overridden_by: row.get("overridden_by")?,
        overridden_at: get_opt_timestamp(row, "overridden_at")?,
        remediation_ref: row.get("remediation_ref")?,
        remediated_by: row.get("remediated_by")?,
        remediated_at: get_opt_timestamp(row, "remediated_at")?,
        created_at: get_timestamp(row, "created_at")?,
    })
}

fn fetch_violation(conn: &Connection, id: &str) -> Result<Option<Violation>, StoreError> {
    conn.query_row(
        "SELECT * FROM violations WHERE id = ?1",
        [id],
        violation_from_row,
    )
    .optional()
    .map_err(query_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis::{EnforcementAction, EnforcementMode, Severity, ValidationType};
    use serde_json::json;

    fn seeded() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_constitution(&Constitution::new("c2", "CONST-002", "Second"))
            .unwrap();
        store
            .insert_constitution(
                &Constitution::new("c1", "CONST-001", "First").with_mode(EnforcementMode::Advisory),
            )
            .unwrap();
        store
            .insert_rule(
                &Rule::new("r1", "c1", "R-B", ValidationType::FieldCheck)
                    .with_severity(Severity::Critical)
                    .with_action(EnforcementAction::BlockOverridable)
                    .with_config(json!({"required_fields": ["owner"]}))
                    .depends_on("r2"),
            )
            .unwrap();
        store
            .insert_rule(&Rule::new("r2", "c1", "R-A", ValidationType::Threshold).with_category("finance"))
            .unwrap();
        store
            .insert_rule(&Rule::new("r3", "c2", "R-C", ValidationType::Custom))
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_constitution_and_rule_roundtrip() {
        let store = seeded();

        let constitutions = store.list_constitutions().await.unwrap();
        assert_eq!(constitutions[0].code, "CONST-001");
        assert_eq!(constitutions[0].enforcement_mode, EnforcementMode::Advisory);

        let rules = store
            .list_rules(&RuleFilter::for_constitution("CONST-001"))
            .await
            .unwrap();
        let codes: Vec<_> = rules.iter().map(|r| r.rule_code.as_str()).collect();
        assert_eq!(codes, vec!["R-A", "R-B"]);
        assert_eq!(rules[1].depends_on_rules, vec!["r2"]);
        assert_eq!(rules[1].validation_config, json!({"required_fields": ["owner"]}));
        assert_eq!(rules[1].enforcement_action, EnforcementAction::BlockOverridable);

        let finance = store
            .list_rules(&RuleFilter::default().with_category("finance"))
            .await
            .unwrap();
        assert_eq!(finance.len(), 1);
        assert_eq!(finance[0].id, "r2");
    }

    #[tokio::test]
    async fn test_generic_rows() {
        let store = seeded();
        store
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TABLE feature_flags (flag_key TEXT, is_active INTEGER, created_at TEXT);",
                )
                .map_err(query_err)?;
                conn.execute(
                    "INSERT INTO feature_flags VALUES ('freeze', 1, ?1), ('freeze', 0, ?2)",
                    params![
                        timestamp(&Utc::now()),
                        timestamp(&(Utc::now() - chrono::Duration::days(2)))
                    ],
                )
                .map_err(query_err)?;
                Ok(())
            })
            .unwrap();

        let query = RowQuery::table("feature_flags").eq("flag_key", "freeze");
        assert_eq!(store.count_rows(&query).await.unwrap(), 2);

        let recent = query.clone().since("created_at", Utc::now() - chrono::Duration::hours(1));
        assert_eq!(store.count_rows(&recent).await.unwrap(), 1);

        let newest = store.find_row(&query).await.unwrap().unwrap();
        assert_eq!(newest["is_active"], json!(0));

        let active = RowQuery::table("feature_flags").eq("is_active", true);
        assert_eq!(store.count_rows(&active).await.unwrap(), 1);

        let hostile = RowQuery::table("feature_flags; DROP TABLE rules");
        assert!(matches!(
            store.count_rows(&hostile).await,
            Err(StoreError::InvalidQuery(_))
        ));
        assert!(store.count_rows(&RowQuery::table("missing_table")).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_rule_row_does_not_hide_others() {
        let store = seeded();
        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE rules SET enforcement_action = 'ESCALATE' WHERE id = 'r2'",
                    [],
                )
                .map_err(query_err)?;
                conn.execute(
                    "UPDATE rules SET validation_config = '{not json' WHERE id = 'r3'",
                    [],
                )
                .map_err(query_err)?;
                Ok(())
            })
            .unwrap();

        let rules = store.list_rules(&RuleFilter::default()).await.unwrap();
        let ids: Vec<_> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r2", "r1"]);
        assert_eq!(rules[0].enforcement_action, EnforcementAction::Unknown);
    }

    #[tokio::test]
    async fn test_rule_stats_upsert() {
        let store = seeded();
        store.increment_rule_stats("r1", RuleStatOutcome::Blocked).await.unwrap();
        store.increment_rule_stats("r1", RuleStatOutcome::Passed).await.unwrap();
        store.increment_rule_stats("r1", RuleStatOutcome::Blocked).await.unwrap();

        let stats = store.rule_stats("r1").unwrap().unwrap();
        assert_eq!(stats.times_blocked, 2);
        assert_eq!(stats.times_passed, 1);
        assert!(stats.last_evaluated_at.is_some());
        assert!(store.rule_stats("r9").unwrap().is_none());
    }

    #[test]
    fn test_identifier_validation() {
        assert!(identifier("system_halt_state").is_ok());
        assert!(identifier("_x1").is_ok());
        assert!(identifier("1abc").is_err());
        assert!(identifier("a\"b").is_err());
        assert!(identifier("").is_err());
    }
}
