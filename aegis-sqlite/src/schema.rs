//! Database schema definitions

use aegis::StoreError;
use rusqlite::Connection;
use tracing::info;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating governance schema v{}", SCHEMA_VERSION);
        conn.execute_batch(GOVERNANCE_SCHEMA)
            .map_err(|e| StoreError::QueryFailed(format!("Failed to create tables: {}", e)))?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Governance schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Current schema version, 0 if not initialized
pub fn get_schema_version(conn: &Connection) -> Result<i32, StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| StoreError::QueryFailed(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StoreError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| StoreError::QueryFailed(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| StoreError::QueryFailed(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

/// Constitutions, rules, violations and rule counters.
///
/// Timestamps are RFC 3339 text; JSON columns hold serialized objects/arrays.
const GOVERNANCE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS constitutions (
    id TEXT PRIMARY KEY,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    domain TEXT,
    enforcement_mode TEXT NOT NULL DEFAULT 'enforced',
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS rules (
    id TEXT PRIMARY KEY,
    constitution_id TEXT NOT NULL REFERENCES constitutions(id),
    rule_code TEXT NOT NULL UNIQUE,
    rule_name TEXT NOT NULL,
    description TEXT,
    category TEXT,
    severity TEXT NOT NULL,
    enforcement_action TEXT NOT NULL,
    validation_type TEXT NOT NULL,
    validation_config TEXT NOT NULL DEFAULT '{}',
    depends_on_rules TEXT NOT NULL DEFAULT '[]',
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS violations (
    id TEXT PRIMARY KEY,
    rule_id TEXT NOT NULL,
    constitution_id TEXT NOT NULL,
    violation_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    enforcement_action TEXT,
    message TEXT NOT NULL,
    actor_id TEXT,
    operation_type TEXT,
    target TEXT,
    work_item_key TEXT,
    payload TEXT NOT NULL DEFAULT 'null',
    context_hash TEXT,
    decision_id TEXT,
    status TEXT NOT NULL DEFAULT 'open',
    acknowledged_by TEXT,
    acknowledged_at TEXT,
    override_justification TEXT,
    overridden_by TEXT,
    overridden_at TEXT,
    remediation_ref TEXT,
    remediated_by TEXT,
    remediated_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rule_stats (
    rule_id TEXT PRIMARY KEY,
    times_passed INTEGER NOT NULL DEFAULT 0,
    times_blocked INTEGER NOT NULL DEFAULT 0,
    last_evaluated_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_rules_constitution ON rules(constitution_id);
CREATE INDEX IF NOT EXISTS idx_violations_status ON violations(status);
CREATE INDEX IF NOT EXISTS idx_violations_created ON violations(created_at);
CREATE INDEX IF NOT EXISTS idx_violations_work_item ON violations(work_item_key);
"#;
