//! SQLite persistence for the aegis enforcement engine.
//!
//! Provides [`SqliteStore`], a [`GovernanceStore`](aegis::GovernanceStore)
//! over a single local database file:
//!
//! - `constitutions` and `rules` hold the policy definitions
//! - `violations` is the append-only audit table
//! - `rule_stats` holds pass/block counters
//!
//! Any other table in the same database can be read by `count_limit` rules
//! and named checks through the generic row queries.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use aegis::Enforcer;
//! use aegis_sqlite::SqliteStore;
//!
//! # fn main() -> Result<(), aegis::StoreError> {
//! let store = Arc::new(SqliteStore::open("governance.db")?);
//! let enforcer = Enforcer::new(store);
//! # Ok(())
//! # }
//! ```

pub mod schema;
mod store;

pub use store::SqliteStore;
