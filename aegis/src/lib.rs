//! AEGIS - Constitution Enforcement Engine
//!
//! Evaluates operations against named rule sets ("constitutions"):
//!
//! - **Rule loading**: TTL cache over the governance store, local snapshot fallback
//! - **Dependency ordering**: rules run after the rules they depend on
//! - **Validators**: field checks, thresholds, role rules, count limits, named checks
//! - **Audit trail**: append-only violation records with override workflow
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Enforcer                          │
//! │                                                          │
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────────┐  │
//! │  │ RuleLoader │──▶│ Validators │──▶│ ViolationRecorder│  │
//! │  └─────┬──────┘   └─────┬──────┘   └────────┬─────────┘  │
//! │        │                │                   │            │
//! │        └────────────────┼───────────────────┘            │
//! │                 ┌───────▼────────┐                       │
//! │                 │GovernanceStore │                       │
//! │                 └────────────────┘                       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use aegis::{Enforcer, EvalContext, InMemoryStore, ValidateOptions};
//!
//! # async fn run() {
//! let enforcer = Enforcer::new(Arc::new(InMemoryStore::new()));
//! let ctx = EvalContext::new().with("actor_id", "agent-7").with("operation_type", "deploy");
//!
//! match enforcer.enforce("CONST-001", &ctx, ValidateOptions::default()).await {
//!     Ok(decision) => println!("allowed ({} rules)", decision.rules_evaluated),
//!     Err(blocked) => println!("blocked: {}", blocked),
//! }
//! # }
//! ```

pub mod config;
pub mod context;
pub mod decision;
pub mod enforcer;
pub mod error;
pub mod fallback;
pub mod loader;
pub mod recorder;
pub mod store;
pub mod types;
pub mod validators;

// Re-export main types
pub use config::{AegisConfig, ValidateOptions};
pub use context::EvalContext;
pub use decision::{AggregateDecision, Decision, OverrideOutcome, OverrideResult, RuleViolation};
pub use enforcer::Enforcer;
pub use error::{ConfigError, EnforcementError, RecorderError, StoreError, ValidatorError};
pub use fallback::{FallbackSnapshot, FallbackSource};
pub use loader::{order_by_dependencies, CycleWarning, OrderedRules, RuleLoader};
pub use recorder::{RecordOutcome, ViolationRecorder, ViolationStats};
pub use store::{GovernanceStore, InMemoryStore, RowQuery, RuleFilter, ViolationQuery};
pub use types::*;
pub use validators::{Validator, ValidatorRegistry};
