//! Local fallback snapshot.
//!
//! A JSON file shaped like the store rows (`{constitutions: [...], rules: [...]}`)
//! that the loader reads when the store is unreachable or empty. The file is
//! read lazily at most once per source and kept in memory afterwards.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::store::RuleFilter;
use crate::types::{Constitution, Rule};

/// Constitutions and rules in store-row shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackSnapshot {
    #[serde(default, deserialize_with = "skip_undecodable")]
    pub constitutions: Vec<Constitution>,
    #[serde(default, deserialize_with = "skip_undecodable")]
    pub rules: Vec<Rule>,
}

/// Decode entries one by one so a bad entry only drops itself.
fn skip_undecodable<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Vec::<Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|entry| match serde_json::from_value(entry) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(error = %e, "Skipping undecodable fallback entry");
                None
            }
        })
        .collect())
}

impl FallbackSnapshot {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Active constitutions ordered by code, matching the store contract.
    pub fn active_constitutions(&self) -> Vec<Constitution> {
        let mut list: Vec<Constitution> = self
            .constitutions
            .iter()
            .filter(|c| c.is_active)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.code.cmp(&b.code));
        list
    }

    /// Active rules matching the filter, ordered by rule code.
    pub fn rules_matching(&self, filter: &RuleFilter) -> Vec<Rule> {
        let codes: HashMap<&str, &str> = self
            .constitutions
            .iter()
            .map(|c| (c.id.as_str(), c.code.as_str()))
            .collect();

        let mut rules: Vec<Rule> = self
            .rules
            .iter()
            .filter(|r| r.is_active)
            .filter(|r| filter.matches(r, codes.get(r.constitution_id.as_str()).copied()))
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.rule_code.cmp(&b.rule_code));
        rules
    }
}

/// Lazily loaded fallback snapshot.
pub struct FallbackSource {
    path: Option<PathBuf>,
    snapshot: OnceCell<Option<Arc<FallbackSnapshot>>>,
}

impl FallbackSource {
    /// No fallback.
    pub fn none() -> Self {
        Self {
            path: None,
            snapshot: OnceCell::new(),
        }
    }

    /// Read from a file on first use.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            snapshot: OnceCell::new(),
        }
    }

    /// Use an in-memory snapshot.
    pub fn from_snapshot(snapshot: FallbackSnapshot) -> Self {
        Self {
            path: None,
            snapshot: OnceCell::new_with(Some(Some(Arc::new(snapshot)))),
        }
    }

    /// The snapshot, loading it on first call. Load failures are remembered.
    pub async fn snapshot(&self) -> Option<Arc<FallbackSnapshot>> {
        self.snapshot
            .get_or_init(|| async {
                let path = self.path.as_ref()?;
                match tokio::fs::read_to_string(path).await {
                    Ok(json) => match FallbackSnapshot::from_json(&json) {
                        Ok(snapshot) => {
                            debug!(
                                path = %path.display(),
                                constitutions = snapshot.constitutions.len(),
                                rules = snapshot.rules.len(),
                                "Loaded fallback snapshot"
                            );
                            Some(Arc::new(snapshot))
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Invalid fallback snapshot");
                            None
                        }
                    },
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Fallback snapshot unreadable");
                        None
                    }
                }
            })
            .await
            .clone()
    }
}

impl Default for FallbackSource {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnforcementAction;
    use serde_json::json;

    fn snapshot_json() -> String {
        json!({
            "constitutions": [
                {"id": "c2", "code": "CONST-002", "name": "Second", "enforcement_mode": "advisory"},
                {"id": "c1", "code": "CONST-001", "name": "First"}
            ],
            "rules": [
                {"id": "r1", "constitution_id": "c1", "rule_code": "R1", "rule_name": "One",
                 "severity": "HIGH", "enforcement_action": "BLOCK", "validation_type": "field_check",
                 "category": "safety"},
                {"id": "r2", "constitution_id": "c2", "rule_code": "R2", "rule_name": "Two",
                 "severity": "LOW", "enforcement_action": "WARN_AND_LOG", "validation_type": "threshold"}
            ]
        })
        .to_string()
    }

    #[test]
    fn test_snapshot_filters() {
        let snapshot = FallbackSnapshot::from_json(&snapshot_json()).unwrap();
        let codes: Vec<_> = snapshot
            .active_constitutions()
            .into_iter()
            .map(|c| c.code)
            .collect();
        assert_eq!(codes, vec!["CONST-001", "CONST-002"]);

        let rules = snapshot.rules_matching(&RuleFilter::for_constitution("CONST-002"));
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "r2");

        let rules = snapshot.rules_matching(&RuleFilter::default().with_category("safety"));
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "r1");
    }

    #[test]
    fn test_bad_rule_only_drops_itself() {
        let snapshot = FallbackSnapshot::from_json(
            &json!({
                "constitutions": [{"id": "c1", "code": "CONST-001", "name": "First"}],
                "rules": [
                    {"id": "r1", "constitution_id": "c1", "rule_code": "R1", "rule_name": "One",
                     "severity": "HIGH", "enforcement_action": "BLOCK", "validation_type": "field_check"},
                    {"id": "r2", "constitution_id": "c1", "rule_code": "R2", "rule_name": "Two",
                     "severity": "HIGH", "enforcement_action": "ESCALATE", "validation_type": "field_check"},
                    {"id": "r3", "constitution_id": "c1", "rule_code": "R3"}
                ]
            })
            .to_string(),
        )
        .unwrap();

        let rules = snapshot.rules_matching(&RuleFilter::for_constitution("CONST-001"));
        let ids: Vec<_> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
        assert_eq!(rules[1].enforcement_action, EnforcementAction::Unknown);
    }

    #[tokio::test]
    async fn test_source_loads_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(&path, snapshot_json()).unwrap();

        let source = FallbackSource::from_path(&path);
        let first = source.snapshot().await.unwrap();
        assert_eq!(first.rules.len(), 2);

        // Removing the file does not matter once loaded
        std::fs::remove_file(&path).unwrap();
        let second = source.snapshot().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_missing_file_yields_none() {
        let source = FallbackSource::from_path("/nonexistent/aegis-snapshot.json");
        assert!(source.snapshot().await.is_none());
        assert!(FallbackSource::none().snapshot().await.is_none());
    }
}
