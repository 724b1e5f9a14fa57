//! Configuration for the enforcement engine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AegisConfig {
    /// Constitution/rule cache lifetime (seconds)
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Local snapshot used when the store is unreachable
    #[serde(default)]
    pub fallback_path: Option<PathBuf>,
    /// Minimum override justification length (characters)
    #[serde(default = "default_min_justification_len")]
    pub min_justification_len: usize,
    /// Persist failed rules unless the caller opts out
    #[serde(default = "default_true")]
    pub record_violations: bool,
    /// Tally per-rule pass/block counters unless the caller opts out
    #[serde(default = "default_true")]
    pub increment_stats: bool,
    /// Page size for violation queries without an explicit limit
    #[serde(default = "default_query_limit")]
    pub default_query_limit: usize,
}

fn default_cache_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_min_justification_len() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_query_limit() -> usize {
    50
}

impl Default for AegisConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            fallback_path: None,
            min_justification_len: default_min_justification_len(),
            record_violations: true,
            increment_stats: true,
            default_query_limit: default_query_limit(),
        }
    }
}

impl AegisConfig {
    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Load config from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Builder: set the fallback snapshot path.
    pub fn with_fallback_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.fallback_path = Some(path.into());
        self
    }

    /// Builder: set the cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_secs = ttl.as_secs();
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Per-call options seeded from this config.
    pub fn default_options(&self) -> ValidateOptions {
        ValidateOptions {
            record_violations: self.record_violations,
            increment_stats: self.increment_stats,
        }
    }
}

/// Per-call evaluation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateOptions {
    /// Persist failed rules as violations
    pub record_violations: bool,
    /// Fire best-effort pass/block counter increments
    pub increment_stats: bool,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            record_violations: true,
            increment_stats: true,
        }
    }
}

impl ValidateOptions {
    /// Evaluate without touching the store beyond reads.
    pub fn dry_run() -> Self {
        Self {
            record_violations: false,
            increment_stats: false,
        }
    }
}
