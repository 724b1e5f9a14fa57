//! Constitution and rule loading.
//!
//! The loader reads from the governance store through a time-boxed cache and
//! falls back to a local snapshot when the store is unreachable or empty.
//! The cache is one immutable entry behind a lock: readers take the whole
//! entry at call start, writers swap in a new one, so `clear_cache` is safe
//! while other evaluations are in flight.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::AegisConfig;
use crate::fallback::FallbackSource;
use crate::store::{GovernanceStore, RuleFilter};
use crate::types::{Constitution, Rule};

/// A dependency cycle broken during ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleWarning {
    /// Rule reached again while its own dependencies were being resolved
    pub rule_id: String,
    pub rule_code: String,
    /// Rule whose dependency closed the cycle
    pub required_by: String,
}

/// Rules in evaluation order plus the cycles that were broken to get there.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderedRules {
    pub rules: Vec<Rule>,
    pub cycles: Vec<CycleWarning>,
}

impl OrderedRules {
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }
}

/// One cache generation. Constitutions and rules share a timestamp.
#[derive(Debug, Default)]
struct CacheEntry {
    cached_at: Option<Instant>,
    constitutions: Option<Arc<Vec<Constitution>>>,
    rules: Option<Arc<Vec<Rule>>>,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.cached_at
            .map(|at| at.elapsed() < ttl)
            .unwrap_or(false)
    }
}

/// Loads constitutions and rules with caching and snapshot fallback.
pub struct RuleLoader {
    store: Option<Arc<dyn GovernanceStore>>,
    fallback: FallbackSource,
    ttl: Duration,
    cache: RwLock<Arc<CacheEntry>>,
}

impl RuleLoader {
    /// Create a loader with default settings and no fallback.
    pub fn new(store: Arc<dyn GovernanceStore>) -> Self {
        Self::with_config(Some(store), &AegisConfig::default())
    }

    /// Create a loader that only reads the fallback snapshot.
    pub fn without_store() -> Self {
        Self::with_config(None, &AegisConfig::default())
    }

    /// Create a loader from engine configuration.
    pub fn with_config(store: Option<Arc<dyn GovernanceStore>>, config: &AegisConfig) -> Self {
        let fallback = match &config.fallback_path {
            Some(path) => FallbackSource::from_path(path),
            None => FallbackSource::none(),
        };
        Self {
            store,
            fallback,
            ttl: config.cache_ttl(),
            cache: RwLock::new(Arc::new(CacheEntry::default())),
        }
    }

    /// Builder: replace the fallback source.
    pub fn with_fallback(mut self, fallback: FallbackSource) -> Self {
        self.fallback = fallback;
        self
    }

    /// Builder: set the cache TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Active constitutions ordered by code.
    ///
    /// Returns an empty list only when neither the store nor the fallback
    /// snapshot has any.
    pub async fn load_constitutions(&self) -> Vec<Constitution> {
        let entry = self.cache.read().await.clone();
        if entry.is_fresh(self.ttl) {
            if let Some(cached) = &entry.constitutions {
                debug!(count = cached.len(), "Constitution cache hit");
                return cached.as_ref().clone();
            }
        }

        if let Some(store) = &self.store {
            match store.list_constitutions().await {
                Ok(list) if !list.is_empty() => {
                    let list = Arc::new(list);
                    self.replace_cache(Some(list.clone()), None).await;
                    return list.as_ref().clone();
                }
                Ok(_) => warn!("Store returned no constitutions, using fallback"),
                Err(e) => warn!(error = %e, "Failed to load constitutions, using fallback"),
            }
        } else {
            debug!("No governance store configured, using fallback");
        }

        match self.fallback.snapshot().await {
            Some(snapshot) => snapshot.active_constitutions(),
            None => {
                warn!("No constitutions available from store or fallback");
                Vec::new()
            }
        }
    }

    /// Active rules matching the filter.
    ///
    /// Unfiltered loads go through the cache. Filtered loads always hit the
    /// store; if it fails the filter is applied to the fallback snapshot.
    pub async fn load_rules(&self, filter: &RuleFilter) -> Vec<Rule> {
        if filter.is_empty() {
            return self.load_all_rules().await;
        }

        if let Some(store) = &self.store {
            match store.list_rules(filter).await {
                Ok(rules) => return rules,
                Err(e) => warn!(error = %e, ?filter, "Failed to load rules, using fallback"),
            }
        }

        match self.fallback.snapshot().await {
            Some(snapshot) => snapshot.rules_matching(filter),
            None => {
                warn!(?filter, "No rules available from store or fallback");
                Vec::new()
            }
        }
    }

    async fn load_all_rules(&self) -> Vec<Rule> {
        let entry = self.cache.read().await.clone();
        if entry.is_fresh(self.ttl) {
            if let Some(cached) = &entry.rules {
                debug!(count = cached.len(), "Rule cache hit");
                return cached.as_ref().clone();
            }
        }

        if let Some(store) = &self.store {
            match store.list_rules(&RuleFilter::default()).await {
                Ok(rules) if !rules.is_empty() => {
                    let rules = Arc::new(rules);
                    self.replace_cache(None, Some(rules.clone())).await;
                    return rules.as_ref().clone();
                }
                Ok(_) => warn!("Store returned no rules, using fallback"),
                Err(e) => warn!(error = %e, "Failed to load rules, using fallback"),
            }
        }

        match self.fallback.snapshot().await {
            Some(snapshot) => snapshot.rules_matching(&RuleFilter::default()),
            None => {
                warn!("No rules available from store or fallback");
                Vec::new()
            }
        }
    }

    /// Rules of one constitution, ordered so dependencies come first.
    pub async fn load_rules_with_dependencies(&self, constitution_code: &str) -> OrderedRules {
        let rules = self
            .load_rules(&RuleFilter::for_constitution(constitution_code))
            .await;
        let ordered = order_by_dependencies(rules);
        for cycle in &ordered.cycles {
            warn!(
                constitution = %constitution_code,
                rule_code = %cycle.rule_code,
                required_by = %cycle.required_by,
                "Circular rule dependency, ordering not guaranteed"
            );
        }
        ordered
    }

    /// Look up an active constitution by code.
    pub async fn get_constitution(&self, code: &str) -> Option<Constitution> {
        self.load_constitutions()
            .await
            .into_iter()
            .find(|c| c.code == code)
    }

    /// Whether the constitution exists and is not disabled.
    pub async fn is_constitution_enforced(&self, code: &str) -> bool {
        self.get_constitution(code)
            .await
            .map(|c| c.is_enforced())
            .unwrap_or(false)
    }

    /// Drop all cached state.
    pub async fn clear_cache(&self) {
        *self.cache.write().await = Arc::new(CacheEntry::default());
        debug!("Rule cache cleared");
    }

    /// Swap in a new entry. The other component survives only if the
    /// previous entry was still fresh.
    async fn replace_cache(
        &self,
        constitutions: Option<Arc<Vec<Constitution>>>,
        rules: Option<Arc<Vec<Rule>>>,
    ) {
        let mut cache = self.cache.write().await;
        let fresh = cache.is_fresh(self.ttl);
        let next = CacheEntry {
            cached_at: Some(Instant::now()),
            constitutions: constitutions
                .or_else(|| fresh.then(|| cache.constitutions.clone()).flatten()),
            rules: rules.or_else(|| fresh.then(|| cache.rules.clone()).flatten()),
        };
        *cache = Arc::new(next);
    }
}

/// Depth-first topological order over `depends_on_rules`.
///
/// Every rule appears after the rules it depends on, ties keep input order.
/// A rule reached again while still being resolved is treated as satisfied
/// and reported as a [`CycleWarning`]. Dependencies outside the set are ignored.
pub fn order_by_dependencies(rules: Vec<Rule>) -> OrderedRules {
    let (order, cycles) = {
        let mut walk = DependencyWalk {
            rules: &rules,
            index: rules
                .iter()
                .enumerate()
                .map(|(i, rule)| (rule.id.as_str(), i))
                .collect(),
            visiting: HashSet::new(),
            visited: HashSet::new(),
            order: Vec::with_capacity(rules.len()),
            cycles: Vec::new(),
        };
        for i in 0..rules.len() {
            walk.visit(i, None);
        }
        (walk.order, walk.cycles)
    };

    let mut slots: Vec<Option<Rule>> = rules.into_iter().map(Some).collect();
    let rules = order
        .into_iter()
        .filter_map(|i| slots.get_mut(i).and_then(Option::take))
        .collect();

    OrderedRules { rules, cycles }
}

struct DependencyWalk<'a> {
    rules: &'a [Rule],
    index: HashMap<&'a str, usize>,
    visiting: HashSet<usize>,
    visited: HashSet<usize>,
    order: Vec<usize>,
    cycles: Vec<CycleWarning>,
}

impl DependencyWalk<'_> {
    fn visit(&mut self, i: usize, required_by: Option<usize>) {
        let rules = self.rules;
        if self.visited.contains(&i) {
            return;
        }
        if self.visiting.contains(&i) {
            self.cycles.push(CycleWarning {
                rule_id: rules[i].id.clone(),
                rule_code: rules[i].rule_code.clone(),
                required_by: required_by
                    .map(|r| rules[r].id.clone())
                    .unwrap_or_default(),
            });
            return;
        }

        self.visiting.insert(i);
        for dep in &rules[i].depends_on_rules {
            let found = self.index.get(dep.as_str()).copied();
            match found {
                Some(d) => self.visit(d, Some(i)),
                None => debug!(
                    rule_code = %rules[i].rule_code,
                    dependency = %dep,
                    "Dependency not in rule set, ignoring"
                ),
            }
        }
        self.visiting.remove(&i);
        self.visited.insert(i);
        self.order.push(i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::FallbackSnapshot;
    use crate::store::{InMemoryStore, StoreOperation};
    use crate::types::ValidationType;

    fn rule(id: &str, deps: &[&str]) -> Rule {
        let mut rule = Rule::new(id, "c1", id.to_uppercase(), ValidationType::FieldCheck);
        rule.depends_on_rules = deps.iter().map(|d| d.to_string()).collect();
        rule
    }

    fn ids(ordered: &OrderedRules) -> Vec<&str> {
        ordered.rules.iter().map(|r| r.id.as_str()).collect()
    }

    fn store() -> Arc<InMemoryStore> {
        Arc::new(
            InMemoryStore::new()
                .with_constitution(Constitution::new("c1", "CONST-001", "First"))
                .with_rule(rule("a", &[]))
                .with_rule(rule("b", &["a"])),
        )
    }

    #[test]
    fn test_dependencies_come_first() {
        let ordered = order_by_dependencies(vec![
            rule("c", &["b"]),
            rule("a", &[]),
            rule("b", &["a"]),
            rule("d", &[]),
        ]);
        assert_eq!(ids(&ordered), vec!["a", "b", "c", "d"]);
        assert!(!ordered.has_cycles());
    }

    #[test]
    fn test_ties_keep_input_order() {
        let ordered = order_by_dependencies(vec![rule("z", &[]), rule("y", &[]), rule("x", &[])]);
        assert_eq!(ids(&ordered), vec!["z", "y", "x"]);
    }

    #[test]
    fn test_cycle_terminates_with_one_warning() {
        let ordered = order_by_dependencies(vec![
            rule("a", &["c"]),
            rule("b", &["a"]),
            rule("c", &["b"]),
        ]);
        assert_eq!(ordered.rules.len(), 3);
        assert_eq!(ordered.cycles.len(), 1);
        assert_eq!(ordered.cycles[0].rule_id, "a");
        assert_eq!(ordered.cycles[0].required_by, "b");
    }

    #[test]
    fn test_self_dependency_and_unknown_dependency() {
        let ordered = order_by_dependencies(vec![rule("a", &["a", "ghost"]), rule("b", &["a"])]);
        assert_eq!(ids(&ordered), vec!["a", "b"]);
        assert_eq!(ordered.cycles.len(), 1);
        assert_eq!(ordered.cycles[0].required_by, "a");
    }

    #[tokio::test]
    async fn test_constitutions_are_cached() {
        let store = store();
        let loader = RuleLoader::new(store.clone());

        assert_eq!(loader.load_constitutions().await.len(), 1);
        assert_eq!(loader.load_constitutions().await.len(), 1);
        assert_eq!(store.call_count(StoreOperation::ListConstitutions), 1);

        loader.clear_cache().await;
        loader.load_constitutions().await;
        assert_eq!(store.call_count(StoreOperation::ListConstitutions), 2);
    }

    #[tokio::test]
    async fn test_expired_cache_refetches() {
        let store = store();
        let loader = RuleLoader::new(store.clone()).with_ttl(Duration::ZERO);

        loader.load_rules(&RuleFilter::default()).await;
        loader.load_rules(&RuleFilter::default()).await;
        assert_eq!(store.call_count(StoreOperation::ListRules), 2);
    }

    #[tokio::test]
    async fn test_filtered_loads_bypass_cache() {
        let store = store();
        let loader = RuleLoader::new(store.clone());

        let filter = RuleFilter::for_constitution("CONST-001");
        assert_eq!(loader.load_rules(&filter).await.len(), 2);
        assert_eq!(loader.load_rules(&filter).await.len(), 2);
        assert_eq!(store.call_count(StoreOperation::ListRules), 2);
    }

    #[tokio::test]
    async fn test_falls_back_when_store_unavailable() {
        let store = store();
        store.set_available(false);

        let snapshot = FallbackSnapshot {
            constitutions: vec![Constitution::new("c9", "CONST-009", "Snapshot")],
            rules: vec![Rule::new("s1", "c9", "S1", ValidationType::Threshold)],
        };
        let loader = RuleLoader::new(store.clone())
            .with_fallback(FallbackSource::from_snapshot(snapshot));

        let constitutions = loader.load_constitutions().await;
        assert_eq!(constitutions[0].code, "CONST-009");

        let ordered = loader.load_rules_with_dependencies("CONST-009").await;
        assert_eq!(ids(&ordered), vec!["s1"]);

        // Fallback results are not cached
        store.set_available(true);
        assert_eq!(loader.load_constitutions().await[0].code, "CONST-001");
    }

    #[tokio::test]
    async fn test_no_sources_yields_empty() {
        let loader = RuleLoader::without_store();
        assert!(loader.load_constitutions().await.is_empty());
        assert!(loader.load_rules(&RuleFilter::default()).await.is_empty());
        assert!(!loader.is_constitution_enforced("CONST-001").await);
    }
}
