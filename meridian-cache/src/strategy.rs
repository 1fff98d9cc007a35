//! Per-key consistency policy.
//!
//! Rules map glob patterns to a [`ConsistencyLevel`]; the first registered
//! rule that matches a key wins, otherwise the default level applies.
//!
//! | level      | reads                                   | writes              |
//! |------------|-----------------------------------------|---------------------|
//! | `Strong`   | reconcile with the version table first  | announced           |
//! | `Eventual` | standard checks                         | announced           |
//! | `Weak`     | skip pending and version checks         | not announced       |

use std::fmt;

use meridian_core::{GlobPattern, MeridianResult, SetOptions, Version};
use meridian_store::KeyValueStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::{CacheCore, ReadChecks};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    Strong,
    #[default]
    Eventual,
    Weak,
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsistencyLevel::Strong => "strong",
            ConsistencyLevel::Eventual => "eventual",
            ConsistencyLevel::Weak => "weak",
        };
        f.write_str(name)
    }
}

/// Routes cache operations through the consistency level of each key.
pub struct ConsistencyStrategyManager<S: KeyValueStore> {
    cache: CacheCore<S>,
    rules: Vec<(GlobPattern, ConsistencyLevel)>,
    default: ConsistencyLevel,
}

impl<S: KeyValueStore> ConsistencyStrategyManager<S> {
    pub fn new(cache: CacheCore<S>) -> Self {
        Self {
            cache,
            rules: Vec::new(),
            default: ConsistencyLevel::default(),
        }
    }

    pub fn with_default(mut self, level: ConsistencyLevel) -> Self {
        self.default = level;
        self
    }

    /// Add a rule. Earlier rules take precedence.
    pub fn with_rule(mut self, pattern: &str, level: ConsistencyLevel) -> MeridianResult<Self> {
        self.rules.push((GlobPattern::new(pattern)?, level));
        Ok(self)
    }

    pub fn cache(&self) -> &CacheCore<S> {
        &self.cache
    }

    /// Level that applies to `key`.
    pub fn level_for(&self, key: &str) -> ConsistencyLevel {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.matches(key))
            .map(|(_, level)| *level)
            .unwrap_or(self.default)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.level_for(key) {
            ConsistencyLevel::Strong => {
                if let Err(e) = self.cache.force_sync(key).await {
                    tracing::warn!(key, error = %e, "Strong read could not reconcile version");
                    return None;
                }
                self.cache.get_checked(key, ReadChecks::FULL).await
            }
            ConsistencyLevel::Eventual => self.cache.get_checked(key, ReadChecks::FULL).await,
            ConsistencyLevel::Weak => self.cache.get_checked(key, ReadChecks::RELAXED).await,
        }
    }

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> MeridianResult<Version> {
        let options = match self.level_for(key) {
            ConsistencyLevel::Weak => options.skip_eventual_consistency(),
            ConsistencyLevel::Strong | ConsistencyLevel::Eventual => options,
        };
        self.cache.set(key, value, options).await
    }

    pub async fn delete(&self, key: &str) -> MeridianResult<bool> {
        self.cache.delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{CacheConfig, ManualClock, NodeId};
    use meridian_store::InMemoryStore;
    use std::sync::Arc;

    fn manager() -> ConsistencyStrategyManager<InMemoryStore> {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let cache = CacheCore::with_clock(
            store,
            NodeId::new("n1"),
            CacheConfig::default(),
            Arc::new(clock),
        )
        .unwrap();
        ConsistencyStrategyManager::new(cache)
            .with_rule("session:*", ConsistencyLevel::Weak)
            .unwrap()
            .with_rule("account:*", ConsistencyLevel::Strong)
            .unwrap()
            .with_rule("*", ConsistencyLevel::Weak)
            .unwrap()
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let manager = manager();
        assert_eq!(manager.level_for("session:1"), ConsistencyLevel::Weak);
        assert_eq!(manager.level_for("account:1"), ConsistencyLevel::Strong);
        assert_eq!(manager.level_for("anything"), ConsistencyLevel::Weak);
    }

    #[test]
    fn test_default_level_without_rules() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let cache =
            CacheCore::with_clock(store, NodeId::new("n1"), CacheConfig::default(), Arc::new(clock))
                .unwrap();
        let manager = ConsistencyStrategyManager::new(cache).with_default(ConsistencyLevel::Strong);
        assert_eq!(manager.level_for("k"), ConsistencyLevel::Strong);
        assert_eq!(manager.level_for("k").to_string(), "strong");
    }

    #[tokio::test]
    async fn test_weak_reads_skip_pending_check() {
        let manager = manager();
        manager.set("session:1", &"abc", SetOptions::new()).await.unwrap();
        manager.cache().mark_stale("session:1");

        assert_eq!(manager.get::<String>("session:1").await, Some("abc".to_string()));
        assert_eq!(manager.cache().get::<String>("session:1").await, None);
    }

    #[tokio::test]
    async fn test_strong_reads_reconcile_first() {
        let manager = manager();
        manager.set("account:1", &10, SetOptions::new()).await.unwrap();

        let mut batch = meridian_store::Batch::new();
        batch.hash_set(
            "meridian:versions",
            vec![("account:1".to_string(), "newer".to_string())],
        );
        manager.cache().store().execute(batch).await.unwrap();

        assert_eq!(manager.get::<i32>("account:1").await, None);
        assert!(!manager.cache().store().contains_key("meridian:data:account:1"));
    }

    #[tokio::test]
    async fn test_invalid_rule_pattern() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let cache =
            CacheCore::with_clock(store, NodeId::new("n1"), CacheConfig::default(), Arc::new(clock))
                .unwrap();
        assert!(ConsistencyStrategyManager::new(cache)
            .with_rule("[z-a]", ConsistencyLevel::Weak)
            .is_err());
    }
}
