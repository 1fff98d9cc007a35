//! Configuration types
//!
//! Configuration is loaded from environment variables with defaults suited
//! to a single developer machine running a local store.

use crate::{ConfigError, NodeId};
use std::time::Duration;

// ============================================================================
// CACHE CONFIGURATION
// ============================================================================

/// Tuning for the cache engine on one node.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Namespace prepended to every store key and channel.
    pub key_prefix: String,
    /// TTL applied when a write does not specify one.
    pub default_ttl: Duration,
    /// Lifetime of a stampede lock.
    pub lock_ttl: Duration,
    /// How long a peer's delete keeps a key provisionally stale.
    pub pending_window: Duration,
    /// Age ratio at which `get_with_auto_refresh` recomputes in the background.
    pub refresh_threshold: f64,
    /// Lower bound of the jittered wait after losing a lock race.
    pub lock_retry_min: Duration,
    /// Upper bound of the jittered wait after losing a lock race.
    pub lock_retry_max: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "meridian".to_string(),
            default_ttl: Duration::from_secs(300),
            lock_ttl: Duration::from_secs(30),
            pending_window: Duration::from_secs(5),
            refresh_threshold: 0.8,
            lock_retry_min: Duration::from_millis(50),
            lock_retry_max: Duration::from_millis(150),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_pending_window(mut self, window: Duration) -> Self {
        self.pending_window = window;
        self
    }

    pub fn with_refresh_threshold(mut self, threshold: f64) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    pub fn with_lock_retry(mut self, min: Duration, max: Duration) -> Self {
        self.lock_retry_min = min;
        self.lock_retry_max = max;
        self
    }

    /// Load from environment variables.
    ///
    /// - `MERIDIAN_KEY_PREFIX` (default: meridian)
    /// - `MERIDIAN_DEFAULT_TTL_SECS` (default: 300)
    /// - `MERIDIAN_LOCK_TTL_SECS` (default: 30)
    /// - `MERIDIAN_PENDING_WINDOW_MS` (default: 5000)
    /// - `MERIDIAN_REFRESH_THRESHOLD` (default: 0.8)
    /// - `MERIDIAN_LOCK_RETRY_MIN_MS` / `MERIDIAN_LOCK_RETRY_MAX_MS` (default: 50 / 150)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            key_prefix: std::env::var("MERIDIAN_KEY_PREFIX")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.key_prefix),
            default_ttl: env_parse("MERIDIAN_DEFAULT_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_ttl),
            lock_ttl: env_parse("MERIDIAN_LOCK_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_ttl),
            pending_window: env_parse("MERIDIAN_PENDING_WINDOW_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.pending_window),
            refresh_threshold: env_parse("MERIDIAN_REFRESH_THRESHOLD")
                .unwrap_or(defaults.refresh_threshold),
            lock_retry_min: env_parse("MERIDIAN_LOCK_RETRY_MIN_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_retry_min),
            lock_retry_max: env_parse("MERIDIAN_LOCK_RETRY_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_retry_max),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "key_prefix".to_string(),
            });
        }
        if self.default_ttl.is_zero() {
            return Err(invalid("default_ttl", &self.default_ttl, "must be positive"));
        }
        if self.lock_ttl.is_zero() {
            return Err(invalid("lock_ttl", &self.lock_ttl, "must be positive"));
        }
        if !(self.refresh_threshold > 0.0 && self.refresh_threshold <= 1.0) {
            return Err(invalid(
                "refresh_threshold",
                &self.refresh_threshold,
                "must be within (0, 1]",
            ));
        }
        if self.lock_retry_min > self.lock_retry_max {
            return Err(invalid(
                "lock_retry_min",
                &self.lock_retry_min,
                "must not exceed lock_retry_max",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// STORE CONFIGURATION
// ============================================================================

/// Connection parameters for the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    pub connect_timeout: Duration,
    /// Capacity of the in-process broadcast buffer per subscriber.
    pub channel_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout: Duration::from_secs(5),
            channel_capacity: 1024,
        }
    }
}

impl StoreConfig {
    /// Load from environment variables.
    ///
    /// - `MERIDIAN_STORE_URL`, falling back to `REDIS_URL`
    /// - `MERIDIAN_STORE_CONNECT_TIMEOUT_SECS` (default: 5)
    /// - `MERIDIAN_CHANNEL_CAPACITY` (default: 1024)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("MERIDIAN_STORE_URL")
                .or_else(|_| std::env::var("REDIS_URL"))
                .unwrap_or(defaults.url),
            connect_timeout: env_parse("MERIDIAN_STORE_CONNECT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            channel_capacity: env_parse("MERIDIAN_CHANNEL_CAPACITY")
                .unwrap_or(defaults.channel_capacity),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "store.url".to_string(),
            });
        }
        if self.channel_capacity == 0 {
            return Err(invalid("channel_capacity", &0, "must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// NODE CONFIGURATION
// ============================================================================

/// Everything one node needs to join the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    /// How often the node binary logs cache statistics.
    pub stats_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::random(),
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            stats_interval: Duration::from_secs(60),
        }
    }
}

impl NodeConfig {
    /// Load from environment variables.
    ///
    /// - `NODE_ID` or `MERIDIAN_NODE_ID` (random if unset)
    /// - `MERIDIAN_STATS_INTERVAL_SECS` (default: 60)
    /// - plus everything read by [`StoreConfig::from_env`] and
    ///   [`CacheConfig::from_env`]
    pub fn from_env() -> Self {
        let node_id = std::env::var("NODE_ID")
            .or_else(|_| std::env::var("MERIDIAN_NODE_ID"))
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(NodeId::new)
            .unwrap_or_else(NodeId::random);

        Self {
            node_id,
            store: StoreConfig::from_env(),
            cache: CacheConfig::from_env(),
            stats_interval: env_parse("MERIDIAN_STATS_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(60)),
        }
    }

    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.as_str().trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "node_id".to_string(),
            });
        }
        self.store.validate()?;
        self.cache.validate()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn invalid(field: &str, value: &dyn std::fmt::Debug, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: format!("{:?}", value),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.default_ttl, Duration::from_secs(300));
        assert_eq!(config.lock_ttl, Duration::from_secs(30));
        assert_eq!(config.pending_window, Duration::from_secs(5));
        assert!((config.refresh_threshold - 0.8).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_config_builder() {
        let config = CacheConfig::new()
            .with_key_prefix("svc")
            .with_default_ttl(Duration::from_secs(60))
            .with_lock_ttl(Duration::from_secs(5))
            .with_pending_window(Duration::from_millis(250))
            .with_refresh_threshold(0.5)
            .with_lock_retry(Duration::from_millis(1), Duration::from_millis(2));

        assert_eq!(config.key_prefix, "svc");
        assert_eq!(config.default_ttl, Duration::from_secs(60));
        assert_eq!(config.lock_ttl, Duration::from_secs(5));
        assert_eq!(config.pending_window, Duration::from_millis(250));
        assert_eq!(config.lock_retry_max, Duration::from_millis(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_config_rejects_bad_threshold() {
        let err = CacheConfig::new()
            .with_refresh_threshold(1.5)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "refresh_threshold"));
    }

    #[test]
    fn test_cache_config_rejects_inverted_retry_window() {
        let err = CacheConfig::new()
            .with_lock_retry(Duration::from_millis(200), Duration::from_millis(100))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_node_config_validates_nested() {
        let config = NodeConfig::default().with_cache(CacheConfig::new().with_default_ttl(Duration::ZERO));
        assert!(config.validate().is_err());

        let config = NodeConfig::default().with_node_id(NodeId::new(" "));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired { .. })
        ));
    }
}
