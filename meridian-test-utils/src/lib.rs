//! MERIDIAN Test Utilities
//!
//! Shared test infrastructure for the MERIDIAN workspace:
//! - Proptest generators for keys, tags, options, and payloads
//! - Fixtures for configuration and stores driven by a manual clock
//! - [`TestCluster`]: several cache nodes over one in-memory store
//! - Custom assertions for MERIDIAN error kinds

pub use meridian_cache::{CacheCore, PropagationHandle};
pub use meridian_core::{
    CacheConfig, CacheError, ConfigError, ManualClock, MeridianError, MeridianResult, NodeId,
    SetOptions, StoreError, Version,
};
pub use meridian_store::InMemoryStore;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Value type used throughout the cache tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPayload {
    pub id: u64,
    pub name: String,
    pub scores: Vec<i32>,
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating MERIDIAN inputs.

    use super::*;
    use proptest::prelude::*;

    /// Generate a cache key such as `user:42` or `orders:eu:7`.
    ///
    /// Keys never contain glob metacharacters.
    pub fn arb_key() -> impl Strategy<Value = String> {
        "[a-z]{1,8}(:[a-z0-9]{1,6}){0,2}"
    }

    /// Generate a distinct set of keys.
    pub fn arb_keys(max: usize) -> impl Strategy<Value = Vec<String>> {
        prop::collection::btree_set(arb_key(), 1..=max).prop_map(|keys| keys.into_iter().collect())
    }

    /// Generate a tag name.
    pub fn arb_tag() -> impl Strategy<Value = String> {
        "[a-z]{1,6}"
    }

    /// Generate up to `max` distinct tags.
    pub fn arb_tags(max: usize) -> impl Strategy<Value = Vec<String>> {
        prop::collection::btree_set(arb_tag(), 0..=max).prop_map(|tags| tags.into_iter().collect())
    }

    /// Generate a TTL between one second and one day.
    pub fn arb_ttl() -> impl Strategy<Value = Duration> {
        (1u64..=86_400).prop_map(Duration::from_secs)
    }

    /// Generate write options with a TTL and tags.
    pub fn arb_set_options() -> impl Strategy<Value = SetOptions> {
        (arb_ttl(), arb_tags(3)).prop_map(|(ttl, tags)| SetOptions::new().with_ttl(ttl).with_tags(tags))
    }

    /// Generate a structured payload.
    pub fn arb_payload() -> impl Strategy<Value = TestPayload> {
        (
            any::<u64>(),
            "[ -~]{0,32}",
            prop::collection::vec(any::<i32>(), 0..8),
        )
            .prop_map(|(id, name, scores)| TestPayload { id, name, scores })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common testing scenarios.

    use super::*;

    /// Configuration with short windows so tests stay fast.
    pub fn test_config() -> CacheConfig {
        CacheConfig::default()
            .with_default_ttl(Duration::from_secs(300))
            .with_lock_ttl(Duration::from_secs(5))
            .with_pending_window(Duration::from_secs(5))
            .with_lock_retry(Duration::from_millis(10), Duration::from_millis(20))
    }

    /// An in-memory store and the manual clock driving it.
    pub fn manual_store() -> (Arc<InMemoryStore>, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        (store, clock)
    }

    /// A single cache node over its own manual-clock store.
    pub fn single_node() -> (CacheCore<InMemoryStore>, ManualClock) {
        let (store, clock) = manual_store();
        let cache = node_over(store, &clock, "node-0", test_config())
            .unwrap_or_else(|e| panic!("test config rejected: {e}"));
        (cache, clock)
    }

    /// A cache node sharing `store` and `clock`.
    pub fn node_over(
        store: Arc<InMemoryStore>,
        clock: &ManualClock,
        node_id: &str,
        config: CacheConfig,
    ) -> MeridianResult<CacheCore<InMemoryStore>> {
        CacheCore::with_clock(store, NodeId::new(node_id), config, Arc::new(clock.clone()))
    }

    pub fn sample_payload(id: u64) -> TestPayload {
        TestPayload {
            id,
            name: format!("item-{id}"),
            scores: vec![1, 2, 3],
        }
    }
}

// ============================================================================
// TEST CLUSTER
// ============================================================================

/// Several cache nodes sharing one in-memory store and one manual clock,
/// each with propagation running.
///
/// Must be created inside a Tokio runtime. Propagation stops when the
/// cluster is dropped.
pub struct TestCluster {
    pub store: Arc<InMemoryStore>,
    pub clock: ManualClock,
    nodes: Vec<CacheCore<InMemoryStore>>,
    _handles: Vec<PropagationHandle>,
}

impl TestCluster {
    /// Start `size` nodes named `node-0`, `node-1`, ...
    pub async fn start(size: usize) -> MeridianResult<Self> {
        Self::start_with_config(size, fixtures::test_config()).await
    }

    pub async fn start_with_config(size: usize, config: CacheConfig) -> MeridianResult<Self> {
        let (store, clock) = fixtures::manual_store();
        let mut nodes = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let node =
                fixtures::node_over(store.clone(), &clock, &format!("node-{i}"), config.clone())?;
            handles.push(node.start_propagation().await?);
            nodes.push(node);
        }
        Ok(Self {
            store,
            clock,
            nodes,
            _handles: handles,
        })
    }

    /// Node `index`. Panics if out of range.
    pub fn node(&self, index: usize) -> &CacheCore<InMemoryStore> {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[CacheCore<InMemoryStore>] {
        &self.nodes
    }

    /// Give background propagation tasks time to drain their subscriptions.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for MERIDIAN error kinds.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &MeridianResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_store_error<T: std::fmt::Debug>(result: &MeridianResult<T>) {
        match result {
            Err(MeridianError::Store(_)) => {}
            other => panic!("Expected Store error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_cache_error<T: std::fmt::Debug>(result: &MeridianResult<T>) {
        match result {
            Err(MeridianError::Cache(_)) => {}
            other => panic!("Expected Cache error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &MeridianResult<T>) {
        match result {
            Err(MeridianError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
