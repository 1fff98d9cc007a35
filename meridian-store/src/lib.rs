//! MERIDIAN Store - Shared Key-Value Store Contract
//!
//! Defines the collaborator contract the cache engine needs from the shared
//! store: string values with expiry, hashes, sets, atomic batches,
//! publish/subscribe, pattern scans, and introspection.
//!
//! Two implementations are provided:
//! - [`InMemoryStore`]: single-process store for tests and local development.
//!   Every node built over the same instance sees the same data and channels.
//! - `RedisStore` (feature `redis`): the production backend.

pub mod command;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use command::{Batch, Command, Reply};
pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

use async_trait::async_trait;
use futures_util::Stream;
use meridian_core::StoreError;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Stream of messages for the channels a caller subscribed to.
///
/// The stream ends when the underlying connection closes.
pub type Subscription = Pin<Box<dyn Stream<Item = StoreMessage> + Send>>;

/// Introspection snapshot of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreInfo {
    /// Backend identifier, e.g. `memory` or `redis`.
    pub backend: String,
    /// Total keys in the database (all namespaces).
    pub key_count: u64,
    /// Backend-specific details.
    pub details: HashMap<String, String>,
}

/// The shared store contract.
///
/// Implementations must be safe to share between tasks and between every
/// cache node that talks to the same database. All keys support expiry.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Read a string value.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Write a string value, optionally expiring.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<()>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Write `value` only if `key` does not exist. Returns whether it was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Remove `key` only if its current value equals `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Read every field of a hash. Missing keys yield an empty map.
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Read one field of a hash.
    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Members of a set. Missing keys yield an empty list.
    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Every key matching a glob pattern.
    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Execute a batch atomically, returning one reply per command.
    async fn execute(&self, batch: Batch) -> StoreResult<Vec<Reply>>;

    /// Publish a payload. Returns the number of receivers, when known.
    async fn publish(&self, channel: &str, payload: &[u8]) -> StoreResult<usize>;

    /// Subscribe to the given channels.
    async fn subscribe(&self, channels: &[String]) -> StoreResult<Subscription>;

    /// Number of keys in the database.
    async fn db_size(&self) -> StoreResult<u64>;

    /// Introspection snapshot.
    async fn info(&self) -> StoreResult<StoreInfo>;
}
