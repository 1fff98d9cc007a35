//! Version tracking.
//!
//! Each node keeps the last version it knows for every key it has written or
//! heard about. The shared store keeps the authoritative table (one hash
//! `<prefix>:versions`, key -> version) that every write updates in the same
//! batch as the value itself. Rows outlive entries that expire by TTL
//! without being read, so [`VersionRegistry::prune`] sweeps them.

use std::sync::Arc;

use dashmap::DashMap;
use meridian_core::{GlobPattern, KeySpace, Version};
use meridian_store::{Batch, KeyValueStore, StoreResult};

/// Node-local registry plus access to the authoritative table.
pub struct VersionRegistry<S: KeyValueStore> {
    store: Arc<S>,
    keys: KeySpace,
    local: DashMap<String, Version>,
}

impl<S: KeyValueStore> VersionRegistry<S> {
    pub fn new(store: Arc<S>, keys: KeySpace) -> Self {
        Self {
            store,
            keys,
            local: DashMap::new(),
        }
    }

    // ========================================================================
    // LOCAL REGISTRY
    // ========================================================================

    /// Last version this node knows for `key`.
    pub fn local_version(&self, key: &str) -> Option<Version> {
        self.local.get(key).map(|v| v.value().clone())
    }

    pub fn record_local(&self, key: &str, version: Version) {
        self.local.insert(key.to_string(), version);
    }

    /// Forget `key`. Returns whether it was tracked.
    pub fn forget_local(&self, key: &str) -> bool {
        self.local.remove(key).is_some()
    }

    /// Forget every key matching `pattern`. Returns the keys forgotten.
    pub fn forget_matching(&self, pattern: &GlobPattern) -> Vec<String> {
        let keys: Vec<String> = self
            .local
            .iter()
            .filter(|entry| pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &keys {
            self.local.remove(key);
        }
        keys
    }

    pub fn clear_local(&self) {
        self.local.clear();
    }

    /// Number of keys tracked locally.
    pub fn tracked(&self) -> usize {
        self.local.len()
    }

    // ========================================================================
    // AUTHORITATIVE TABLE
    // ========================================================================

    /// Stage the authoritative version for `key` into a batch.
    pub fn stage_record(&self, batch: &mut Batch, key: &str, version: &Version) {
        batch.hash_set(
            self.keys.versions(),
            vec![(key.to_string(), version.as_str().to_string())],
        );
    }

    /// Stage removal of `key` from the authoritative table.
    pub fn stage_remove(&self, batch: &mut Batch, key: &str) {
        batch.hash_delete(self.keys.versions(), key);
    }

    /// Read the authoritative version of `key`.
    pub async fn authoritative(&self, key: &str) -> StoreResult<Option<Version>> {
        Ok(self
            .store
            .hash_get(&self.keys.versions(), key)
            .await?
            .map(Version::new))
    }

    /// Drop authoritative rows whose data key no longer exists, together
    /// with their local versions. Returns the keys pruned.
    ///
    /// Each row is removed only while its data key is absent, so a write
    /// racing the sweep keeps its row.
    pub async fn prune(&self) -> StoreResult<Vec<String>> {
        let table = self.store.hash_get_all(&self.keys.versions()).await?;
        if table.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = table.into_keys().collect();
        let mut batch = Batch::new();
        for key in &keys {
            batch.hash_delete_unless_exists(self.keys.versions(), key.as_str(), self.keys.data(key));
        }
        let replies = self.store.execute(batch).await?;

        let pruned: Vec<String> = keys
            .into_iter()
            .zip(replies)
            .filter(|(_, reply)| reply.as_int() > 0)
            .map(|(key, _)| key)
            .collect();
        for key in &pruned {
            self.local.remove(key);
        }
        Ok(pruned)
    }

    /// Replace the local registry with the authoritative table.
    ///
    /// Returns the number of versions loaded.
    pub async fn load_all(&self) -> StoreResult<usize> {
        let table = self.store.hash_get_all(&self.keys.versions()).await?;
        self.local.clear();
        let loaded = table.len();
        for (key, version) in table {
            self.local.insert(key, Version::new(version));
        }
        Ok(loaded)
    }
}
