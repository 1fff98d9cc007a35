//! The cache engine.
//!
//! [`CacheCore`] is the public contract: reads verify expiry, consistency,
//! and integrity before returning anything, writes land value, metadata,
//! tag index, and authoritative version in one atomic batch, and every
//! mutation is announced to peers through the [`ChangePropagator`].
//!
//! Entry lifecycle:
//!
//! ```text
//! ABSENT ── set ──→ LIVE ──┬─ ttl passes ────────────→ EXPIRED ─────┐
//!                          ├─ delete / invalidation ──→ INVALIDATED ─┼─→ ABSENT
//!                          └─ peer change / tamper ───→ STALE ───────┘
//! ```
//!
//! Non-live entries are discovered lazily on read and removed on the spot.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use meridian_core::{
    compute_checksum, verify_checksum, CacheConfig, CacheError, ChangeEvent, EntryMetadata,
    GlobPattern, InvalidationEvent, InvalidationScope, KeySpace, MeridianError, MeridianResult,
    NodeId, SetOptions, SharedClock, SystemClock, Version,
};
use meridian_store::{Batch, KeyValueStore, Reply, StoreResult};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::expiring::ExpiringSet;
use crate::lock::{DistributedLock, LockHandle};
use crate::metadata::{self, MetadataStore};
use crate::propagator::{ChangePropagator, InvalidationHandler, PropagationHandle};
use crate::stats::{CacheCounters, CacheStats};
use crate::tag_index::TagIndex;
use crate::version_registry::VersionRegistry;

// ============================================================================
// OPTION TYPES
// ============================================================================

/// One entry of a [`CacheCore::set_many`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct SetEntry<T> {
    pub key: String,
    pub value: T,
    pub options: SetOptions,
}

impl<T> SetEntry<T> {
    pub fn new(key: impl Into<String>, value: T) -> Self {
        Self {
            key: key.into(),
            value,
            options: SetOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SetOptions) -> Self {
        self.options = options;
        self
    }
}

/// Options for [`CacheCore::smart_invalidate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmartInvalidateOptions {
    /// Also invalidate every tag carried by the matched entries.
    pub cascade: bool,
    /// Run the invalidation in the background after this long.
    pub delay: Option<Duration>,
}

impl SmartInvalidateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cascade(mut self) -> Self {
        self.cascade = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Which read-time checks a read performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadChecks {
    /// Reject pending keys and keys whose local version differs.
    pub consistency: bool,
}

impl ReadChecks {
    pub const FULL: ReadChecks = ReadChecks { consistency: true };
    pub const RELAXED: ReadChecks = ReadChecks { consistency: false };
}

/// Why a stored entry was rejected on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Expired,
    Inconsistent,
    Corrupt,
}

impl Rejection {
    fn as_str(&self) -> &'static str {
        match self {
            Rejection::Expired => "expired",
            Rejection::Inconsistent => "inconsistent",
            Rejection::Corrupt => "checksum mismatch",
        }
    }
}

enum Verdict {
    Miss,
    Rejected(Rejection, EntryMetadata),
    Fresh(Vec<u8>, EntryMetadata),
}

struct PreparedWrite {
    key: String,
    payload: Vec<u8>,
    meta: EntryMetadata,
    ttl: Duration,
    announce: bool,
}

// ============================================================================
// CACHE CORE
// ============================================================================

/// Distributed cache over a shared [`KeyValueStore`].
///
/// Cheap to clone; clones share all state. Build one per node and call
/// [`start_propagation`](Self::start_propagation) to hear from peers.
pub struct CacheCore<S: KeyValueStore> {
    store: Arc<S>,
    keys: KeySpace,
    config: Arc<CacheConfig>,
    node_id: NodeId,
    clock: SharedClock,
    registry: Arc<VersionRegistry<S>>,
    metadata: Arc<MetadataStore<S>>,
    tags: Arc<TagIndex<S>>,
    lock: Arc<DistributedLock<S>>,
    pending: Arc<ExpiringSet>,
    propagator: Arc<ChangePropagator<S>>,
    counters: Arc<CacheCounters>,
}

impl<S: KeyValueStore> Clone for CacheCore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keys: self.keys.clone(),
            config: Arc::clone(&self.config),
            node_id: self.node_id.clone(),
            clock: Arc::clone(&self.clock),
            registry: Arc::clone(&self.registry),
            metadata: Arc::clone(&self.metadata),
            tags: Arc::clone(&self.tags),
            lock: Arc::clone(&self.lock),
            pending: Arc::clone(&self.pending),
            propagator: Arc::clone(&self.propagator),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<S: KeyValueStore> fmt::Debug for CacheCore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCore")
            .field("node_id", &self.node_id)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl<S: KeyValueStore> CacheCore<S> {
    /// Create a cache driven by the system clock.
    pub fn new(store: Arc<S>, node_id: NodeId, config: CacheConfig) -> MeridianResult<Self> {
        Self::with_clock(store, node_id, config, SystemClock::shared())
    }

    /// Create a cache driven by the given clock.
    pub fn with_clock(
        store: Arc<S>,
        node_id: NodeId,
        config: CacheConfig,
        clock: SharedClock,
    ) -> MeridianResult<Self> {
        config.validate()?;

        let keys = KeySpace::new(config.key_prefix.clone());
        let registry = Arc::new(VersionRegistry::new(store.clone(), keys.clone()));
        let tags = Arc::new(TagIndex::new(store.clone(), keys.clone()));
        let pending = Arc::new(ExpiringSet::new(clock.clone(), config.pending_window));
        let propagator = Arc::new(ChangePropagator::new(
            store.clone(),
            keys.clone(),
            node_id.clone(),
            registry.clone(),
            pending.clone(),
            tags.clone(),
        ));

        Ok(Self {
            metadata: Arc::new(MetadataStore::new(store.clone(), keys.clone())),
            lock: Arc::new(DistributedLock::new(
                store.clone(),
                keys.clone(),
                config.lock_ttl,
            )),
            store,
            keys,
            config: Arc::new(config),
            node_id,
            clock,
            registry,
            tags,
            pending,
            propagator,
            counters: Arc::new(CacheCounters::default()),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Version this node currently tracks for `key`.
    pub fn local_version(&self, key: &str) -> Option<Version> {
        self.registry.local_version(key)
    }

    /// Whether `key` is inside a peer-announced invalidation window.
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains(key)
    }

    /// Treat `key` as provisionally stale for the pending window.
    pub(crate) fn mark_stale(&self, key: &str) {
        self.registry.forget_local(key);
        self.pending.mark(key);
    }

    /// Subscribe to peer announcements and apply them in a background task.
    ///
    /// The subscription is active when this returns.
    pub async fn start_propagation(&self) -> MeridianResult<PropagationHandle> {
        let subscription = self.propagator.subscribe().await?;
        let cache = self.clone();
        let task = tokio::spawn(async move {
            let propagator = Arc::clone(&cache.propagator);
            propagator.run(subscription, &cache).await;
        });
        Ok(PropagationHandle::from_task(task))
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Read a value. Store failures and unusable entries read as `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_checked(key, ReadChecks::FULL).await
    }

    pub(crate) async fn get_checked<T: DeserializeOwned>(
        &self,
        key: &str,
        checks: ReadChecks,
    ) -> Option<T> {
        let (payload, _) = self.read_entry(key, checks).await?;
        self.decode_hit(key, &payload)
    }

    /// Read several values in one round-trip. Only usable entries appear in
    /// the result; unusable ones are removed from the store.
    pub async fn get_many<T, K>(&self, keys: &[K]) -> HashMap<String, T>
    where
        T: DeserializeOwned,
        K: AsRef<str>,
    {
        let mut found = HashMap::new();
        if keys.is_empty() {
            return found;
        }

        let mut batch = Batch::new();
        for key in keys {
            self.metadata.stage_read(&mut batch, key.as_ref());
            batch.get(self.keys.data(key.as_ref()));
        }

        let replies = match self.store.execute(batch).await {
            Ok(replies) => replies,
            Err(e) => {
                tracing::warn!(count = keys.len(), error = %e, "Batch read failed, treating as misses");
                CacheCounters::add(&self.counters.misses, keys.len() as u64);
                return found;
            }
        };

        let mut replies = replies.into_iter();
        let mut rejected = Vec::new();
        for key in keys {
            let key = key.as_ref();
            let fields = replies.next().map(Reply::into_hash).unwrap_or_default();
            let payload = replies.next().and_then(Reply::into_bytes);
            match self.judge(key, metadata::decode(&fields), payload, ReadChecks::FULL) {
                Verdict::Fresh(payload, _) => {
                    if let Some(value) = self.decode_hit(key, &payload) {
                        found.insert(key.to_string(), value);
                    }
                }
                Verdict::Miss => CacheCounters::bump(&self.counters.misses),
                Verdict::Rejected(rejection, meta) => {
                    CacheCounters::bump(&self.counters.misses);
                    rejected.push(self.heal(key, rejection, meta));
                }
            }
        }
        join_all(rejected).await;
        found
    }

    /// Read and verify raw payload and metadata.
    async fn read_entry(&self, key: &str, checks: ReadChecks) -> Option<(Vec<u8>, EntryMetadata)> {
        let mut batch = Batch::new();
        self.metadata.stage_read(&mut batch, key);
        batch.get(self.keys.data(key));

        let replies = match self.store.execute(batch).await {
            Ok(replies) => replies,
            Err(e) => {
                tracing::warn!(key, error = %e, "Cache read failed, treating as miss");
                CacheCounters::bump(&self.counters.misses);
                return None;
            }
        };

        let mut replies = replies.into_iter();
        let fields = replies.next().map(Reply::into_hash).unwrap_or_default();
        let payload = replies.next().and_then(Reply::into_bytes);

        match self.judge(key, metadata::decode(&fields), payload, checks) {
            Verdict::Fresh(payload, meta) => Some((payload, meta)),
            Verdict::Miss => {
                tracing::debug!(key, "Cache miss");
                CacheCounters::bump(&self.counters.misses);
                None
            }
            Verdict::Rejected(rejection, meta) => {
                CacheCounters::bump(&self.counters.misses);
                self.heal(key, rejection, meta).await;
                None
            }
        }
    }

    /// Expiry, then consistency, then integrity.
    fn judge(
        &self,
        key: &str,
        meta: Option<EntryMetadata>,
        payload: Option<Vec<u8>>,
        checks: ReadChecks,
    ) -> Verdict {
        let (Some(meta), Some(payload)) = (meta, payload) else {
            return Verdict::Miss;
        };

        if meta.is_expired(self.clock.now()) {
            return Verdict::Rejected(Rejection::Expired, meta);
        }
        if checks.consistency && self.is_inconsistent(key, &meta.version) {
            return Verdict::Rejected(Rejection::Inconsistent, meta);
        }
        if !verify_checksum(&payload, &meta.checksum) {
            return Verdict::Rejected(Rejection::Corrupt, meta);
        }
        Verdict::Fresh(payload, meta)
    }

    fn is_inconsistent(&self, key: &str, stored: &Version) -> bool {
        self.pending.contains(key)
            || self
                .registry
                .local_version(key)
                .is_some_and(|local| &local != stored)
    }

    /// Remove an entry rejected on read.
    async fn heal(&self, key: &str, rejection: Rejection, meta: EntryMetadata) {
        match rejection {
            Rejection::Expired => {
                CacheCounters::bump(&self.counters.expirations);
                tracing::debug!(key, "Removing expired entry");
            }
            Rejection::Inconsistent => {
                CacheCounters::bump(&self.counters.consistency_failures);
                tracing::warn!(key, version = %meta.version, "Removing inconsistent entry");
            }
            Rejection::Corrupt => {
                CacheCounters::bump(&self.counters.integrity_failures);
                tracing::warn!(key, "Removing entry with checksum mismatch");
            }
        }

        if let Err(e) = self.remove_entry(key, Some(&meta.tags)).await {
            tracing::warn!(
                key,
                reason = rejection.as_str(),
                error = %e,
                "Failed to remove rejected entry"
            );
        }
    }

    fn decode_hit<T: DeserializeOwned>(&self, key: &str, payload: &[u8]) -> Option<T> {
        match serde_json::from_slice(payload) {
            Ok(value) => {
                tracing::debug!(key, "Cache hit");
                CacheCounters::bump(&self.counters.hits);
                Some(value)
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Cached value does not decode as requested type");
                CacheCounters::bump(&self.counters.misses);
                None
            }
        }
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Write a value. Returns the version written.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> MeridianResult<Version> {
        let write = self.prepare(key, value, &options)?;
        let previous = self.current_tags(&[key]).await?.pop().unwrap_or_default();
        let mut batch = Batch::new();
        let write = self.stage_write(&mut batch, write, &previous);
        self.store.execute(batch).await?;

        self.commit_local(&write.key, &write.meta.version);
        CacheCounters::bump(&self.counters.sets);
        tracing::debug!(key, version = %write.meta.version, "Cache set");

        if write.announce {
            self.announce_set(&write.key, &write.meta).await;
        }
        Ok(write.meta.version)
    }

    /// Write several values in one atomic batch. Change events go out only
    /// after the batch succeeds.
    pub async fn set_many<T, I>(&self, entries: I) -> MeridianResult<Vec<Version>>
    where
        T: Serialize,
        I: IntoIterator<Item = SetEntry<T>>,
    {
        let prepared = entries
            .into_iter()
            .map(|entry| self.prepare(&entry.key, &entry.value, &entry.options))
            .collect::<MeridianResult<Vec<_>>>()?;
        if prepared.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<&str> = prepared.iter().map(|w| w.key.as_str()).collect();
        let previous = self.current_tags(&keys).await?;
        let mut batch = Batch::new();
        let written: Vec<PreparedWrite> = prepared
            .into_iter()
            .zip(previous)
            .map(|(write, previous)| self.stage_write(&mut batch, write, &previous))
            .collect();

        self.store.execute(batch).await?;

        for write in &written {
            self.commit_local(&write.key, &write.meta.version);
        }
        CacheCounters::add(&self.counters.sets, written.len() as u64);
        tracing::debug!(count = written.len(), "Cache set_many");

        for write in written.iter().filter(|w| w.announce) {
            self.announce_set(&write.key, &write.meta).await;
        }
        Ok(written.into_iter().map(|w| w.meta.version).collect())
    }

    fn prepare<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: &SetOptions,
    ) -> MeridianResult<PreparedWrite> {
        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        if ttl.is_zero() {
            return Err(CacheError::InvalidOptions {
                field: "ttl".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }

        let payload = serde_json::to_vec(value).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let now = self.clock.now();
        let version = options
            .version
            .clone()
            .unwrap_or_else(|| Version::generate(now));
        let meta = EntryMetadata::new(
            now,
            ttl,
            version,
            options.tag_set(),
            compute_checksum(&payload),
        );

        Ok(PreparedWrite {
            key: key.to_string(),
            payload,
            meta,
            ttl,
            announce: !options.skip_eventual_consistency,
        })
    }

    /// Tags recorded for each key, empty where no entry exists.
    async fn current_tags(&self, keys: &[&str]) -> StoreResult<Vec<BTreeSet<String>>> {
        let mut batch = Batch::new();
        for key in keys {
            self.metadata.stage_read(&mut batch, key);
        }
        let replies = self.store.execute(batch).await?;
        Ok(replies
            .into_iter()
            .map(|reply| {
                metadata::decode(&reply.into_hash())
                    .map(|meta| meta.tags)
                    .unwrap_or_default()
            })
            .collect())
    }

    /// Stage value, metadata, tag memberships, and authoritative version.
    /// Memberships in `previous_tags` the new entry no longer carries are
    /// dropped. Hands the write back without its payload.
    fn stage_write(
        &self,
        batch: &mut Batch,
        mut write: PreparedWrite,
        previous_tags: &BTreeSet<String>,
    ) -> PreparedWrite {
        let payload = std::mem::take(&mut write.payload);
        batch.set(self.keys.data(&write.key), payload, Some(write.ttl));
        self.metadata
            .stage_write(batch, &write.key, &write.meta, write.ttl);
        self.tags.stage_remove(
            batch,
            &write.key,
            previous_tags.difference(&write.meta.tags),
        );
        self.tags
            .stage_add(batch, &write.key, &write.meta.tags, write.ttl);
        self.registry
            .stage_record(batch, &write.key, &write.meta.version);
        write
    }

    fn commit_local(&self, key: &str, version: &Version) {
        self.registry.record_local(key, version.clone());
        self.pending.remove(key);
    }

    // ========================================================================
    // DELETES & INVALIDATION
    // ========================================================================

    /// Delete one entry. Absent keys are a silent no-op.
    pub async fn delete(&self, key: &str) -> MeridianResult<bool> {
        let removed = self.remove_entry(key, None).await?;
        if removed {
            CacheCounters::bump(&self.counters.deletes);
            tracing::debug!(key, "Cache delete");
            self.announce(ChangeEvent::delete(
                key,
                self.node_id.clone(),
                self.clock.now(),
            ))
            .await;
        }
        Ok(removed)
    }

    /// Delete every entry indexed under any of `tags`. Returns the number of
    /// keys invalidated.
    pub async fn invalidate_by_tags<T: AsRef<str>>(&self, tags: &[T]) -> MeridianResult<usize> {
        let keys = self.purge_tags(tags).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let tags: Vec<String> = tags.iter().map(|t| t.as_ref().to_string()).collect();
        tracing::info!(tags = ?tags, count = keys.len(), "Invalidated by tags");
        let count = keys.len();
        self.announce(ChangeEvent::invalidate_tags(
            tags,
            keys,
            self.node_id.clone(),
            self.clock.now(),
        ))
        .await;
        Ok(count)
    }

    /// Delete the given keys and tell peers. Returns the number removed.
    pub async fn invalidate_keys<K: AsRef<str>>(&self, keys: &[K]) -> MeridianResult<usize> {
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.purge_keys(&keys).await?;
        self.announce_invalidation(InvalidationScope::Keys { keys })
            .await;
        Ok(removed)
    }

    /// Delete every key matching a glob pattern and tell peers.
    pub async fn invalidate_pattern(&self, pattern: &str) -> MeridianResult<usize> {
        GlobPattern::new(pattern)?;
        self.invalidate_matching(pattern, false).await
    }

    /// Pattern invalidation with optional tag cascade and delay.
    ///
    /// With `cascade`, tags of the matched entries are collected before they
    /// are deleted and then invalidated too. With a non-zero `delay` the
    /// whole operation runs in the background and this returns `0`.
    pub async fn smart_invalidate(
        &self,
        pattern: &str,
        options: SmartInvalidateOptions,
    ) -> MeridianResult<usize> {
        GlobPattern::new(pattern)?;

        match options.delay.filter(|d| !d.is_zero()) {
            Some(delay) => {
                tracing::debug!(pattern, ?delay, "Scheduled delayed invalidation");
                let cache = self.clone();
                let owned = pattern.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = cache.invalidate_matching(&owned, options.cascade).await {
                        tracing::warn!(pattern = %owned, error = %e, "Delayed invalidation failed");
                    }
                });
                Ok(0)
            }
            None => self.invalidate_matching(pattern, options.cascade).await,
        }
    }

    async fn invalidate_matching(&self, pattern: &str, cascade: bool) -> MeridianResult<usize> {
        let keys = self.keys_matching(pattern).await?;
        let cascaded = if cascade {
            self.collect_tags(&keys).await?
        } else {
            BTreeSet::new()
        };

        let mut removed = self.purge_keys(&keys).await?;
        if !keys.is_empty() {
            self.announce_invalidation(InvalidationScope::Pattern {
                pattern: pattern.to_string(),
            })
            .await;
        }

        if !cascaded.is_empty() {
            let tags: Vec<String> = cascaded.into_iter().collect();
            removed += self.invalidate_by_tags(&tags).await?;
        }

        tracing::info!(pattern, cascade, removed, "Invalidated by pattern");
        Ok(removed)
    }

    /// Cache keys whose data key matches `pattern`.
    async fn keys_matching(&self, pattern: &str) -> MeridianResult<Vec<String>> {
        let store_keys = self.store.scan(&self.keys.data_pattern(pattern)).await?;
        Ok(store_keys
            .iter()
            .filter_map(|k| self.keys.key_from_data(k))
            .map(str::to_string)
            .collect())
    }

    /// Union of the tags carried by the given entries.
    async fn collect_tags(&self, keys: &[String]) -> MeridianResult<BTreeSet<String>> {
        let mut tags = BTreeSet::new();
        if keys.is_empty() {
            return Ok(tags);
        }

        let mut batch = Batch::new();
        for key in keys {
            self.metadata.stage_read(&mut batch, key);
        }
        for reply in self.store.execute(batch).await? {
            if let Some(meta) = metadata::decode(&reply.into_hash()) {
                tags.extend(meta.tags);
            }
        }
        Ok(tags)
    }

    /// Delete the keys under `tags` without announcing. Returns the keys.
    async fn purge_tags<T: AsRef<str>>(&self, tags: &[T]) -> MeridianResult<Vec<String>> {
        let keys: Vec<String> = self.tags.resolve(tags).await?.into_iter().collect();
        if !keys.is_empty() {
            self.purge_keys(&keys).await?;
        }
        Ok(keys)
    }

    /// Delete keys concurrently without announcing. Every key is attempted;
    /// the first failure is returned afterwards.
    async fn purge_keys(&self, keys: &[String]) -> MeridianResult<usize> {
        let results = join_all(keys.iter().map(|key| self.remove_entry(key, None))).await;

        let mut removed = 0;
        let mut first_error = None;
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to invalidate key");
                    first_error.get_or_insert(e);
                }
            }
        }

        CacheCounters::add(&self.counters.invalidations, removed as u64);
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(removed),
        }
    }

    /// Atomically remove value, metadata, authoritative version, and tag
    /// memberships. Returns whether a value or metadata existed.
    async fn remove_entry(&self, key: &str, known_tags: Option<&BTreeSet<String>>) -> StoreResult<bool> {
        let tags = match known_tags {
            Some(tags) => tags.clone(),
            None => self
                .metadata
                .read(key)
                .await?
                .map(|meta| meta.tags)
                .unwrap_or_default(),
        };

        let mut batch = Batch::new();
        batch.delete(self.keys.data(key));
        self.metadata.stage_remove(&mut batch, key);
        self.registry.stage_remove(&mut batch, key);
        self.tags.stage_remove(&mut batch, key, &tags);
        let replies = self.store.execute(batch).await?;

        self.registry.forget_local(key);
        Ok(replies.iter().take(2).map(Reply::as_int).sum::<i64>() > 0)
    }

    // ========================================================================
    // COMPUTE-ON-MISS
    // ========================================================================

    /// Return the cached value or compute it once across the cluster.
    ///
    /// On a miss the caller races for the key's lock. The winner runs
    /// `factory` and caches the result. A loser waits a jittered interval and
    /// reads again; if the value is still missing it computes without the
    /// lock. Factory errors are returned unchanged and nothing is cached.
    pub async fn get_or_set<T, E, F, Fut>(
        &self,
        key: &str,
        factory: F,
        options: SetOptions,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<MeridianError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let handle = match self.lock.try_acquire(key).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(key, error = %e, "Lock acquisition failed");
                None
            }
        };

        if handle.is_none() {
            tokio::time::sleep(self.retry_delay()).await;
            if let Some(value) = self.get(key).await {
                return Ok(value);
            }
            CacheCounters::bump(&self.counters.lock_fallbacks);
            tracing::warn!(key, "Lock still held after retry, computing without it");
        }

        let outcome = self.fill(key, factory, options).await;
        if let Some(handle) = handle {
            self.release_lock(handle).await;
        }
        outcome
    }

    /// Like [`get_or_set`](Self::get_or_set), but a hit older than the
    /// refresh threshold triggers a background recomputation while the
    /// cached value is returned immediately.
    pub async fn get_with_auto_refresh<T, E, F, Fut>(
        &self,
        key: &str,
        factory: F,
        options: SetOptions,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        E: From<MeridianError> + fmt::Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if let Some((payload, meta)) = self.read_entry(key, ReadChecks::FULL).await {
            if let Some(value) = self.decode_hit(key, &payload) {
                let age = meta.age_ratio(self.clock.now());
                if age >= self.config.refresh_threshold {
                    tracing::debug!(key, age, "Entry near expiry, refreshing in background");
                    let cache = self.clone();
                    let key = key.to_string();
                    tokio::spawn(async move {
                        cache.refresh(&key, factory, options).await;
                    });
                }
                return Ok(value);
            }
        }
        self.get_or_set(key, factory, options).await
    }

    async fn fill<T, E, F, Fut>(&self, key: &str, factory: F, options: SetOptions) -> Result<T, E>
    where
        T: Serialize,
        E: From<MeridianError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let value = factory().await?;
        self.set(key, &value, options).await?;
        Ok(value)
    }

    async fn refresh<T, E, F, Fut>(&self, key: &str, factory: F, options: SetOptions)
    where
        T: Serialize + Send + Sync,
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let handle = match self.lock.try_acquire(key).await {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                tracing::debug!(key, "Refresh already running elsewhere");
                return;
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Background refresh could not take lock");
                return;
            }
        };

        match factory().await {
            Ok(value) => match self.set(key, &value, options).await {
                Ok(version) => {
                    CacheCounters::bump(&self.counters.background_refreshes);
                    tracing::debug!(key, version = %version, "Background refresh complete");
                }
                Err(e) => tracing::warn!(key, error = %e, "Background refresh failed to write"),
            },
            Err(e) => tracing::warn!(key, error = %e, "Background refresh factory failed"),
        }
        self.release_lock(handle).await;
    }

    async fn release_lock(&self, handle: LockHandle) {
        let lock_key = handle.key().to_string();
        match self.lock.release(handle).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(lock = %lock_key, "Lock expired before release"),
            Err(e) => tracing::warn!(lock = %lock_key, error = %e, "Lock release failed"),
        }
    }

    fn retry_delay(&self) -> Duration {
        let min = self.config.lock_retry_min.as_millis() as u64;
        let max = (self.config.lock_retry_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    // ========================================================================
    // VERSIONS & ADMIN
    // ========================================================================

    /// Reconcile one key with the authoritative version table.
    ///
    /// Returns `true` when the local view was out of date: a tracked key
    /// whose version differs is removed from the store. A key this node does
    /// not track is left untouched; [`sync_all_versions`](Self::sync_all_versions)
    /// adopts the table.
    pub async fn force_sync(&self, key: &str) -> MeridianResult<bool> {
        let authoritative = self.registry.authoritative(key).await?;
        let local = self.registry.local_version(key);

        match (local, authoritative) {
            (None, _) => Ok(false),
            (Some(local), Some(version)) if local == version => Ok(false),
            (Some(_), None) => {
                self.registry.forget_local(key);
                tracing::debug!(key, "Dropped local version of removed entry");
                Ok(true)
            }
            (Some(local), Some(version)) => {
                tracing::warn!(
                    key,
                    local = %local,
                    authoritative = %version,
                    "Version conflict, removing entry"
                );
                CacheCounters::bump(&self.counters.consistency_failures);
                self.remove_entry(key, None).await?;
                Ok(true)
            }
        }
    }

    /// Replace the local registry with the authoritative table. Returns the
    /// number of versions loaded.
    ///
    /// Rows of entries that have expired are pruned first.
    pub async fn sync_all_versions(&self) -> MeridianResult<usize> {
        self.prune_versions().await?;
        let loaded = self.registry.load_all().await?;
        tracing::info!(node_id = %self.node_id, loaded, "Synchronized version registry");
        Ok(loaded)
    }

    /// Remove version rows and local versions of entries whose data has
    /// expired from the store. Returns the number pruned.
    pub async fn prune_versions(&self) -> MeridianResult<usize> {
        let pruned = self.registry.prune().await?;
        if !pruned.is_empty() {
            tracing::debug!(node_id = %self.node_id, count = pruned.len(), "Pruned expired versions");
        }
        Ok(pruned.len())
    }

    pub async fn get_stats(&self) -> CacheStats {
        let store_keys = match self.store.db_size().await {
            Ok(size) => Some(size),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read store size");
                None
            }
        };
        CacheStats::snapshot(
            self.node_id.clone(),
            &self.counters,
            self.registry.tracked(),
            self.pending.len(),
            store_keys,
        )
    }

    /// Remove every key in this cache's namespace and drop all local state.
    ///
    /// Fails with [`CacheError::ClearNotConfirmed`] unless `confirm` is set.
    pub async fn clear(&self, confirm: bool) -> MeridianResult<usize> {
        if !confirm {
            return Err(CacheError::ClearNotConfirmed.into());
        }

        let keys = self.store.scan(&self.keys.namespace_pattern()).await?;
        if !keys.is_empty() {
            let mut batch = Batch::new();
            for key in &keys {
                batch.delete(key.clone());
            }
            self.store.execute(batch).await?;
        }

        self.registry.clear_local();
        self.pending.clear();
        tracing::warn!(node_id = %self.node_id, removed = keys.len(), "Cache cleared");
        self.announce_invalidation(InvalidationScope::All).await;
        Ok(keys.len())
    }

    // ========================================================================
    // ANNOUNCEMENTS
    // ========================================================================

    async fn announce_set(&self, key: &str, meta: &EntryMetadata) {
        self.announce(ChangeEvent::set(
            key,
            meta.version.clone(),
            meta.tags.iter().cloned().collect(),
            self.node_id.clone(),
            self.clock.now(),
        ))
        .await;
    }

    /// Publish failures never fail the mutation that already committed.
    async fn announce(&self, event: ChangeEvent) {
        if let Err(e) = self.propagator.publish_change(&event).await {
            tracing::warn!(key = %event.key, error = %e, "Failed to publish change event");
        }
    }

    async fn announce_invalidation(&self, scope: InvalidationScope) {
        let event = InvalidationEvent::new(scope, self.node_id.clone(), self.clock.now());
        if let Err(e) = self.propagator.publish_invalidation(&event).await {
            tracing::warn!(scope = ?event.scope, error = %e, "Failed to publish invalidation event");
        }
    }
}

// ============================================================================
// PEER INVALIDATIONS
// ============================================================================

#[async_trait]
impl<S: KeyValueStore> InvalidationHandler for CacheCore<S> {
    async fn handle_invalidation(&self, event: InvalidationEvent) -> MeridianResult<()> {
        let affected = match event.scope {
            InvalidationScope::Keys { keys } => {
                self.purge_keys(&keys).await?;
                keys
            }
            InvalidationScope::Pattern { pattern } => {
                let glob = GlobPattern::new(&pattern)?;
                let keys = self.keys_matching(&pattern).await?;
                self.purge_keys(&keys).await?;
                let mut affected = self.registry.forget_matching(&glob);
                affected.extend(keys);
                affected
            }
            InvalidationScope::Tags { tags } => self.purge_tags(&tags).await?,
            InvalidationScope::All => {
                self.registry.clear_local();
                self.pending.clear();
                tracing::info!(from = %event.node_id, "Peer cleared the cache");
                return Ok(());
            }
        };

        for key in &affected {
            self.mark_stale(key);
        }
        tracing::debug!(from = %event.node_id, count = affected.len(), "Applied peer invalidation");
        Ok(())
    }
}
