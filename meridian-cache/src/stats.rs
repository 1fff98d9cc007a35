//! Cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use meridian_core::NodeId;
use serde::Serialize;

/// Running counters for one node.
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    pub invalidations: AtomicU64,
    pub integrity_failures: AtomicU64,
    pub consistency_failures: AtomicU64,
    pub expirations: AtomicU64,
    pub lock_fallbacks: AtomicU64,
    pub background_refreshes: AtomicU64,
}

impl CacheCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Point-in-time statistics for one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub node_id: NodeId,
    /// Number of reads served from the cache.
    pub hits: u64,
    /// Number of reads that found nothing usable.
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    /// Keys removed by tag, key-list, or pattern invalidation.
    pub invalidations: u64,
    /// Entries dropped because their checksum did not match.
    pub integrity_failures: u64,
    /// Entries dropped as pending or version-mismatched.
    pub consistency_failures: u64,
    /// Entries dropped on read after their expiry.
    pub expirations: u64,
    /// `get_or_set` calls that ran the factory without holding the lock.
    pub lock_fallbacks: u64,
    pub background_refreshes: u64,
    /// Keys in the local version registry.
    pub tracked_versions: usize,
    pub pending_invalidations: usize,
    /// Keys in the shared store, `None` when the store could not be reached.
    pub store_keys: Option<u64>,
}

impl CacheStats {
    pub(crate) fn snapshot(
        node_id: NodeId,
        counters: &CacheCounters,
        tracked_versions: usize,
        pending_invalidations: usize,
        store_keys: Option<u64>,
    ) -> Self {
        Self {
            node_id,
            hits: load(&counters.hits),
            misses: load(&counters.misses),
            sets: load(&counters.sets),
            deletes: load(&counters.deletes),
            invalidations: load(&counters.invalidations),
            integrity_failures: load(&counters.integrity_failures),
            consistency_failures: load(&counters.consistency_failures),
            expirations: load(&counters.expirations),
            lock_fallbacks: load(&counters.lock_fallbacks),
            background_refreshes: load(&counters.background_refreshes),
            tracked_versions,
            pending_invalidations,
            store_keys,
        }
    }

    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_hit_rate() {
        let counters = CacheCounters::default();
        CacheCounters::add(&counters.hits, 3);
        CacheCounters::bump(&counters.misses);

        let stats = CacheStats::snapshot(NodeId::new("n1"), &counters, 2, 1, Some(10));
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(stats.store_keys, Some(10));
    }

    #[test]
    fn test_hit_rate_without_reads() {
        let stats = CacheStats::snapshot(NodeId::new("n1"), &CacheCounters::default(), 0, 0, None);
        assert_eq!(stats.hit_rate(), 0.0);
    }
}
