//! MERIDIAN Cache - Distributed Cache Consistency Engine
//!
//! A cache layer shared by many service instances over one key-value store.
//! Every entry carries metadata (creation and expiry times, a version, tags,
//! and a checksum) and every read verifies it before returning a value:
//! expired, tampered, or out-of-date entries are treated as misses and
//! removed. Mutations are announced to peer nodes over publish/subscribe so
//! their local version registries converge.
//!
//! On top of the core:
//! - tag-based and pattern-based invalidation, optionally cascading and
//!   delayed
//! - compute-on-miss with a short-lived distributed lock so only one caller
//!   runs the loader (stampede protection)
//! - background refresh of entries nearing expiry
//! - per-key consistency levels ([`ConsistencyStrategyManager`])
//! - cache-aside helpers for service code ([`Memoized`], [`evict_after`])

pub mod core;
pub mod expiring;
pub mod lock;
pub mod memoize;
pub mod metadata;
pub mod propagator;
pub mod stats;
pub mod strategy;
pub mod tag_index;
pub mod version_registry;

pub use crate::core::{CacheCore, SetEntry, SmartInvalidateOptions};
pub use expiring::ExpiringSet;
pub use lock::{DistributedLock, LockHandle};
pub use memoize::{evict_after, Eviction, Memoized};
pub use metadata::MetadataStore;
pub use propagator::{ChangePropagator, InvalidationHandler, PropagationHandle};
pub use stats::CacheStats;
pub use strategy::{ConsistencyLevel, ConsistencyStrategyManager};
pub use tag_index::TagIndex;
pub use version_registry::VersionRegistry;

// Re-export the types every caller needs alongside the cache
pub use meridian_core::{
    CacheConfig, EntryMetadata, MeridianError, MeridianResult, NodeId, SetOptions, Version,
};
