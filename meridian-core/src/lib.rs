//! MERIDIAN Core - Shared Types
//!
//! Data types, errors, configuration, and pure helpers shared by every
//! MERIDIAN crate. Nothing in here talks to the shared store.

pub mod checksum;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod keyspace;
pub mod pattern;

pub use checksum::{compute_checksum, fnv1a_64, verify_checksum};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{CacheConfig, NodeConfig, StoreConfig};
pub use error::{CacheError, ConfigError, MeridianError, MeridianResult, StoreError};
pub use event::{ChangeEvent, ChangeKind, InvalidationEvent, InvalidationScope};
pub use keyspace::KeySpace;
pub use pattern::{escape_glob, GlobPattern};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Identity of one cache node (one service instance).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh node identity.
    /// UUIDv7 keeps ids roughly sortable by process start time.
    pub fn random() -> Self {
        Self(format!("node-{}", Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Entry version: a time + random composite.
///
/// Unique enough to detect divergence between nodes. Versions are only
/// compared for equality; they are not globally ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// Generate a version stamped with `now`.
    pub fn generate(now: Timestamp) -> Self {
        Self(format!(
            "{}-{:08x}",
            now.timestamp_millis(),
            rand::random::<u32>()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// ENTRY METADATA
// ============================================================================

/// Metadata stored beside every cached value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub version: Version,
    pub tags: BTreeSet<String>,
    pub checksum: String,
}

impl EntryMetadata {
    /// Build metadata for an entry written at `now` living for `ttl`.
    pub fn new(
        now: Timestamp,
        ttl: Duration,
        version: Version,
        tags: BTreeSet<String>,
        checksum: String,
    ) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self {
            created_at: now,
            expires_at: now + ttl,
            version,
            tags,
            checksum,
        }
    }

    /// Expired strictly after `expires_at`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.expires_at
    }

    /// Fraction of the lifetime already consumed, clamped to `[0, 1]`.
    pub fn age_ratio(&self, now: Timestamp) -> f64 {
        let lifetime = (self.expires_at - self.created_at).num_milliseconds();
        if lifetime <= 0 {
            return 1.0;
        }
        let age = (now - self.created_at).num_milliseconds();
        (age as f64 / lifetime as f64).clamp(0.0, 1.0)
    }

    /// Time left before expiry, or `None` once expired.
    pub fn remaining_ttl(&self, now: Timestamp) -> Option<Duration> {
        if now >= self.expires_at {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }
}

// ============================================================================
// WRITE OPTIONS
// ============================================================================

/// Options for a cache write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Entry lifetime. `None` uses the configured default.
    pub ttl: Option<Duration>,
    /// Tags to index the entry under.
    pub tags: Vec<String>,
    /// Explicit version. `None` generates one.
    pub version: Option<Version>,
    /// Do not announce the write to peers.
    pub skip_eventual_consistency: bool,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_ttl_secs(self, secs: u64) -> Self {
        self.with_ttl(Duration::from_secs(secs))
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn skip_eventual_consistency(mut self) -> Self {
        self.skip_eventual_consistency = true;
        self
    }

    /// Deduplicated, ordered tag set.
    pub fn tag_set(&self) -> BTreeSet<String> {
        self.tags.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> Timestamp {
        DateTime::UNIX_EPOCH + chrono::Duration::seconds(secs)
    }

    #[test]
    fn test_node_ids_are_unique() {
        assert_ne!(NodeId::random(), NodeId::random());
        assert!(NodeId::random().as_str().starts_with("node-"));
    }

    #[test]
    fn test_version_generate_embeds_millis() {
        let now = at(1_700_000_000);
        let version = Version::generate(now);
        assert!(version.as_str().starts_with("1700000000000-"));
        assert_ne!(version, Version::generate(now));
    }

    #[test]
    fn test_metadata_expiry_is_strict() {
        let meta = EntryMetadata::new(
            at(100),
            Duration::from_secs(10),
            Version::new("v1"),
            BTreeSet::new(),
            "00".to_string(),
        );
        assert!(meta.expires_at > meta.created_at);
        assert!(!meta.is_expired(at(110)));
        assert!(meta.is_expired(at(111)));
        assert_eq!(meta.remaining_ttl(at(104)), Some(Duration::from_secs(6)));
        assert_eq!(meta.remaining_ttl(at(110)), None);
    }

    #[test]
    fn test_metadata_age_ratio() {
        let meta = EntryMetadata::new(
            at(0),
            Duration::from_secs(100),
            Version::new("v1"),
            BTreeSet::new(),
            "00".to_string(),
        );
        assert!((meta.age_ratio(at(0)) - 0.0).abs() < f64::EPSILON);
        assert!((meta.age_ratio(at(80)) - 0.8).abs() < 1e-9);
        assert!((meta.age_ratio(at(500)) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_set_options_builder() {
        let opts = SetOptions::new()
            .with_ttl_secs(60)
            .with_tags(["b", "a", "b"])
            .with_version(Version::new("v9"))
            .skip_eventual_consistency();

        assert_eq!(opts.ttl, Some(Duration::from_secs(60)));
        assert_eq!(opts.tag_set().into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(opts.version, Some(Version::new("v9")));
        assert!(opts.skip_eventual_consistency);
    }
}
