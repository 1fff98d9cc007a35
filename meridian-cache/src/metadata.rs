//! Entry metadata stored as a hash beside each cached value.
//!
//! Field layout of `<prefix>:meta:<key>`:
//!
//! | field       | encoding                    |
//! |-------------|-----------------------------|
//! | `createdAt` | epoch milliseconds          |
//! | `expiresAt` | epoch milliseconds          |
//! | `version`   | version string              |
//! | `tags`      | JSON array of strings       |
//! | `checksum`  | 16 hex digits (FNV-1a 64)   |

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use meridian_core::{EntryMetadata, KeySpace, Timestamp, Version};
use meridian_store::{Batch, KeyValueStore, StoreResult};

const CREATED_AT: &str = "createdAt";
const EXPIRES_AT: &str = "expiresAt";
const VERSION: &str = "version";
const TAGS: &str = "tags";
const CHECKSUM: &str = "checksum";

/// Encode metadata into hash fields.
pub fn encode(meta: &EntryMetadata) -> Vec<(String, String)> {
    let tags: Vec<&String> = meta.tags.iter().collect();
    vec![
        (
            CREATED_AT.to_string(),
            meta.created_at.timestamp_millis().to_string(),
        ),
        (
            EXPIRES_AT.to_string(),
            meta.expires_at.timestamp_millis().to_string(),
        ),
        (VERSION.to_string(), meta.version.as_str().to_string()),
        (
            TAGS.to_string(),
            serde_json::to_string(&tags).unwrap_or_else(|_| "[]".to_string()),
        ),
        (CHECKSUM.to_string(), meta.checksum.clone()),
    ]
}

fn parse_millis(fields: &HashMap<String, String>, field: &str) -> Option<Timestamp> {
    let millis: i64 = fields.get(field)?.parse().ok()?;
    DateTime::<Utc>::from_timestamp_millis(millis)
}

/// Decode hash fields. Missing or malformed fields yield `None`, which
/// callers treat the same as absent metadata.
pub fn decode(fields: &HashMap<String, String>) -> Option<EntryMetadata> {
    if fields.is_empty() {
        return None;
    }
    let tags: BTreeSet<String> = serde_json::from_str(fields.get(TAGS)?).ok()?;
    Some(EntryMetadata {
        created_at: parse_millis(fields, CREATED_AT)?,
        expires_at: parse_millis(fields, EXPIRES_AT)?,
        version: Version::new(fields.get(VERSION)?.clone()),
        tags,
        checksum: fields.get(CHECKSUM)?.clone(),
    })
}

/// Reads and stages writes of entry metadata.
pub struct MetadataStore<S: KeyValueStore> {
    store: Arc<S>,
    keys: KeySpace,
}

impl<S: KeyValueStore> MetadataStore<S> {
    pub fn new(store: Arc<S>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Stage the metadata hash with an expiry matching the value's.
    pub fn stage_write(&self, batch: &mut Batch, key: &str, meta: &EntryMetadata, ttl: Duration) {
        let meta_key = self.keys.meta(key);
        batch
            .delete(meta_key.clone())
            .hash_set(meta_key.clone(), encode(meta))
            .expire(meta_key, ttl);
    }

    pub fn stage_remove(&self, batch: &mut Batch, key: &str) {
        batch.delete(self.keys.meta(key));
    }

    /// Stage a read of the raw metadata fields.
    pub fn stage_read(&self, batch: &mut Batch, key: &str) {
        batch.hash_get_all(self.keys.meta(key));
    }

    pub async fn read(&self, key: &str) -> StoreResult<Option<EntryMetadata>> {
        let fields = self.store.hash_get_all(&self.keys.meta(key)).await?;
        Ok(decode(&fields))
    }
}
