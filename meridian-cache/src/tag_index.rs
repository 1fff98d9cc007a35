//! Inverted index: tag -> set of cache keys.
//!
//! A key is added to every tag set in the same batch that writes the entry.
//! Tag sets carry an expiry that writes only ever extend, so a set always
//! outlives the entries it covers. Dangling members (keys already gone) are
//! tolerated; deleting a dangling key is a no-op.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use meridian_core::KeySpace;
use meridian_store::{Batch, KeyValueStore, StoreResult};

pub struct TagIndex<S: KeyValueStore> {
    store: Arc<S>,
    keys: KeySpace,
}

impl<S: KeyValueStore> TagIndex<S> {
    pub fn new(store: Arc<S>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Stage membership of `key` in each tag, extending each tag set's
    /// expiry to at least `ttl`.
    pub fn stage_add<'a>(
        &self,
        batch: &mut Batch,
        key: &str,
        tags: impl IntoIterator<Item = &'a String>,
        ttl: Duration,
    ) {
        for tag in tags {
            let tag_key = self.keys.tag(tag);
            batch.set_add(tag_key.clone(), key).extend_expiry(tag_key, ttl);
        }
    }

    pub fn stage_remove<'a>(
        &self,
        batch: &mut Batch,
        key: &str,
        tags: impl IntoIterator<Item = &'a String>,
    ) {
        for tag in tags {
            batch.set_remove(self.keys.tag(tag), key);
        }
    }

    /// Keys indexed under one tag.
    pub async fn members(&self, tag: &str) -> StoreResult<Vec<String>> {
        self.store.set_members(&self.keys.tag(tag)).await
    }

    /// Deduplicated union of the keys indexed under `tags`.
    pub async fn resolve<T: AsRef<str>>(&self, tags: &[T]) -> StoreResult<BTreeSet<String>> {
        let mut keys = BTreeSet::new();
        for tag in tags {
            keys.extend(self.members(tag.as_ref()).await?);
        }
        Ok(keys)
    }
}
