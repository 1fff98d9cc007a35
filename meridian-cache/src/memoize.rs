//! Cache-aside helpers for service code.
//!
//! [`Memoized`] wraps an async loader so calls go through
//! [`CacheCore::get_or_set`] under a key derived from the arguments.
//! [`evict_after`] runs a mutation and, only if it succeeds, invalidates the
//! keys and tags it affects.

use std::future::Future;
use std::marker::PhantomData;

use meridian_core::{MeridianError, SetOptions};
use meridian_store::KeyValueStore;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::CacheCore;

/// An async loader whose results are cached per argument.
///
/// # Example
///
/// ```ignore
/// let user_by_id = Memoized::new(
///     cache.clone(),
///     |id: &u64| format!("user:{id}"),
///     |id: u64| async move { repo.load_user(id).await },
/// )
/// .with_options(SetOptions::new().with_ttl_secs(60).with_tags(["users"]));
///
/// let user = user_by_id.call(42).await?;
/// ```
pub struct Memoized<S: KeyValueStore, A, K, L> {
    cache: CacheCore<S>,
    key_fn: K,
    loader: L,
    options: SetOptions,
    _args: PhantomData<fn(A)>,
}

impl<S, A, K, L> Memoized<S, A, K, L>
where
    S: KeyValueStore,
    K: Fn(&A) -> String,
{
    pub fn new(cache: CacheCore<S>, key_fn: K, loader: L) -> Self {
        Self {
            cache,
            key_fn,
            loader,
            options: SetOptions::default(),
            _args: PhantomData,
        }
    }

    /// Options used for every cached result.
    pub fn with_options(mut self, options: SetOptions) -> Self {
        self.options = options;
        self
    }

    /// Cache key for the given arguments.
    pub fn key_for(&self, args: &A) -> String {
        (self.key_fn)(args)
    }

    /// Return the cached result for `args`, loading it on a miss.
    pub async fn call<T, E, Fut>(&self, args: A) -> Result<T, E>
    where
        L: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + DeserializeOwned,
        E: From<MeridianError>,
    {
        let key = self.key_for(&args);
        let loader = &self.loader;
        self.cache
            .get_or_set(&key, move || loader(args), self.options.clone())
            .await
    }

    /// Drop the cached result for `args`.
    pub async fn forget(&self, args: &A) -> Result<bool, MeridianError> {
        self.cache.delete(&self.key_for(args)).await
    }
}

/// What a mutation invalidates once it succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Eviction {
    pub keys: Vec<String>,
    pub tags: Vec<String>,
}

impl Eviction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys<I, T>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// Run `mutation`; on success invalidate what `eviction` names.
///
/// Mutation errors are returned unchanged and nothing is invalidated.
pub async fn evict_after<S, T, E, Fut>(
    cache: &CacheCore<S>,
    eviction: &Eviction,
    mutation: Fut,
) -> Result<T, E>
where
    S: KeyValueStore,
    Fut: Future<Output = Result<T, E>>,
    E: From<MeridianError>,
{
    let output = mutation.await?;
    if !eviction.keys.is_empty() {
        cache.invalidate_keys(&eviction.keys).await?;
    }
    if !eviction.tags.is_empty() {
        cache.invalidate_by_tags(&eviction.tags).await?;
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{CacheConfig, ManualClock, NodeId};
    use meridian_store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn cache() -> CacheCore<InMemoryStore> {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        CacheCore::with_clock(store, NodeId::new("n1"), CacheConfig::default(), Arc::new(clock))
            .unwrap()
    }

    #[tokio::test]
    async fn test_memoized_loads_once_per_key() {
        let loads = AtomicUsize::new(0);
        let memo = Memoized::new(cache(), |id: &u32| format!("square:{id}"), |id: u32| {
            loads.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, MeridianError>(id * id) }
        });

        assert_eq!(memo.call(3).await, Ok(9));
        assert_eq!(memo.call(3).await, Ok(9));
        assert_eq!(memo.call(4).await, Ok(16));
        assert_eq!(loads.load(Ordering::SeqCst), 2);

        assert!(memo.forget(&3).await.unwrap());
        assert_eq!(memo.call(3).await, Ok(9));
        assert_eq!(loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_evict_after_success_only() {
        let cache = cache();
        cache
            .set("user:1", &"alice", SetOptions::new().with_tags(["users"]))
            .await
            .unwrap();
        cache.set("user:list", &vec![1], SetOptions::new()).await.unwrap();

        let eviction = Eviction::new().keys(["user:list"]).tags(["users"]);

        let failed: Result<(), MeridianError> = evict_after(&cache, &eviction, async {
            Err(MeridianError::Cache(meridian_core::CacheError::ClearNotConfirmed))
        })
        .await;
        assert!(failed.is_err());
        assert!(cache.get::<String>("user:1").await.is_some());

        let updated: Result<u8, MeridianError> = evict_after(&cache, &eviction, async { Ok(1) }).await;
        assert_eq!(updated, Ok(1));
        assert_eq!(cache.get::<String>("user:1").await, None);
        assert_eq!(cache.get::<Vec<i32>>("user:list").await, None);
    }
}
