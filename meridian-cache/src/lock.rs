//! Short-lived distributed mutual exclusion per cache key.
//!
//! ```text
//! (free) ─── try_acquire() ──→ LockHandle ─── release(handle) ──→ (free)
//!                                  │
//!                            ttl elapses ──→ (free, handle now stale)
//! ```
//!
//! Acquisition is a set-if-absent with a mandatory expiry. Release consumes
//! the handle and only deletes the lock while it still holds this handle's
//! token, so a holder whose lock expired and was re-acquired by someone else
//! cannot release the new owner's lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use meridian_core::KeySpace;
use meridian_store::{KeyValueStore, StoreResult};

/// Proof of holding a lock. Consumed by [`DistributedLock::release`].
#[must_use = "a held lock must be released"]
#[derive(PartialEq, Eq)]
pub struct LockHandle {
    key: String,
    token: String,
}

impl LockHandle {
    /// Store key of the lock.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

fn new_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

pub struct DistributedLock<S: KeyValueStore> {
    store: Arc<S>,
    keys: KeySpace,
    ttl: Duration,
}

impl<S: KeyValueStore> DistributedLock<S> {
    pub fn new(store: Arc<S>, keys: KeySpace, ttl: Duration) -> Self {
        Self { store, keys, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try once to take the lock for `key`. `None` when someone else holds it.
    pub async fn try_acquire(&self, key: &str) -> StoreResult<Option<LockHandle>> {
        let lock_key = self.keys.lock(key);
        let token = new_token();
        let acquired = self.store.set_if_absent(&lock_key, &token, self.ttl).await?;
        Ok(acquired.then_some(LockHandle {
            key: lock_key,
            token,
        }))
    }

    /// Release a held lock. Returns `false` when the lock had already
    /// expired or passed to another holder.
    pub async fn release(&self, handle: LockHandle) -> StoreResult<bool> {
        self.store
            .delete_if_equals(&handle.key, &handle.token)
            .await
    }

    /// Whether anyone currently holds the lock for `key`.
    pub async fn is_locked(&self, key: &str) -> StoreResult<bool> {
        Ok(self.store.get(&self.keys.lock(key)).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::ManualClock;
    use meridian_store::InMemoryStore;

    fn lock() -> (DistributedLock<InMemoryStore>, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        (
            DistributedLock::new(store, KeySpace::default(), Duration::from_secs(30)),
            clock,
        )
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let (lock, _clock) = lock();
        let handle = lock.try_acquire("k").await.unwrap().unwrap();
        assert_eq!(handle.key(), "meridian:lock:k");
        assert_eq!(handle.token().len(), 32);

        assert!(lock.try_acquire("k").await.unwrap().is_none());
        assert!(lock.try_acquire("other").await.unwrap().is_some());

        assert!(lock.release(handle).await.unwrap());
        assert!(!lock.is_locked("k").await.unwrap());
        assert!(lock.try_acquire("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_handle_cannot_release_new_owner() {
        let (lock, clock) = lock();
        let stale = lock.try_acquire("k").await.unwrap().unwrap();

        clock.advance(Duration::from_secs(31));
        let fresh = lock.try_acquire("k").await.unwrap().unwrap();

        assert!(!lock.release(stale).await.unwrap());
        assert!(lock.is_locked("k").await.unwrap());
        assert!(lock.release(fresh).await.unwrap());
    }
}
