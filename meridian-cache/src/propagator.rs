//! Change propagation between nodes.
//!
//! Every node publishes its mutations on two namespaced channels and
//! subscribes to both:
//!
//! - `<prefix>:cache:changes` carries per-key [`ChangeEvent`]s. Peers apply
//!   them to their local version registry and pending-invalidation set.
//! - `<prefix>:cache:invalidation` carries bulk [`InvalidationEvent`]s,
//!   handed to an [`InvalidationHandler`] (the cache itself).
//!
//! Delivery is best effort. Lost or reordered events are tolerated: the
//! pending window bounds how long a deleted key can be read as live, and
//! read-time version checks catch the rest.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use meridian_core::{
    CacheError, ChangeEvent, ChangeKind, InvalidationEvent, KeySpace, MeridianResult, NodeId,
};
use meridian_store::{KeyValueStore, StoreMessage, Subscription};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::expiring::ExpiringSet;
use crate::tag_index::TagIndex;
use crate::version_registry::VersionRegistry;

/// Receiver of bulk invalidations announced by peers.
#[async_trait]
pub trait InvalidationHandler: Send + Sync + 'static {
    async fn handle_invalidation(&self, event: InvalidationEvent) -> MeridianResult<()>;
}

/// Publishes local mutations and applies peers' mutations to local state.
pub struct ChangePropagator<S: KeyValueStore> {
    store: Arc<S>,
    keys: KeySpace,
    node_id: NodeId,
    registry: Arc<VersionRegistry<S>>,
    pending: Arc<ExpiringSet>,
    tags: Arc<TagIndex<S>>,
}

impl<S: KeyValueStore> ChangePropagator<S> {
    pub fn new(
        store: Arc<S>,
        keys: KeySpace,
        node_id: NodeId,
        registry: Arc<VersionRegistry<S>>,
        pending: Arc<ExpiringSet>,
        tags: Arc<TagIndex<S>>,
    ) -> Self {
        Self {
            store,
            keys,
            node_id,
            registry,
            pending,
            tags,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    // ========================================================================
    // PUBLISHING
    // ========================================================================

    async fn publish<E: Serialize>(&self, channel: &str, subject: &str, event: &E) -> MeridianResult<usize> {
        let payload = serde_json::to_vec(event).map_err(|e| CacheError::Serialization {
            key: subject.to_string(),
            reason: e.to_string(),
        })?;
        Ok(self.store.publish(channel, &payload).await?)
    }

    /// Announce a per-key mutation. Returns the number of receivers.
    pub async fn publish_change(&self, event: &ChangeEvent) -> MeridianResult<usize> {
        let receivers = self
            .publish(&self.keys.changes_channel(), &event.key, event)
            .await?;
        tracing::debug!(
            key = %event.key,
            kind = ?event.kind,
            receivers,
            "Published change event"
        );
        Ok(receivers)
    }

    /// Announce a bulk invalidation. Returns the number of receivers.
    pub async fn publish_invalidation(&self, event: &InvalidationEvent) -> MeridianResult<usize> {
        let receivers = self
            .publish(&self.keys.invalidation_channel(), "invalidation", event)
            .await?;
        tracing::debug!(scope = ?event.scope, receivers, "Published invalidation event");
        Ok(receivers)
    }

    // ========================================================================
    // CONSUMING
    // ========================================================================

    /// Subscribe to both channels.
    pub async fn subscribe(&self) -> MeridianResult<Subscription> {
        let channels = vec![self.keys.changes_channel(), self.keys.invalidation_channel()];
        Ok(self.store.subscribe(&channels).await?)
    }

    /// Apply a peer's change event to local state.
    ///
    /// Returns `false` for events published by this node, which are ignored.
    pub async fn apply_change(&self, event: &ChangeEvent) -> bool {
        if event.node_id == self.node_id {
            return false;
        }

        match event.kind {
            ChangeKind::Set => {
                if let Some(version) = &event.version {
                    self.registry.record_local(&event.key, version.clone());
                }
                self.pending.remove(&event.key);
            }
            ChangeKind::Delete => {
                self.registry.forget_local(&event.key);
                self.pending.mark(&event.key);
            }
            ChangeKind::InvalidateTags => {
                let mut keys = match self.tags.resolve(&event.tags).await {
                    Ok(keys) => keys,
                    Err(e) => {
                        tracing::warn!(
                            tags = ?event.tags,
                            error = %e,
                            "Failed to resolve invalidated tags, using announced keys"
                        );
                        Default::default()
                    }
                };
                keys.extend(event.keys.iter().cloned());
                for key in &keys {
                    self.registry.forget_local(key);
                    self.pending.mark(key);
                }
            }
        }

        tracing::debug!(
            key = %event.key,
            kind = ?event.kind,
            from = %event.node_id,
            "Applied peer change"
        );
        true
    }

    /// Route one raw message to the right consumer.
    pub async fn dispatch<H>(&self, message: StoreMessage, handler: &H)
    where
        H: InvalidationHandler + ?Sized,
    {
        if message.channel == self.keys.changes_channel() {
            match serde_json::from_slice::<ChangeEvent>(&message.payload) {
                Ok(event) => {
                    self.apply_change(&event).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping malformed change event");
                }
            }
        } else if message.channel == self.keys.invalidation_channel() {
            match serde_json::from_slice::<InvalidationEvent>(&message.payload) {
                Ok(event) if event.node_id == self.node_id => {}
                Ok(event) => {
                    let scope = event.scope.clone();
                    if let Err(e) = handler.handle_invalidation(event).await {
                        tracing::warn!(scope = ?scope, error = %e, "Failed to apply peer invalidation");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping malformed invalidation event");
                }
            }
        }
    }

    /// Consume a subscription until it ends.
    pub async fn run<H>(&self, mut subscription: Subscription, handler: &H)
    where
        H: InvalidationHandler + ?Sized,
    {
        tracing::info!(node_id = %self.node_id, "Change propagation started");
        while let Some(message) = subscription.next().await {
            self.dispatch(message, handler).await;
        }
        tracing::info!(node_id = %self.node_id, "Change propagation stopped");
    }
}

/// Handle to a running propagation loop. The loop stops when the handle is
/// dropped or shut down.
#[derive(Debug)]
pub struct PropagationHandle {
    task: JoinHandle<()>,
}

impl PropagationHandle {
    /// Wrap an already spawned propagation task.
    pub fn from_task(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn shutdown(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PropagationHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use meridian_core::{InvalidationScope, ManualClock, Timestamp, Version};
    use meridian_store::{Batch, InMemoryStore};
    use std::sync::Mutex;
    use std::time::Duration;

    fn ts() -> Timestamp {
        DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    struct Recorder(Mutex<Vec<InvalidationEvent>>);

    #[async_trait]
    impl InvalidationHandler for Recorder {
        async fn handle_invalidation(&self, event: InvalidationEvent) -> MeridianResult<()> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: ManualClock,
        registry: Arc<VersionRegistry<InMemoryStore>>,
        pending: Arc<ExpiringSet>,
        propagator: ChangePropagator<InMemoryStore>,
    }

    fn fixture(node: &str) -> Fixture {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let keys = KeySpace::default();
        let registry = Arc::new(VersionRegistry::new(store.clone(), keys.clone()));
        let pending = Arc::new(ExpiringSet::new(
            Arc::new(clock.clone()),
            Duration::from_secs(5),
        ));
        let tags = Arc::new(TagIndex::new(store.clone(), keys.clone()));
        let propagator = ChangePropagator::new(
            store.clone(),
            keys,
            NodeId::new(node),
            registry.clone(),
            pending.clone(),
            tags,
        );
        Fixture {
            store,
            clock,
            registry,
            pending,
            propagator,
        }
    }

    #[tokio::test]
    async fn test_own_events_are_ignored() {
        let f = fixture("n1");
        let event = ChangeEvent::delete("k", NodeId::new("n1"), ts());
        assert!(!f.propagator.apply_change(&event).await);
        assert!(!f.pending.contains("k"));
    }

    #[tokio::test]
    async fn test_peer_set_updates_registry_and_clears_pending() {
        let f = fixture("n1");
        f.pending.mark("k");
        let event = ChangeEvent::set("k", Version::new("v2"), vec![], NodeId::new("n2"), ts());

        assert!(f.propagator.apply_change(&event).await);
        assert_eq!(f.registry.local_version("k"), Some(Version::new("v2")));
        assert!(!f.pending.contains("k"));
    }

    #[tokio::test]
    async fn test_peer_delete_marks_pending_for_window() {
        let f = fixture("n1");
        f.registry.record_local("k", Version::new("v1"));
        let event = ChangeEvent::delete("k", NodeId::new("n2"), ts());

        f.propagator.apply_change(&event).await;
        assert_eq!(f.registry.local_version("k"), None);
        assert!(f.pending.contains("k"));

        f.clock.advance(Duration::from_secs(5));
        assert!(!f.pending.contains("k"));
    }

    #[tokio::test]
    async fn test_peer_tag_invalidation_marks_indexed_and_carried_keys() {
        let f = fixture("n1");
        let tags = TagIndex::new(f.store.clone(), KeySpace::default());
        let mut batch = Batch::new();
        tags.stage_add(&mut batch, "indexed", &vec!["t".to_string()], Duration::from_secs(60));
        f.store.execute(batch).await.unwrap();

        let event = ChangeEvent::invalidate_tags(
            vec!["t".to_string()],
            vec!["carried".to_string()],
            NodeId::new("n2"),
            ts(),
        );
        f.propagator.apply_change(&event).await;

        assert!(f.pending.contains("indexed"));
        assert!(f.pending.contains("carried"));
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_channel() {
        let f = fixture("n1");
        let recorder = Recorder(Mutex::new(Vec::new()));
        let keys = KeySpace::default();

        let peer = InvalidationEvent::new(
            InvalidationScope::Keys {
                keys: vec!["a".to_string()],
            },
            NodeId::new("n2"),
            ts(),
        );
        let own = InvalidationEvent::new(InvalidationScope::All, NodeId::new("n1"), ts());
        for event in [&peer, &own] {
            let message = StoreMessage {
                channel: keys.invalidation_channel(),
                payload: serde_json::to_vec(event).unwrap(),
            };
            f.propagator.dispatch(message, &recorder).await;
        }

        let garbage = StoreMessage {
            channel: keys.changes_channel(),
            payload: b"not json".to_vec(),
        };
        f.propagator.dispatch(garbage, &recorder).await;

        assert_eq!(*recorder.0.lock().unwrap(), vec![peer]);
    }

    #[tokio::test]
    async fn test_published_changes_reach_subscribers() {
        let f = fixture("n1");
        let mut subscription = f.propagator.subscribe().await.unwrap();

        let event = ChangeEvent::set("k", Version::new("v1"), vec![], NodeId::new("n1"), ts());
        assert_eq!(f.propagator.publish_change(&event).await.unwrap(), 1);

        let message = subscription.next().await.unwrap();
        assert_eq!(message.channel, "meridian:cache:changes");
        let received: ChangeEvent = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(received.key, "k");
    }
}
