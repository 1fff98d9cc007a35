//! Multi-node behavior over one shared store.
//!
//! Every test runs several [`CacheCore`] nodes against a single in-memory
//! store with propagation enabled, the way service instances share one
//! Redis database in production.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use meridian_cache::{MeridianError, SetOptions, SmartInvalidateOptions};
use meridian_core::CacheError;
use meridian_store::KeyValueStore;
use meridian_test_utils::{assertions, fixtures, TestCluster, TestPayload};

#[tokio::test]
async fn test_peer_write_updates_local_version() {
    let cluster = TestCluster::start(2).await.unwrap();
    let version = cluster
        .node(0)
        .set("user:1", &fixtures::sample_payload(1), SetOptions::new())
        .await
        .unwrap();
    cluster.settle().await;

    assert_eq!(cluster.node(1).local_version("user:1"), Some(version));
    assert_eq!(
        cluster.node(1).get::<TestPayload>("user:1").await,
        Some(fixtures::sample_payload(1))
    );
}

#[tokio::test]
async fn test_peer_delete_opens_pending_window() {
    let cluster = TestCluster::start(2).await.unwrap();
    let (a, b) = (cluster.node(0), cluster.node(1));

    a.set("k", &1, SetOptions::new()).await.unwrap();
    cluster.settle().await;
    assert_eq!(b.get::<i32>("k").await, Some(1));

    assert!(a.delete("k").await.unwrap());
    cluster.settle().await;
    assert!(b.is_pending("k"));
    assert_eq!(b.local_version("k"), None);
    assert_eq!(b.get::<i32>("k").await, None);

    // A fresh write from anywhere closes the window.
    b.set("k", &2, SetOptions::new()).await.unwrap();
    cluster.settle().await;
    assert!(!b.is_pending("k"));
    assert!(!a.is_pending("k"));
    assert_eq!(a.get::<i32>("k").await, Some(2));
}

#[tokio::test]
async fn test_pending_window_lapses() {
    let cluster = TestCluster::start(2).await.unwrap();
    cluster.node(0).set("k", &1, SetOptions::new()).await.unwrap();
    cluster.node(0).delete("k").await.unwrap();
    cluster.settle().await;
    assert!(cluster.node(1).is_pending("k"));

    cluster.clock.advance(Duration::from_secs(6));
    assert!(!cluster.node(1).is_pending("k"));
}

#[tokio::test]
async fn test_tag_invalidation_reaches_peers() {
    let cluster = TestCluster::start(3).await.unwrap();
    let writer = cluster.node(0);
    writer
        .set("post:1", &"a", SetOptions::new().with_tags(["posts"]))
        .await
        .unwrap();
    writer
        .set("post:2", &"b", SetOptions::new().with_tags(["posts"]))
        .await
        .unwrap();
    cluster.settle().await;

    assert_eq!(cluster.node(2).invalidate_by_tags(&["posts"]).await.unwrap(), 2);
    cluster.settle().await;

    for node in cluster.nodes() {
        assert_eq!(node.get::<String>("post:1").await, None);
        assert_eq!(node.get::<String>("post:2").await, None);
    }
    assert!(writer.is_pending("post:1"));
    assert!(writer.is_pending("post:2"));
}

#[tokio::test]
async fn test_stale_node_reconciles_with_force_sync() {
    let (store, clock) = fixtures::manual_store();
    let writer = fixtures::node_over(store.clone(), &clock, "writer", fixtures::test_config()).unwrap();
    // Not subscribed: misses every announcement.
    let isolated =
        fixtures::node_over(store.clone(), &clock, "isolated", fixtures::test_config()).unwrap();

    writer.set("k", &1, SetOptions::new()).await.unwrap();
    assert!(!isolated.force_sync("k").await.unwrap());
    assert_eq!(isolated.local_version("k"), None);

    assert_eq!(isolated.sync_all_versions().await.unwrap(), 1);
    assert_eq!(isolated.local_version("k"), writer.local_version("k"));

    writer.set("k", &2, SetOptions::new()).await.unwrap();
    assert_ne!(isolated.local_version("k"), writer.local_version("k"));

    assert!(isolated.force_sync("k").await.unwrap());
    assert!(!store.contains_key("meridian:data:k"));
    assert_eq!(isolated.get_stats().await.consistency_failures, 1);
    assert_eq!(writer.get::<i32>("k").await, None);
}

#[tokio::test(start_paused = true)]
async fn test_stampede_runs_factory_once() {
    let cluster = TestCluster::start(3).await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let reads = cluster.nodes().iter().map(|node| {
        let calls = Arc::clone(&calls);
        async move {
            node.get_or_set(
                "report:daily",
                move || async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, MeridianError>(42u32)
                },
                SetOptions::new().with_ttl_secs(60),
            )
            .await
        }
    });
    let results = join_all(reads).await;

    assert!(results.iter().all(|r| r == &Ok(42)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for node in cluster.nodes() {
        assert_eq!(node.get_stats().await.lock_fallbacks, 0);
    }
}

#[tokio::test]
async fn test_cascading_pattern_invalidation_across_nodes() {
    let cluster = TestCluster::start(2).await.unwrap();
    let (a, b) = (cluster.node(0), cluster.node(1));
    a.set("user:1", &"u", SetOptions::new().with_tags(["profile:1"]))
        .await
        .unwrap();
    a.set("feed:1", &"f", SetOptions::new().with_tags(["profile:1"]))
        .await
        .unwrap();
    a.set("other", &"o", SetOptions::new()).await.unwrap();
    cluster.settle().await;

    let removed = a
        .smart_invalidate("user:*", SmartInvalidateOptions::new().cascade())
        .await
        .unwrap();
    assert_eq!(removed, 2);
    cluster.settle().await;

    assert!(b.is_pending("user:1"));
    assert!(b.is_pending("feed:1"));
    assert_eq!(b.get::<String>("feed:1").await, None);
    assert_eq!(b.get::<String>("other").await, Some("o".to_string()));
}

#[tokio::test]
async fn test_clear_is_broadcast() {
    let cluster = TestCluster::start(2).await.unwrap();
    for i in 0..4 {
        cluster
            .node(0)
            .set(&format!("k{i}"), &i, SetOptions::new().with_tags(["all"]))
            .await
            .unwrap();
    }
    cluster.settle().await;
    assert_eq!(cluster.node(1).get_stats().await.tracked_versions, 4);

    let refused = cluster.node(1).clear(false).await;
    assert_eq!(
        refused,
        Err(MeridianError::Cache(CacheError::ClearNotConfirmed))
    );
    assertions::assert_cache_error(&refused);

    assert!(cluster.node(1).clear(true).await.unwrap() > 0);
    cluster.settle().await;

    for node in cluster.nodes() {
        assert_eq!(node.get_stats().await.tracked_versions, 0);
        assert_eq!(node.get::<i32>("k0").await, None);
    }
    assert_eq!(cluster.store.db_size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_auto_refresh_recomputes_in_background() {
    let (cache, clock) = fixtures::single_node();
    cache
        .set("quote", &"old", SetOptions::new().with_ttl_secs(10))
        .await
        .unwrap();
    clock.advance(Duration::from_secs(9));

    let value: Result<String, MeridianError> = cache
        .get_with_auto_refresh(
            "quote",
            || async { Ok("new".to_string()) },
            SetOptions::new().with_ttl_secs(10),
        )
        .await;
    assert_eq!(value, Ok("old".to_string()));

    tokio::time::sleep(Duration::from_millis(25)).await;
    assert_eq!(cache.get::<String>("quote").await, Some("new".to_string()));
    assert_eq!(cache.get_stats().await.background_refreshes, 1);
}

#[tokio::test]
async fn test_store_outage_degrades_reads_and_fails_writes() {
    let cluster = TestCluster::start(2).await.unwrap();
    cluster.node(0).set("k", &1, SetOptions::new()).await.unwrap();

    cluster.store.set_available(false);
    assert_eq!(cluster.node(1).get::<i32>("k").await, None);
    assertions::assert_store_error(&cluster.node(1).set("k", &2, SetOptions::new()).await);

    cluster.store.set_available(true);
    assert_eq!(cluster.node(1).get::<i32>("k").await, Some(1));
}
