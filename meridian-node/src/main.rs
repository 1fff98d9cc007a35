//! MERIDIAN Node Entry Point
//!
//! Joins the shared store as one cache node: loads the authoritative version
//! table, follows peer announcements, and on every tick prunes versions of
//! expired entries and logs cache statistics until interrupted. Built with
//! the `redis` feature it talks to Redis; otherwise it runs over an
//! in-process store.

mod error;
mod telemetry;

use std::sync::Arc;

use meridian_cache::{CacheCore, CacheStats, PropagationHandle};
use meridian_core::NodeConfig;
use meridian_store::KeyValueStore;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::NodeResult;
use crate::telemetry::{init_tracing, TelemetryConfig};

#[tokio::main]
async fn main() -> NodeResult<()> {
    init_tracing(&TelemetryConfig::from_env())?;

    let config = NodeConfig::from_env();
    config.validate()?;

    #[cfg(feature = "redis")]
    let store = Arc::new(meridian_store::RedisStore::connect(config.store.clone()).await?);

    #[cfg(not(feature = "redis"))]
    let store = {
        tracing::warn!("Built without the redis feature, using an in-process store");
        Arc::new(meridian_store::InMemoryStore::with_clock_and_capacity(
            meridian_core::SystemClock::shared(),
            config.store.channel_capacity,
        ))
    };

    run(store, config).await
}

async fn run<S: KeyValueStore>(store: Arc<S>, config: NodeConfig) -> NodeResult<()> {
    let info = store.info().await?;
    tracing::info!(
        node_id = %config.node_id,
        backend = %info.backend,
        store_keys = info.key_count,
        "Starting MERIDIAN node"
    );

    let cache = CacheCore::new(store, config.node_id.clone(), config.cache.clone())?;
    let mut propagation = cache.start_propagation().await?;
    let loaded = cache.sync_all_versions().await?;
    tracing::info!(loaded, "Node ready");

    let mut ticker = interval(config.stats_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                propagation = ensure_propagation(&cache, propagation).await;
                if let Err(e) = cache.prune_versions().await {
                    tracing::warn!(error = %e, "Version prune failed");
                }
                report(&cache.get_stats().await);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    propagation.shutdown();
    report(&cache.get_stats().await);
    Ok(())
}

/// Resubscribe when the propagation loop has ended, typically because the
/// store connection dropped. Events missed meanwhile are recovered by
/// reloading the version table.
async fn ensure_propagation<S: KeyValueStore>(
    cache: &CacheCore<S>,
    current: PropagationHandle,
) -> PropagationHandle {
    if !current.is_finished() {
        return current;
    }

    tracing::warn!(node_id = %cache.node_id(), "Propagation stopped, resubscribing");
    match cache.start_propagation().await {
        Ok(handle) => {
            if let Err(e) = cache.sync_all_versions().await {
                tracing::warn!(error = %e, "Version resync after resubscribe failed");
            }
            handle
        }
        Err(e) => {
            tracing::error!(error = %e, "Resubscribe failed, retrying on next tick");
            current
        }
    }
}

fn report(stats: &CacheStats) {
    tracing::info!(
        node_id = %stats.node_id,
        hits = stats.hits,
        misses = stats.misses,
        hit_rate = stats.hit_rate(),
        sets = stats.sets,
        deletes = stats.deletes,
        invalidations = stats.invalidations,
        integrity_failures = stats.integrity_failures,
        consistency_failures = stats.consistency_failures,
        lock_fallbacks = stats.lock_fallbacks,
        tracked_versions = stats.tracked_versions,
        pending_invalidations = stats.pending_invalidations,
        store_keys = ?stats.store_keys,
        "Cache statistics"
    );
}
