//! Property-Based Tests for the Cache Core
//!
//! **Property 1: Round-Trip** - a value written with `set` is read back
//! unchanged by `get` until it expires.
//!
//! **Property 2: Expiry** - no entry is returned after its TTL.
//!
//! **Property 3: Tag Scope** - invalidating a tag removes exactly the entries
//! carrying it.
//!
//! **Property 4: Integrity** - an entry whose stored bytes change behind the
//! cache's back is never returned.
//!
//! **Property 5: Idempotent Delete** - deleting twice reports removal once.
//!
//! **Property 6: Batch Consistency** - `get_many` after `set_many` agrees
//! with per-key `get`.

use std::collections::BTreeSet;
use std::time::Duration;

use meridian_cache::{SetEntry, SetOptions};
use meridian_store::KeyValueStore;
use meridian_test_utils::{fixtures, generators, TestPayload};
use proptest::prelude::*;
use tokio::runtime::Runtime;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

fn fail(e: impl std::fmt::Display) -> TestCaseError {
    TestCaseError::fail(e.to_string())
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// **Property 1: Round-Trip**
    ///
    /// For any key, payload, and options, `get` returns the written payload
    /// and the local version equals the version `set` returned.
    #[test]
    fn prop_set_get_round_trip(
        key in generators::arb_key(),
        payload in generators::arb_payload(),
        options in generators::arb_set_options(),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let (cache, _clock) = fixtures::single_node();
            let version = cache.set(&key, &payload, options).await.map_err(fail)?;

            prop_assert_eq!(cache.get::<TestPayload>(&key).await, Some(payload));
            prop_assert_eq!(cache.local_version(&key), Some(version));
            Ok(())
        })?;
    }

    /// **Property 2: Expiry**
    ///
    /// Entries are readable strictly before their TTL has elapsed and gone
    /// once the clock has moved past it.
    #[test]
    fn prop_entries_expire(
        key in generators::arb_key(),
        ttl_secs in 1u64..3_600,
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let (cache, clock) = fixtures::single_node();
            cache
                .set(&key, &ttl_secs, SetOptions::new().with_ttl_secs(ttl_secs))
                .await
                .map_err(fail)?;

            clock.advance(Duration::from_secs(ttl_secs - 1));
            prop_assert_eq!(cache.get::<u64>(&key).await, Some(ttl_secs));

            clock.advance(Duration::from_secs(2));
            prop_assert_eq!(cache.get::<u64>(&key).await, None);
            Ok(())
        })?;
    }

    /// **Property 3: Tag Scope**
    ///
    /// Invalidating one tag removes every entry tagged with it and leaves
    /// every other entry readable.
    #[test]
    fn prop_tag_invalidation_scope(
        keys in generators::arb_keys(8),
        mask in prop::collection::vec(any::<bool>(), 8),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let (cache, _clock) = fixtures::single_node();
            let mut tagged = BTreeSet::new();
            for (i, key) in keys.iter().enumerate() {
                let options = if mask[i] {
                    tagged.insert(key.clone());
                    SetOptions::new().with_tags(["target"])
                } else {
                    SetOptions::new().with_tags(["other"])
                };
                cache.set(key, &i, options).await.map_err(fail)?;
            }

            let removed = cache.invalidate_by_tags(&["target"]).await.map_err(fail)?;
            prop_assert_eq!(removed, tagged.len());

            for (i, key) in keys.iter().enumerate() {
                let read = cache.get::<usize>(key).await;
                if tagged.contains(key) {
                    prop_assert_eq!(read, None);
                } else {
                    prop_assert_eq!(read, Some(i));
                }
            }
            Ok(())
        })?;
    }

    /// **Property 4: Integrity**
    ///
    /// Rewriting the stored bytes of an entry makes it unreadable and
    /// removes it from the store.
    #[test]
    fn prop_tampered_entries_are_rejected(
        key in generators::arb_key(),
        payload in generators::arb_payload(),
        forged in generators::arb_payload(),
    ) {
        prop_assume!(payload != forged);
        let rt = test_runtime()?;
        rt.block_on(async {
            let (cache, _clock) = fixtures::single_node();
            cache.set(&key, &payload, SetOptions::new()).await.map_err(fail)?;

            let data_key = cache.key_space().data(&key);
            let bytes = serde_json::to_vec(&forged).map_err(fail)?;
            cache.store().set(&data_key, bytes, None).await.map_err(fail)?;

            prop_assert_eq!(cache.get::<TestPayload>(&key).await, None);
            prop_assert!(!cache.store().contains_key(&data_key));
            prop_assert_eq!(cache.get_stats().await.integrity_failures, 1);
            Ok(())
        })?;
    }

    /// **Property 5: Idempotent Delete**
    ///
    /// The first delete of a live key reports `true`, every later one
    /// `false`, and the key reads as a miss throughout.
    #[test]
    fn prop_delete_is_idempotent(
        key in generators::arb_key(),
        options in generators::arb_set_options(),
        repeats in 1usize..4,
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let (cache, _clock) = fixtures::single_node();
            cache.set(&key, &"value", options).await.map_err(fail)?;

            prop_assert!(cache.delete(&key).await.map_err(fail)?);
            for _ in 0..repeats {
                prop_assert!(!cache.delete(&key).await.map_err(fail)?);
                prop_assert_eq!(cache.get::<String>(&key).await, None);
            }
            prop_assert_eq!(cache.local_version(&key), None);
            Ok(())
        })?;
    }

    /// **Property 6: Batch Consistency**
    ///
    /// After `set_many`, `get_many` returns exactly the written entries and
    /// agrees with `get` on each of them. Unknown keys are absent.
    #[test]
    fn prop_batch_reads_agree_with_single_reads(
        keys in generators::arb_keys(6),
        payload in generators::arb_payload(),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let (cache, _clock) = fixtures::single_node();
            let entries: Vec<_> = keys
                .iter()
                .enumerate()
                .map(|(i, key)| {
                    let mut value = payload.clone();
                    value.id = i as u64;
                    SetEntry::new(key.clone(), value)
                })
                .collect();
            let versions = cache.set_many(entries).await.map_err(fail)?;
            prop_assert_eq!(versions.len(), keys.len());

            let mut wanted = keys.clone();
            wanted.push("MISSING".to_string());
            let found = cache.get_many::<TestPayload, _>(&wanted).await;
            prop_assert_eq!(found.len(), keys.len());

            for (i, key) in keys.iter().enumerate() {
                let single = cache.get::<TestPayload>(key).await;
                prop_assert_eq!(found.get(key), single.as_ref());
                prop_assert_eq!(single.map(|p| p.id), Some(i as u64));
            }
            Ok(())
        })?;
    }
}
