//! Behavior-driven tests for the two-tier response cache
//!
//! These tests verify HOW cached payloads expire, how concurrent misses share
//! one computation, and how the durable tier is used and survived.

use async_trait::async_trait;
use riskmesh_core::{
    CacheKey, CacheTtlTable, Category, DuckDbCacheStore, DurableStore, Query, ResponseCache, StoreConfig,
    StoreError,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A durable tier whose backing database is unreachable.
struct Unreachable;

fn unreachable() -> StoreError {
    StoreError::Unavailable {
        reason: String::from("connection refused"),
    }
}

#[async_trait]
impl DurableStore for Unreachable {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(unreachable())
    }

    async fn get_many(&self, _keys: &[String]) -> Result<HashMap<String, String>, StoreError> {
        Err(unreachable())
    }

    async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), StoreError> {
        Err(unreachable())
    }

    async fn set_many(&self, _entries: &[(String, String, Duration)]) -> Result<(), StoreError> {
        Err(unreachable())
    }

    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        Err(unreachable())
    }

    async fn keys_matching(&self, _pattern: &str) -> Result<Vec<String>, StoreError> {
        Err(unreachable())
    }

    async fn delete_matching(&self, _pattern: &str) -> Result<usize, StoreError> {
        Err(unreachable())
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Err(unreachable())
    }
}

fn flood_key(address: &str) -> String {
    CacheKey::new(&Category::FLOOD_RISK, &Query::new().with("address", address)).into_string()
}

fn open_store(dir: &TempDir) -> Arc<DuckDbCacheStore> {
    Arc::new(
        DuckDbCacheStore::open(StoreConfig::at_path(dir.path().join("responses.duckdb")))
            .expect("store opens"),
    )
}

// =============================================================================
// Cache: Expiry
// =============================================================================

#[tokio::test]
async fn when_an_entry_outlives_its_ttl_it_is_no_longer_served() {
    // Given: A payload cached for 50ms
    let cache = ResponseCache::default();
    let key = flood_key("1 Canal St");
    cache
        .set(&key, &json!({"zone": "AE"}), Some(Duration::from_millis(50)))
        .await;
    assert_eq!(cache.get(&key).await, Some(json!({"zone": "AE"})));

    // When: The TTL elapses
    tokio::time::sleep(Duration::from_millis(120)).await;

    // Then: The entry is a miss
    assert_eq!(cache.get(&key).await, None);
    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn when_no_ttl_is_given_the_category_ttl_applies() {
    // Given: A TTL table where flood risk lives 40ms and everything else an hour
    let ttl = CacheTtlTable::default().with_category(Category::FLOOD_RISK, Duration::from_millis(40));
    let cache = ResponseCache::new(ttl, 100);
    let flood = flood_key("1 Canal St");
    let quake = CacheKey::new(&Category::EARTHQUAKE_RISK, &Query::new()).into_string();

    // When: Both are stored without an explicit TTL and time passes
    cache.set(&flood, &json!(1), None).await;
    cache.set(&quake, &json!(2), None).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Then: Only the flood entry expired
    assert_eq!(cache.get(&flood).await, None);
    assert_eq!(cache.get(&quake).await, Some(json!(2)));
}

#[tokio::test]
async fn when_the_volatile_tier_is_full_the_oldest_entry_is_evicted() {
    // Given: Room for two entries
    let cache = ResponseCache::new(CacheTtlTable::default(), 2);

    // When: Three are stored
    for (index, address) in ["a", "b", "c"].into_iter().enumerate() {
        cache.set(&flood_key(address), &json!(index), None).await;
    }

    // Then: The first one is gone
    assert_eq!(cache.get(&flood_key("a")).await, None);
    assert_eq!(cache.get(&flood_key("c")).await, Some(json!(2)));
    assert_eq!(cache.stats().volatile_evictions, 1);
}

// =============================================================================
// Cache: Single-flight
// =============================================================================

#[tokio::test]
async fn when_concurrent_callers_miss_the_producer_runs_once() {
    // Given: A slow producer and eight concurrent callers
    let cache = Arc::new(ResponseCache::default());
    let runs = Arc::new(AtomicU32::new(0));
    let key = flood_key("500 Poydras St");

    // When: They all ask for the same key
    let callers = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let runs = Arc::clone(&runs);
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(&key, None, || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<Value, String>(json!({"zone": "X"}))
                    })
                    .await
            })
        })
        .collect::<Vec<_>>();

    // Then: Everyone gets the value and the producer ran once
    for caller in callers {
        let value = caller.await.expect("task joins").expect("producer succeeds");
        assert_eq!(value, json!({"zone": "X"}));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn when_the_producer_fails_nothing_is_cached() {
    // Given: An empty cache
    let cache = ResponseCache::default();
    let key = flood_key("1 Canal St");

    // When: The producer errors
    let outcome = cache
        .get_or_compute(&key, None, || async { Err::<Value, _>("upstream down") })
        .await;

    // Then: The error is returned and the next call computes again
    assert_eq!(outcome, Err("upstream down"));
    let retried = cache
        .get_or_compute(&key, None, || async { Ok::<_, &str>(json!("fresh")) })
        .await;
    assert_eq!(retried, Ok(json!("fresh")));
}

// =============================================================================
// Cache: Durable Tier
// =============================================================================

#[tokio::test]
async fn when_the_process_restarts_durable_entries_survive() {
    // Given: A cache backed by a DuckDB file
    let dir = TempDir::new().expect("temp dir");
    let key = flood_key("1 Canal St");
    {
        let cache = ResponseCache::default().with_durable(open_store(&dir));
        cache.set(&key, &json!({"zone": "AE"}), None).await;
    }

    // When: A fresh cache opens the same file
    let reopened = ResponseCache::default().with_durable(open_store(&dir));

    // Then: The entry is served from the durable tier
    assert_eq!(reopened.get(&key).await, Some(json!({"zone": "AE"})));
    assert_eq!(reopened.keys_matching("flood_risk:*").await, vec![key]);
}

#[tokio::test]
async fn when_a_pattern_is_invalidated_both_tiers_drop_it() {
    // Given: Flood and storm entries in a durable-backed cache
    let dir = TempDir::new().expect("temp dir");
    let cache = ResponseCache::default().with_durable(open_store(&dir));
    cache.set(&flood_key("a"), &json!(1), None).await;
    cache.set(&flood_key("b"), &json!(2), None).await;
    let storm = CacheKey::new(&Category::STORM_RISK, &Query::new()).into_string();
    cache.set(&storm, &json!(3), None).await;

    // When: Flood risk is invalidated
    let removed = cache.invalidate_category(&Category::FLOOD_RISK).await;

    // Then: Only flood entries are gone
    assert_eq!(removed, 2);
    assert_eq!(cache.get(&flood_key("a")).await, None);
    assert_eq!(cache.get(&storm).await, Some(json!(3)));
}

#[tokio::test]
async fn when_the_durable_tier_is_down_the_volatile_tier_answers() {
    // Given: A cache whose durable tier always fails
    let cache = ResponseCache::default().with_durable(Arc::new(Unreachable));
    let key = flood_key("1 Canal St");

    // When: A value is stored and read back
    cache.set(&key, &json!({"zone": "VE"}), None).await;
    let value = cache.get(&key).await;

    // Then: The caller never sees the failure
    assert_eq!(value, Some(json!({"zone": "VE"})));
    let stats = cache.stats();
    assert!(stats.durable_enabled);
    assert_eq!(stats.durable_failures, 2);
    assert_eq!(cache.purge_expired().await, 0);
}

#[tokio::test]
async fn when_batching_reads_only_found_keys_are_returned() {
    // Given: Two of three keys cached
    let cache = ResponseCache::default();
    cache
        .set_multiple(&[
            (flood_key("a"), json!("A"), None),
            (flood_key("b"), json!("B"), None),
        ])
        .await;

    // When: All three are requested
    let found = cache
        .get_multiple(&[flood_key("a"), flood_key("b"), flood_key("c")])
        .await;

    // Then: The missing key is simply absent
    assert_eq!(found.len(), 2);
    assert_eq!(found.get(&flood_key("b")), Some(&json!("B")));
}
