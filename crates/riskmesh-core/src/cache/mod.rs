//! Two-tier response cache.
//!
//! The durable tier (when configured and reachable) is authoritative: its hit
//! or miss is the answer. When a durable call fails, the operation degrades to
//! the volatile in-process tier and logs; cache operations never fail the
//! caller. Writes and deletions go to both tiers so the volatile tier can serve
//! while the durable one is down.

mod durable;
mod ttl;
mod volatile;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use riskmesh_store::StoreError;

pub use durable::DurableStore;
pub use ttl::{CacheTtlTable, MAX_CACHE_TTL, MAX_PREMIUM_TTL_MULTIPLIER};
pub use volatile::{KeyPattern, VolatileStore, DEFAULT_VOLATILE_CAPACITY};

use crate::events::{EventBus, OrchestratorEvent};
use crate::query::CacheKey;
use crate::Category;

/// How a fetch interacts with the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
    /// Read from the cache if a non-expired entry is present;
    /// otherwise, fetch from a provider and write the response to the cache. (Default)
    #[default]
    Use,
    /// Always fetch from a provider, skipping any cached entry,
    /// and write the new response to the cache.
    Refresh,
    /// Always fetch from a provider and do not read from or write to the cache.
    Bypass,
}

impl CacheMode {
    pub const fn reads(self) -> bool {
        matches!(self, Self::Use)
    }

    pub const fn writes(self) -> bool {
        !matches!(self, Self::Bypass)
    }
}

/// Counters reported by [`ResponseCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub durable_failures: u64,
    pub volatile_entries: usize,
    pub volatile_evictions: u64,
    pub durable_enabled: bool,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    durable_failures: AtomicU64,
}

type FlightMap = HashMap<String, Arc<AsyncMutex<()>>>;

pub struct ResponseCache {
    volatile: VolatileStore,
    durable: Option<Arc<dyn DurableStore>>,
    ttl: CacheTtlTable,
    flights: Mutex<FlightMap>,
    counters: CacheCounters,
    events: EventBus,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheTtlTable::default(), DEFAULT_VOLATILE_CAPACITY)
    }
}

impl ResponseCache {
    /// Volatile-only cache.
    pub fn new(ttl: CacheTtlTable, volatile_capacity: usize) -> Self {
        Self {
            volatile: VolatileStore::new(volatile_capacity),
            durable: None,
            ttl,
            flights: Mutex::new(HashMap::new()),
            counters: CacheCounters::default(),
            events: EventBus::default(),
        }
    }

    pub fn with_durable(mut self, durable: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn ttl_table(&self) -> &CacheTtlTable {
        &self.ttl
    }

    pub fn has_durable_tier(&self) -> bool {
        self.durable.is_some()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let value = self.lookup(key).await;
        self.count_lookup(value.is_some());
        value
    }

    /// Store a value in both tiers. Without an explicit TTL the category prefix
    /// of the key selects one from the TTL table.
    pub async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or_else(|| self.ttl_for_key(key));

        if let Some(durable) = &self.durable {
            let serialized = value.to_string();
            if let Err(error) = durable.set_with_ttl(key, &serialized, ttl).await {
                self.degraded("set", &error);
            }
        }
        self.volatile.set(key, value.clone(), ttl);
    }

    pub async fn delete(&self, key: &str) -> bool {
        let mut removed = self.volatile.delete(key);
        if let Some(durable) = &self.durable {
            match durable.delete(key).await {
                Ok(deleted) => removed |= deleted,
                Err(error) => self.degraded("delete", &error),
            }
        }
        removed
    }

    /// Return the cached value or run `producer` once and cache its result.
    ///
    /// Concurrent callers for the same key wait for the first producer instead
    /// of running their own. Producer errors are returned and nothing is cached.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if let Some(value) = self.lookup(key).await {
            self.count_lookup(true);
            return Ok(value);
        }

        let flight = self.join_flight(key).await;
        if let Some(value) = self.lookup(key).await {
            self.count_lookup(true);
            return Ok(value);
        }

        self.count_lookup(false);
        let value = producer().await?;
        self.set(key, &value, ttl).await;
        drop(flight);
        Ok(value)
    }

    /// Batch read. Returns only the keys that were found.
    pub async fn get_multiple(&self, keys: &[String]) -> HashMap<String, Value> {
        let mut found = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return found;
        }

        let mut answered = false;
        if let Some(durable) = &self.durable {
            match durable.get_many(keys).await {
                Ok(raw) => {
                    answered = true;
                    for (key, serialized) in raw {
                        if let Some(value) = decode(&key, &serialized) {
                            found.insert(key, value);
                        }
                    }
                }
                Err(error) => self.degraded("get_many", &error),
            }
        }

        if !answered {
            for key in keys {
                if let Some(value) = self.volatile.get(key) {
                    found.insert(key.clone(), value);
                }
            }
        }

        let hits = found.len() as u64;
        self.counters.hits.fetch_add(hits, Ordering::Relaxed);
        self.counters
            .misses
            .fetch_add((keys.len() as u64).saturating_sub(hits), Ordering::Relaxed);
        found
    }

    /// Batch write; the durable tier receives a single transaction.
    pub async fn set_multiple(&self, entries: &[(String, Value, Option<Duration>)]) {
        if entries.is_empty() {
            return;
        }

        let resolved = entries
            .iter()
            .map(|(key, value, ttl)| {
                let ttl = ttl.unwrap_or_else(|| self.ttl_for_key(key));
                (key.clone(), value, ttl)
            })
            .collect::<Vec<_>>();

        if let Some(durable) = &self.durable {
            let serialized = resolved
                .iter()
                .map(|(key, value, ttl)| (key.clone(), value.to_string(), *ttl))
                .collect::<Vec<_>>();
            if let Err(error) = durable.set_many(&serialized).await {
                self.degraded("set_many", &error);
            }
        }

        for (key, value, ttl) in resolved {
            self.volatile.set(&key, value.clone(), ttl);
        }
    }

    /// Remove every key matching a glob from both tiers.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let volatile_removed = self.volatile.delete_matching(pattern);
        let mut removed = volatile_removed;

        if let Some(durable) = &self.durable {
            match durable.delete_matching(pattern).await {
                Ok(durable_removed) => removed = removed.max(durable_removed),
                Err(error) => self.degraded("delete_matching", &error),
            }
        }

        debug!(pattern, removed, "cache invalidation");
        removed
    }

    pub async fn invalidate_category(&self, category: &Category) -> usize {
        self.invalidate_pattern(&CacheKey::category_pattern(category))
            .await
    }

    /// Live keys matching a glob, from the authoritative tier.
    pub async fn keys_matching(&self, pattern: &str) -> Vec<String> {
        if let Some(durable) = &self.durable {
            match durable.keys_matching(pattern).await {
                Ok(keys) => return keys,
                Err(error) => self.degraded("keys_matching", &error),
            }
        }
        self.volatile.keys_matching(pattern)
    }

    pub async fn purge_expired(&self) -> usize {
        let mut purged = self.volatile.purge_expired();
        if let Some(durable) = &self.durable {
            match durable.purge_expired().await {
                Ok(count) => purged += count,
                Err(error) => self.degraded("purge_expired", &error),
            }
        }
        purged
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            durable_failures: self.counters.durable_failures.load(Ordering::Relaxed),
            volatile_entries: self.volatile.len(),
            volatile_evictions: self.volatile.evictions(),
            durable_enabled: self.durable.is_some(),
        }
    }

    async fn lookup(&self, key: &str) -> Option<Value> {
        if let Some(durable) = &self.durable {
            match durable.get(key).await {
                Ok(Some(serialized)) => return decode(key, &serialized),
                Ok(None) => return None,
                Err(error) => self.degraded("get", &error),
            }
        }
        self.volatile.get(key)
    }

    fn count_lookup(&self, hit: bool) {
        let counter = if hit {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn ttl_for_key(&self, key: &str) -> Duration {
        key.split_once(':')
            .and_then(|(prefix, _)| Category::parse(prefix).ok())
            .map(|category| self.ttl.ttl_for(&category))
            .unwrap_or_else(|| self.ttl.default_ttl())
    }

    fn degraded(&self, operation: &'static str, error: &StoreError) {
        self.counters.durable_failures.fetch_add(1, Ordering::Relaxed);
        warn!(operation, error = %error, "durable cache tier unavailable, using volatile tier");
        self.events.publish(OrchestratorEvent::CacheDegraded {
            operation,
            error: error.to_string(),
        });
    }

    async fn join_flight(&self, key: &str) -> Flight<'_> {
        let gate = {
            let mut flights = self.lock_flights();
            Arc::clone(
                flights
                    .entry(key.to_owned())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let guard = Arc::clone(&gate).lock_owned().await;

        Flight {
            flights: &self.flights,
            key: key.to_owned(),
            gate,
            guard: Some(guard),
        }
    }

    fn lock_flights(&self) -> MutexGuard<'_, FlightMap> {
        lock_flight_map(&self.flights)
    }
}

fn lock_flight_map(flights: &Mutex<FlightMap>) -> MutexGuard<'_, FlightMap> {
    flights.lock().unwrap_or_else(|poisoned| {
        warn!("cache flight map mutex was poisoned, recovering");
        PoisonError::into_inner(poisoned)
    })
}

fn decode(key: &str, serialized: &str) -> Option<Value> {
    match serde_json::from_str(serialized) {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(key, error = %error, "discarding undecodable cache entry");
            None
        }
    }
}

/// Membership in a per-key single-flight gate. The gate is removed from the
/// map once no other caller holds it.
struct Flight<'a> {
    flights: &'a Mutex<FlightMap>,
    key: String,
    gate: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut flights = lock_flight_map(self.flights);
        // One reference in the map, one held here.
        if Arc::strong_count(&self.gate) <= 2 {
            if let Some(current) = flights.get(&self.key) {
                if Arc::ptr_eq(current, &self.gate) {
                    flights.remove(&self.key);
                }
            }
        }
    }
}
