use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::warn;
use wildmatch::WildMatchPattern;

pub const DEFAULT_VOLATILE_CAPACITY: usize = 10_000;

/// Cache key pattern: `*` spans any run of characters, `?` exactly one.
pub type KeyPattern = WildMatchPattern<'*', '?'>;

#[derive(Debug, Clone)]
struct VolatileEntry {
    value: Value,
    /// `None` when the TTL reaches past the end of the monotonic clock.
    expires_at: Option<Instant>,
    seq: u64,
}

impl VolatileEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| now < expires_at)
    }
}

#[derive(Debug)]
struct VolatileInner {
    entries: HashMap<String, VolatileEntry>,
    insertion_order: BTreeMap<u64, String>,
    next_seq: u64,
    max_entries: usize,
    evictions: u64,
}

impl VolatileInner {
    fn remove(&mut self, key: &str) -> Option<VolatileEntry> {
        let entry = self.entries.remove(key)?;
        self.insertion_order.remove(&entry.seq);
        Some(entry)
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.insertion_order.pop_first() {
            self.entries.remove(&key);
            self.evictions = self.evictions.saturating_add(1);
        }
    }
}

/// In-process cache tier bounded by entry count. When full, the entry inserted
/// longest ago is evicted. Expiry is checked on every read.
#[derive(Debug)]
pub struct VolatileStore {
    inner: Mutex<VolatileInner>,
}

impl Default for VolatileStore {
    fn default() -> Self {
        Self::new(DEFAULT_VOLATILE_CAPACITY)
    }
}

impl VolatileStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(VolatileInner {
                entries: HashMap::new(),
                insertion_order: BTreeMap::new(),
                next_seq: 0,
                max_entries: max_entries.max(1),
                evictions: 0,
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.remove(key);
        }
        None
    }

    /// Store a value; a zero TTL removes the key instead. Overwriting a key
    /// counts as a fresh insertion for eviction order.
    pub fn set(&self, key: &str, value: Value, ttl: Duration) {
        let mut inner = self.lock();
        inner.remove(key);
        if ttl.is_zero() {
            return;
        }

        while inner.entries.len() >= inner.max_entries {
            inner.evict_oldest();
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.insertion_order.insert(seq, key.to_owned());
        inner.entries.insert(
            key.to_owned(),
            VolatileEntry {
                value,
                expires_at: Instant::now().checked_add(ttl),
                seq,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Remove every key matching a glob (`*`, `?`).
    pub fn delete_matching(&self, pattern: &str) -> usize {
        let pattern = KeyPattern::new(pattern);
        let mut inner = self.lock();
        let keys = inner
            .entries
            .keys()
            .filter(|key| pattern.matches(key))
            .cloned()
            .collect::<Vec<_>>();
        for key in &keys {
            inner.remove(key);
        }
        keys.len()
    }

    pub fn keys_matching(&self, pattern: &str) -> Vec<String> {
        let pattern = KeyPattern::new(pattern);
        let now = Instant::now();
        let inner = self.lock();
        let mut keys = inner
            .entries
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired = inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evictions(&self) -> u64 {
        self.lock().evictions
    }

    fn lock(&self) -> MutexGuard<'_, VolatileInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("volatile cache mutex was poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }
}
