//! # Riskmesh Store
//!
//! DuckDB-backed durable tier for the riskmesh response cache.
//!
//! ## Overview
//!
//! The store keeps serialized cache entries in a single `response_cache` table,
//! keyed by the cache key, with an absolute expiry timestamp per row. Rows past
//! their expiry are never returned, and `purge_expired` deletes them.
//!
//! Key patterns use glob syntax (`*` any run of characters, `?` one character),
//! translated to a parameterized `LIKE ... ESCAPE` clause.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use riskmesh_store::{DuckDbCacheStore, StoreConfig};
//!
//! fn main() -> Result<(), riskmesh_store::StoreError> {
//!     let store = DuckDbCacheStore::open(StoreConfig::default())?;
//!     store.set_with_ttl("geocoding:abc", r#"{"lat":1.0}"#, Duration::from_secs(60))?;
//!     assert!(store.get("geocoding:abc")?.is_some());
//!     store.delete_matching("geocoding:*")?;
//!     Ok(())
//! }
//! ```
//!
//! ## Tables
//!
//! | Table | Description |
//! |-------|-------------|
//! | `response_cache` | Serialized cache entries with expiry |
//! | `schema_migrations` | Applied migration versions |

pub mod duckdb;
pub mod error;
pub mod migrations;

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ::duckdb::{Connection, ToSql};
use serde::Serialize;
use tracing::debug;

pub use crate::duckdb::{ConnectionPool, PooledConnection};
pub use crate::error::StoreError;

/// Keys per `IN (...)` clause in batch reads.
const GET_MANY_CHUNK: usize = 256;

/// Configuration for the durable cache database.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for riskmesh data.
    pub riskmesh_home: PathBuf,
    /// Path to the `DuckDB` database file.
    pub db_path: PathBuf,
    /// Maximum number of idle connections kept in the pool.
    pub max_pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let riskmesh_home = resolve_riskmesh_home();
        let db_path = riskmesh_home.join("cache").join("responses.duckdb");
        Self {
            riskmesh_home,
            db_path,
            max_pool_size: 4,
        }
    }
}

impl StoreConfig {
    /// Configuration for a database file at an explicit path.
    pub fn at_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }
}

/// A cache row as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub key: String,
    pub value: String,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    pub size_bytes: u64,
}

impl StoredEntry {
    pub fn remaining_ttl(&self) -> Duration {
        let remaining = self.expires_at_ms.saturating_sub(now_ms());
        Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
    }
}

/// Entry count and size totals for live rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub live_entries: u64,
    pub expired_entries: u64,
    pub live_bytes: u64,
}

/// Durable key/value cache on top of `DuckDB`.
#[derive(Clone)]
pub struct DuckDbCacheStore {
    config: StoreConfig,
    pool: ConnectionPool,
}

impl DuckDbCacheStore {
    /// Open the store at the default location (`$RISKMESH_HOME/cache/responses.duckdb`).
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(StoreConfig::default())
    }

    /// Open the store with the specified configuration and apply migrations.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let pool = ConnectionPool::open(config.db_path.clone(), config.max_pool_size)?;
        let store = Self { config, pool };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<(), StoreError> {
        let connection = self.pool.acquire()?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        self.pool.db_path()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Fetch a live entry. Expired rows are treated as absent.
    pub fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let connection = self.pool.acquire()?;
        let mut statement = connection.prepare(
            "SELECT key, value, created_at_ms, expires_at_ms, size_bytes \
             FROM response_cache WHERE key = ? AND expires_at_ms > ?",
        )?;
        let now = now_ms();
        let params: [&dyn ToSql; 2] = [&key, &now];
        let mut rows = statement.query_map(params.as_slice(), map_entry)?;

        match rows.next() {
            Some(entry) => Ok(Some(entry?)),
            None => Ok(None),
        }
    }

    /// Fetch several live entries with one query per chunk of keys.
    pub fn get_many(&self, keys: &[String]) -> Result<HashMap<String, StoredEntry>, StoreError> {
        let mut found = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return Ok(found);
        }

        let connection = self.pool.acquire()?;
        let now = now_ms();
        for chunk in keys.chunks(GET_MANY_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT key, value, created_at_ms, expires_at_ms, size_bytes \
                 FROM response_cache WHERE expires_at_ms > ? AND key IN ({placeholders})"
            );

            let mut params: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() + 1);
            params.push(&now);
            for key in chunk {
                params.push(key);
            }

            let mut statement = connection.prepare(sql.as_str())?;
            let rows = statement.query_map(params.as_slice(), map_entry)?;
            for entry in rows {
                let entry = entry?;
                found.insert(entry.key.clone(), entry);
            }
        }

        Ok(found)
    }

    /// Insert or replace an entry expiring `ttl` from now. A zero TTL removes the key.
    pub fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }

        let connection = self.pool.acquire()?;
        upsert(&connection, key, value, ttl, now_ms())
    }

    /// Insert or replace several entries inside one transaction.
    pub fn set_many(&self, entries: &[(String, String, Duration)]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        if entries.iter().any(|(key, _, _)| key.is_empty()) {
            return Err(StoreError::EmptyKey);
        }

        let connection = self.pool.acquire()?;
        let now = now_ms();
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<(), StoreError> {
            for (key, value, ttl) in entries {
                upsert(&connection, key, value, *ttl, now)?;
            }
            Ok(())
        })();

        finalize_transaction(&connection, result)
    }

    /// Remove one key. Returns whether a row was deleted.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let connection = self.pool.acquire()?;
        let deleted = connection.execute("DELETE FROM response_cache WHERE key = ?", [key])?;
        Ok(deleted > 0)
    }

    /// List live keys matching a glob pattern, sorted.
    pub fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let like = glob_to_like(pattern)?;
        let connection = self.pool.acquire()?;
        let mut statement = connection.prepare(
            "SELECT key FROM response_cache \
             WHERE key LIKE ? ESCAPE '\\' AND expires_at_ms > ? ORDER BY key",
        )?;
        let now = now_ms();
        let params: [&dyn ToSql; 2] = [&like, &now];
        let rows = statement.query_map(params.as_slice(), |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for key in rows {
            keys.push(key?);
        }
        Ok(keys)
    }

    /// Delete every key (live or expired) matching a glob pattern.
    pub fn delete_matching(&self, pattern: &str) -> Result<usize, StoreError> {
        let like = glob_to_like(pattern)?;
        let connection = self.pool.acquire()?;
        let deleted = connection.execute(
            "DELETE FROM response_cache WHERE key LIKE ? ESCAPE '\\'",
            [like.as_str()],
        )?;
        debug!(pattern, deleted, "durable cache pattern invalidation");
        Ok(deleted)
    }

    /// Delete rows whose expiry has passed.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let connection = self.pool.acquire()?;
        let deleted = connection.execute(
            "DELETE FROM response_cache WHERE expires_at_ms <= ?",
            [now_ms()],
        )?;
        Ok(deleted)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let connection = self.pool.acquire()?;
        let now = now_ms();
        let params: [&dyn ToSql; 3] = [&now, &now, &now];
        let (live, expired, bytes): (i64, i64, i64) = connection.query_row(
            "SELECT \
                COUNT(*) FILTER (WHERE expires_at_ms > ?), \
                COUNT(*) FILTER (WHERE expires_at_ms <= ?), \
                COALESCE(SUM(size_bytes) FILTER (WHERE expires_at_ms > ?), 0) \
             FROM response_cache",
            params.as_slice(),
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(StoreStats {
            live_entries: u64::try_from(live).unwrap_or(0),
            expired_entries: u64::try_from(expired).unwrap_or(0),
            live_bytes: u64::try_from(bytes).unwrap_or(0),
        })
    }
}

fn upsert(
    connection: &Connection,
    key: &str,
    value: &str,
    ttl: Duration,
    now: i64,
) -> Result<(), StoreError> {
    if ttl.is_zero() {
        connection.execute("DELETE FROM response_cache WHERE key = ?", [key])?;
        return Ok(());
    }

    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    let expires_at = now.saturating_add(ttl_ms);
    let size = i64::try_from(value.len()).unwrap_or(i64::MAX);
    let params: [&dyn ToSql; 5] = [&key, &value, &now, &expires_at, &size];
    connection.execute(
        "INSERT OR REPLACE INTO response_cache \
         (key, value, created_at_ms, expires_at_ms, size_bytes) VALUES (?, ?, ?, ?, ?)",
        params.as_slice(),
    )?;
    Ok(())
}

fn map_entry(row: &::duckdb::Row<'_>) -> Result<StoredEntry, ::duckdb::Error> {
    let size: i64 = row.get(4)?;
    Ok(StoredEntry {
        key: row.get(0)?,
        value: row.get(1)?,
        created_at_ms: row.get(2)?,
        expires_at_ms: row.get(3)?,
        size_bytes: u64::try_from(size).unwrap_or(0),
    })
}

fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, StoreError>,
) -> Result<T, StoreError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

/// Translate a glob (`*`, `?`) into a `LIKE` pattern using `\` as escape.
pub fn glob_to_like(pattern: &str) -> Result<String, StoreError> {
    if pattern.is_empty() {
        return Err(StoreError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason: "pattern is empty",
        });
    }

    let mut like = String::with_capacity(pattern.len() + 4);
    for ch in pattern.chars() {
        match ch {
            '*' => like.push('%'),
            '?' => like.push('_'),
            '%' | '_' | '\\' => {
                like.push('\\');
                like.push(ch);
            }
            other => like.push(other),
        }
    }
    Ok(like)
}

fn now_ms() -> i64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}

/// Resolve the riskmesh data root: `RISKMESH_HOME`, then `$HOME/.riskmesh`.
pub fn resolve_riskmesh_home() -> PathBuf {
    if let Some(path) = env::var_os("RISKMESH_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".riskmesh");
    }

    PathBuf::from(".riskmesh")
}
