//! `DuckDB` connection pooling for the cache database.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ::duckdb::Connection;
use tracing::warn;

struct PoolInner {
    db_path: PathBuf,
    max_idle: usize,
    /// Root handle every pooled connection is cloned from, so all of them share
    /// one database instance.
    root: Mutex<Connection>,
    idle: Mutex<Vec<Connection>>,
}

impl PoolInner {
    fn lock_idle(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.idle.lock().unwrap_or_else(|poisoned| {
            warn!("duckdb idle pool mutex was poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }
}

/// Small connection pool over a single `DuckDB` database file.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Open the database file and create a pool keeping at most `max_idle`
    /// connections around between uses.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or configured.
    pub fn open(path: impl Into<PathBuf>, max_idle: usize) -> Result<Self, ::duckdb::Error> {
        let db_path = path.into();
        let root = Connection::open(&db_path)?;
        configure_connection(&root)?;

        Ok(Self {
            inner: Arc::new(PoolInner {
                db_path,
                max_idle: max_idle.max(1),
                root: Mutex::new(root),
                idle: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Take an idle connection or clone a new one from the root handle.
    ///
    /// # Errors
    /// Returns an error if a new connection cannot be created.
    pub fn acquire(&self) -> Result<PooledConnection, ::duckdb::Error> {
        let reused = self.inner.lock_idle().pop();

        let connection = match reused {
            Some(connection) => connection,
            None => {
                let root = self.inner.root.lock().unwrap_or_else(|poisoned| {
                    warn!("duckdb root connection mutex was poisoned, recovering");
                    PoisonError::into_inner(poisoned)
                });
                root.try_clone()?
            }
        };

        Ok(PooledConnection {
            pool: Arc::clone(&self.inner),
            connection: Some(connection),
        })
    }

    pub fn idle_connections(&self) -> usize {
        self.inner.lock_idle().len()
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        self.inner.db_path.as_path()
    }
}

/// A pooled connection that goes back to the idle list when dropped.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    connection: Option<Connection>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("pooled connection is present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("pooled connection is present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        let mut idle = self.pool.lock_idle();
        if idle.len() < self.pool.max_idle {
            idle.push(connection);
        }
    }
}

fn configure_connection(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch("PRAGMA disable_progress_bar;")
}
