use thiserror::Error;

/// Errors raised by the durable cache tier.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `DuckDB` database error.
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    /// I/O error while preparing the database directory.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: &'static str },

    #[error("cache key cannot be empty")]
    EmptyKey,

    /// The store could not service the call, e.g. its worker task failed.
    #[error("durable store unavailable: {reason}")]
    Unavailable { reason: String },
}
