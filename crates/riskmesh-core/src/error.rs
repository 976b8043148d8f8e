use std::path::PathBuf;

use thiserror::Error;

use riskmesh_store::StoreError;

/// Validation and contract errors exposed by `riskmesh-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("provider id cannot be empty")]
    EmptyProviderId,
    #[error("provider id length {len} exceeds max {max}")]
    ProviderIdTooLong { len: usize, max: usize },
    #[error("provider id contains invalid character '{ch}' at index {index}")]
    ProviderIdInvalidChar { ch: char, index: usize },

    #[error("category cannot be empty")]
    EmptyCategory,
    #[error("category contains invalid character '{ch}' at index {index}")]
    CategoryInvalidChar { ch: char, index: usize },

    #[error("invalid source type '{value}', expected one of government, commercial, community")]
    InvalidSourceType { value: String },
    #[error("invalid http method '{value}'")]
    InvalidHttpMethod { value: String },

    #[error("provider '{provider}' reliability {value} must be within [0, 1]")]
    ReliabilityOutOfRange { provider: String, value: String },
    #[error("provider '{provider}' field '{field}' must be greater than zero")]
    NonPositive { provider: String, field: &'static str },
    #[error("provider '{provider}' field '{field}' must be a finite non-negative number")]
    InvalidAmount { provider: String, field: &'static str },
    #[error("provider '{provider}' must serve at least one category")]
    NoCategories { provider: String },
    #[error("provider '{provider}' is registered more than once")]
    DuplicateProvider { provider: String },
    #[error("provider '{provider}' is not registered")]
    UnknownProvider { provider: String },
    #[error("provider '{provider}' does not serve category '{category}'")]
    CategoryNotServed { provider: String, category: String },

    #[error("query must be a JSON object")]
    QueryNotObject,
    #[error("base url cannot be empty for provider '{provider}'")]
    EmptyBaseUrl { provider: String },
    #[error("configuration field '{field}' is invalid: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("http client setup failed: {0}")]
    HttpSetup(String),
}
