//! # Riskmesh Core
//!
//! Data-source orchestration for environmental-hazard providers.
//!
//! ## Overview
//!
//! One [`SourceOrchestrator`] owns every registered provider and answers
//! `fetch(category, query)` with the best available payload:
//!
//! - **Response cache** with per-category TTLs over a durable DuckDB tier and a
//!   volatile in-process tier
//! - **Quota governor** with token buckets, concurrency ceilings, daily cost
//!   budgets and a priority admission queue
//! - **Circuit breakers** isolating failing providers
//! - **Network transport** with classified retries, backoff and hard timeouts
//! - **Availability monitor** running synthetic probes on independent timers
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Two-tier response cache |
//! | [`circuit_breaker`] | Per-provider circuit breaker |
//! | [`config`] | JSON configuration and builder wiring |
//! | [`data_source`] | Provider adapter contract and template adapter |
//! | [`error`] | Core error types |
//! | [`events`] | Observer channel |
//! | [`http_client`] | HTTP client abstraction |
//! | [`monitor`] | Availability monitor |
//! | [`provider_policy`] | Fixed provider configuration |
//! | [`query`] | Query normalization and cache keys |
//! | [`retry`] | Backoff strategies |
//! | [`routing`] | Source orchestrator |
//! | [`source`] | Provider and category identifiers |
//! | [`throttling`] | Quota governor |
//! | [`transport`] | Retrying network transport |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use riskmesh_core::{Category, FetchOptions, OrchestratorConfig, Query};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = OrchestratorConfig::from_env()?.into_builder()?.build()?;
//!     orchestrator.start();
//!
//!     let query = Query::new().with("lat", 37.77).with("lon", -122.41);
//!     let result = orchestrator
//!         .fetch(&Category::EARTHQUAKE_RISK, &query, &FetchOptions::default())
//!         .await?;
//!     println!("{} answered: {}", result.source_used, result.payload);
//!
//!     orchestrator.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │ Source Orchestrator │──────────────────────────┐
//! └──────────┬──────────┘                          │
//!            │ cache → breaker → quota → transport │
//!            ▼                                     ▼
//! ┌─────────────────────┐               ┌─────────────────────┐
//! │ Response Cache      │               │ Availability Monitor│
//! │ DuckDB + volatile   │               │ (own timers)        │
//! └─────────────────────┘               └──────────┬──────────┘
//!            ┌─────────────────────────────────────┘
//!            ▼
//! ┌─────────────────────┐     ┌─────────────────────┐
//! │ Transport           │────▶│ HTTP Client         │
//! │ (retry / backoff)   │     │ (reqwest, rustls)   │
//! └─────────────────────┘     └─────────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! The only terminal fetch failure is [`AllSourcesExhausted`], carrying every
//! attempted provider and the last underlying cause:
//!
//! ```rust
//! use riskmesh_core::{AllSourcesExhausted, SourceErrorKind};
//!
//! fn explain(failure: &AllSourcesExhausted) -> &'static str {
//!     match failure.last_error.as_ref().map(|error| error.kind) {
//!         Some(SourceErrorKind::Transient) => "providers are flaky, try later",
//!         Some(SourceErrorKind::Permanent) => "providers rejected the query",
//!         Some(_) => "provider call failed",
//!         None => "no provider could be called",
//!     }
//! }
//! ```
//!
//! ## Security
//!
//! - API keys are read from environment variables only (never logged)
//! - All HTTP requests use TLS via rustls

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod data_source;
pub mod error;
pub mod events;
pub mod http_client;
pub mod monitor;
pub mod provider_policy;
pub mod query;
pub mod retry;
pub mod routing;
pub mod source;
pub mod throttling;
pub mod transport;

// Caching
pub use cache::{CacheMode, CacheStats, CacheTtlTable, DurableStore, ResponseCache, VolatileStore};

// Circuit breaker
pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};

// Configuration
pub use config::OrchestratorConfig;

// Adapter contract
pub use data_source::{ApiKeyPlacement, ProviderAdapter, SourceError, SourceErrorKind, TemplateAdapter};

// Error types
pub use error::{CoreError, ValidationError};

// Events
pub use events::{EventBus, OrchestratorEvent};

// HTTP client types
pub use http_client::{
    HttpClient, HttpError, HttpErrorKind, HttpMethod, HttpPoolConfig, HttpRequest, HttpResponse,
    ReqwestHttpClient,
};

// Availability monitor
pub use monitor::{
    AvailabilityMonitor, HealthRecord, HealthState, HealthThresholds, JsonFieldsValidator,
    MonitorError, ProbeConfig, ResponseValidator, ScheduleState,
};

// Provider configuration
pub use provider_policy::{ProviderConfig, ProviderRegistration, RateLimit};

// Queries
pub use query::{CacheKey, Query};

// Retry logic
pub use retry::Backoff;

// Orchestration
pub use routing::{
    AllSourcesExhausted, FetchOptions, FetchResult, OrchestratorBuilder, ProviderFailure, SkipReason,
    SkippedSource, SourceOrchestrator, SourceStatus, SourceUsed,
};

// Identifiers
pub use source::{Category, ProviderId, SourceType};

// Quota governor
pub use throttling::{DenialReason, QueueError, QuotaDenied, QuotaGovernor, QuotaPermit, QuotaPolicy, QuotaSnapshot};

// Transport
pub use transport::Transport;

// Durable tier (re-exported from riskmesh-store)
pub use riskmesh_store::{DuckDbCacheStore, StoreConfig, StoreError, StoreStats};
