//! JSON configuration for a complete orchestrator.
//!
//! Durations are integer `*_ms` / `*_secs` fields. API keys never live in the
//! file: a provider names the environment variable holding its key in
//! `api_key_env`, and the variable is read once by
//! [`OrchestratorConfig::into_builder`].
//!
//! ```json
//! {
//!   "providers": [{
//!     "id": "USGS",
//!     "categories": ["earthquake_risk"],
//!     "priority": 1,
//!     "request": {
//!       "base_url": "https://earthquake.usgs.gov/fdsnws/event/1/query",
//!       "field_params": {"lat": "latitude", "lon": "longitude"},
//!       "static_params": {"format": "geojson"}
//!     },
//!     "probe": {"url": "https://earthquake.usgs.gov/fdsnws/event/1/version"}
//!   }]
//! }
//! ```

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use riskmesh_store::{resolve_riskmesh_home, DuckDbCacheStore, StoreConfig};

use crate::cache::{CacheTtlTable, DEFAULT_VOLATILE_CAPACITY, MAX_CACHE_TTL, MAX_PREMIUM_TTL_MULTIPLIER};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::data_source::{ApiKeyPlacement, TemplateAdapter};
use crate::http_client::{HttpMethod, HttpPoolConfig, HttpRequest};
use crate::monitor::{HealthThresholds, JsonFieldsValidator, ProbeConfig, DEFAULT_PROBE_BUDGET_PER_SECOND};
use crate::provider_policy::{ProviderConfig, ProviderRegistration, RateLimit};
use crate::retry::Backoff;
use crate::routing::OrchestratorBuilder;
use crate::throttling::DEFAULT_QUEUE_POLL_INTERVAL;
use crate::{Category, CoreError, ProviderId, SourceType, ValidationError};

pub const CONFIG_PATH_ENV: &str = "RISKMESH_CONFIG";
pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub providers: Vec<ProviderSettings>,
    pub cache: CacheSettings,
    pub breaker: BreakerSettings,
    pub backoff: BackoffSettings,
    pub monitor: MonitorSettings,
    pub http: HttpSettings,
    pub queue_poll_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            cache: CacheSettings::default(),
            breaker: BreakerSettings::default(),
            backoff: BackoffSettings::default(),
            monitor: MonitorSettings::default(),
            http: HttpSettings::default(),
            queue_poll_interval_ms: duration_to_ms(DEFAULT_QUEUE_POLL_INTERVAL),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSettings {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_source_type")]
    pub source_type: SourceType,
    pub categories: Vec<String>,
    /// Per-category priority overriding `priority`.
    #[serde(default)]
    pub priority_overrides: BTreeMap<String, u32>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_reliability")]
    pub reliability: f64,
    #[serde(default)]
    pub cost_per_call: f64,
    #[serde(default = "default_concurrency_ceiling")]
    pub concurrency_ceiling: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rate_capacity")]
    pub rate_limit_capacity: u32,
    #[serde(default = "default_rate_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default)]
    pub daily_cost_ceiling: Option<f64>,
    pub request: RequestSettings,
    #[serde(default)]
    pub probe: Option<ProbeSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestSettings {
    pub base_url: String,
    #[serde(default = "default_method")]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Query field → URL parameter.
    #[serde(default)]
    pub field_params: BTreeMap<String, String>,
    #[serde(default)]
    pub static_params: BTreeMap<String, String>,
    /// Category → path appended to `base_url`.
    #[serde(default)]
    pub category_paths: BTreeMap<String, String>,
    /// JSON pointer selecting the payload.
    #[serde(default)]
    pub extract: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Send the key in this header.
    #[serde(default)]
    pub api_key_header: Option<String>,
    /// Send the key as this URL parameter. Used when no header is named.
    #[serde(default)]
    pub api_key_param: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeSettings {
    pub url: String,
    #[serde(default = "default_probe_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub expected_statuses: Vec<u16>,
    /// JSON pointers that must be present and non-null in the probe body.
    #[serde(default)]
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    pub volatile_capacity: usize,
    /// Use the DuckDB tier.
    pub durable: bool,
    /// Defaults to `<RISKMESH_HOME>/cache/responses.duckdb`.
    pub db_path: Option<PathBuf>,
    pub default_ttl_secs: Option<u64>,
    pub category_ttl_secs: BTreeMap<String, u64>,
    pub premium_cost_threshold: f64,
    pub premium_ttl_multiplier: f64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            volatile_capacity: DEFAULT_VOLATILE_CAPACITY,
            durable: true,
            db_path: None,
            default_ttl_secs: None,
            category_ttl_secs: BTreeMap::new(),
            premium_cost_threshold: 0.05,
            premium_ttl_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_timeout_secs: u64,
    pub failure_window_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            open_timeout_secs: defaults.open_timeout.as_secs(),
            failure_window_secs: defaults.failure_window.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffSettings {
    pub base_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_ms: 200,
            max_ms: 5_000,
            factor: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorSettings {
    pub degraded_consecutive_failures: u32,
    pub unhealthy_consecutive_failures: u32,
    pub degraded_error_rate: f64,
    pub unhealthy_error_rate: f64,
    pub window: usize,
    pub min_samples: usize,
    pub latency_alpha: f64,
    pub probe_budget_per_second: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        let defaults = HealthThresholds::default();
        Self {
            degraded_consecutive_failures: defaults.degraded_consecutive_failures,
            unhealthy_consecutive_failures: defaults.unhealthy_consecutive_failures,
            degraded_error_rate: defaults.degraded_error_rate,
            unhealthy_error_rate: defaults.unhealthy_error_rate,
            window: defaults.window,
            min_samples: defaults.min_samples,
            latency_alpha: defaults.latency_alpha,
            probe_budget_per_second: DEFAULT_PROBE_BUDGET_PER_SECOND,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpSettings {
    pub max_idle_per_host: usize,
    pub idle_timeout_secs: u64,
    pub connect_timeout_ms: u64,
    pub user_agent: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        let defaults = HttpPoolConfig::default();
        Self {
            max_idle_per_host: defaults.max_idle_per_host,
            idle_timeout_secs: defaults.idle_timeout.as_secs(),
            connect_timeout_ms: duration_to_ms(defaults.connect_timeout),
            user_agent: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&raw)?;
        debug!(path = %path.display(), providers = config.providers.len(), "loaded configuration");
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, CoreError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// `RISKMESH_CONFIG` if set, else `<RISKMESH_HOME>/config.json` if present,
    /// else an empty default configuration.
    pub fn from_env() -> Result<Self, CoreError> {
        if let Some(path) = env::var_os(CONFIG_PATH_ENV).filter(|path| !path.is_empty()) {
            return Self::from_path(PathBuf::from(path));
        }

        let default_path = resolve_riskmesh_home().join(CONFIG_FILE_NAME);
        if default_path.is_file() {
            return Self::from_path(default_path);
        }

        debug!("no configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut seen = std::collections::HashSet::new();
        for settings in &self.providers {
            let registration_id = ProviderId::parse(&settings.id)?;
            if !seen.insert(registration_id.clone()) {
                return Err(ValidationError::DuplicateProvider {
                    provider: settings.id.clone(),
                });
            }
            if settings.categories.is_empty() {
                return Err(ValidationError::NoCategories {
                    provider: settings.id.clone(),
                });
            }
            for category in settings
                .categories
                .iter()
                .chain(settings.priority_overrides.keys())
                .chain(settings.request.category_paths.keys())
            {
                Category::parse(category)?;
            }
            if settings.request.base_url.trim().is_empty() {
                return Err(ValidationError::EmptyBaseUrl {
                    provider: settings.id.clone(),
                });
            }
            settings.provider_config().validate(&registration_id)?;
        }

        self.cache.validate()?;
        if self.breaker.failure_threshold == 0 {
            return Err(ValidationError::InvalidSetting {
                field: "breaker.failure_threshold",
                reason: String::from("must be greater than zero"),
            });
        }
        if self.backoff.factor < 1.0 || !self.backoff.factor.is_finite() {
            return Err(ValidationError::InvalidSetting {
                field: "backoff.factor",
                reason: format!("{} is below 1", self.backoff.factor),
            });
        }
        if self.monitor.unhealthy_consecutive_failures < self.monitor.degraded_consecutive_failures {
            return Err(ValidationError::InvalidSetting {
                field: "monitor.unhealthy_consecutive_failures",
                reason: String::from("must not be below monitor.degraded_consecutive_failures"),
            });
        }
        Ok(())
    }

    /// Turn the configuration into a builder with template adapters, probes
    /// and, when enabled, the DuckDB tier.
    ///
    /// A provider whose `api_key_env` variable is unset is registered disabled.
    /// A durable tier that fails to open is dropped with a warning.
    pub fn into_builder(self) -> Result<OrchestratorBuilder, CoreError> {
        self.validate()?;

        let mut builder = OrchestratorBuilder::new()
            .http_pool(self.http.pool_config())
            .backoff(self.backoff.backoff())
            .breaker_config(self.breaker.breaker_config())
            .cache_ttl(self.cache.ttl_table()?)
            .volatile_capacity(self.cache.volatile_capacity)
            .monitor_thresholds(self.monitor.thresholds())
            .probe_budget(self.monitor.probe_budget_per_second)
            .queue_poll_interval(Duration::from_millis(self.queue_poll_interval_ms));

        if self.cache.durable {
            let store_config = match &self.cache.db_path {
                Some(path) => StoreConfig::at_path(path),
                None => StoreConfig::default(),
            };
            match DuckDbCacheStore::open(store_config) {
                Ok(store) => {
                    info!(path = %store.db_path().display(), "durable cache tier opened");
                    builder = builder.durable_store(Arc::new(store));
                }
                Err(error) => {
                    warn!(error = %error, "durable cache tier unavailable, using volatile tier only");
                }
            }
        }

        for settings in self.providers {
            builder = builder.register(settings.into_registration()?);
        }
        Ok(builder)
    }
}

impl ProviderSettings {
    fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            priority: self.priority,
            reliability: self.reliability,
            cost_per_call: self.cost_per_call,
            concurrency_ceiling: self.concurrency_ceiling,
            timeout: Duration::from_millis(self.timeout_ms),
            retry_budget: self.retry_budget,
            enabled: self.enabled,
            rate_limit: RateLimit {
                capacity: self.rate_limit_capacity,
                window: Duration::from_secs(self.rate_limit_window_secs),
            },
            daily_cost_ceiling: self.daily_cost_ceiling,
        }
    }

    fn into_registration(self) -> Result<ProviderRegistration, CoreError> {
        let id = ProviderId::parse(&self.id)?;
        let mut config = self.provider_config();

        let mut adapter = TemplateAdapter::new(self.request.base_url.as_str())
            .with_method(self.request.method);
        for (name, value) in &self.request.headers {
            adapter = adapter.with_header(name.as_str(), value.as_str());
        }
        for (field, param) in &self.request.field_params {
            adapter = adapter.map_field(field.as_str(), param.as_str());
        }
        for (name, value) in &self.request.static_params {
            adapter = adapter.with_static_param(name.as_str(), value.as_str());
        }
        for (category, path) in &self.request.category_paths {
            adapter = adapter.with_category_path(Category::parse(category)?, path.as_str());
        }
        if let Some(pointer) = &self.request.extract {
            adapter = adapter.with_extract(pointer.as_str());
        }

        if let Some(variable) = &self.request.api_key_env {
            match env::var(variable).ok().filter(|key| !key.trim().is_empty()) {
                Some(key) => {
                    let placement = match (&self.request.api_key_header, &self.request.api_key_param) {
                        (Some(header), _) => ApiKeyPlacement::Header {
                            name: header.clone(),
                            value: key,
                        },
                        (None, Some(param)) => ApiKeyPlacement::QueryParam {
                            name: param.clone(),
                            value: key,
                        },
                        (None, None) => ApiKeyPlacement::Header {
                            name: String::from("x-api-key"),
                            value: key,
                        },
                    };
                    adapter = adapter.with_api_key(placement);
                }
                None => {
                    warn!(provider = %id, variable = %variable, "api key not set, provider disabled");
                    config.enabled = false;
                }
            }
        }

        let mut registration = ProviderRegistration::new(id, Arc::new(adapter))
            .of_type(self.source_type)
            .with_config(config);
        if let Some(name) = self.name {
            registration = registration.named(name);
        }
        for category in &self.categories {
            registration = registration.serving(Category::parse(category)?);
        }
        for (category, priority) in &self.priority_overrides {
            registration = registration.serving_with_priority(Category::parse(category)?, *priority);
        }
        if let Some(probe) = self.probe {
            registration = registration.with_probe(probe.probe_config());
        }
        Ok(registration)
    }
}

impl ProbeSettings {
    fn probe_config(&self) -> ProbeConfig {
        let request = HttpRequest::get(self.url.as_str())
            .with_timeout(Duration::from_millis(self.timeout_ms));
        let mut probe = ProbeConfig::new(request, Duration::from_secs(self.interval_secs.max(1)))
            .expecting(self.expected_statuses.clone());
        if !self.required_fields.is_empty() {
            probe = probe.with_validator(Arc::new(JsonFieldsValidator::new(
                self.required_fields.iter().cloned(),
            )));
        }
        probe
    }
}

impl CacheSettings {
    fn validate(&self) -> Result<(), ValidationError> {
        let max_ttl_secs = MAX_CACHE_TTL.as_secs();
        if self.default_ttl_secs.is_some_and(|seconds| seconds > max_ttl_secs) {
            return Err(ValidationError::InvalidSetting {
                field: "cache.default_ttl_secs",
                reason: format!("exceeds {max_ttl_secs} seconds"),
            });
        }
        for (category, seconds) in &self.category_ttl_secs {
            Category::parse(category)?;
            if *seconds > max_ttl_secs {
                return Err(ValidationError::InvalidSetting {
                    field: "cache.category_ttl_secs",
                    reason: format!("'{category}' exceeds {max_ttl_secs} seconds"),
                });
            }
        }
        if !(1.0..=MAX_PREMIUM_TTL_MULTIPLIER).contains(&self.premium_ttl_multiplier) {
            return Err(ValidationError::InvalidSetting {
                field: "cache.premium_ttl_multiplier",
                reason: format!(
                    "{} is outside [1, {MAX_PREMIUM_TTL_MULTIPLIER}]",
                    self.premium_ttl_multiplier
                ),
            });
        }
        if !self.premium_cost_threshold.is_finite() || self.premium_cost_threshold < 0.0 {
            return Err(ValidationError::InvalidSetting {
                field: "cache.premium_cost_threshold",
                reason: format!("{} is not a finite non-negative amount", self.premium_cost_threshold),
            });
        }
        Ok(())
    }

    fn ttl_table(&self) -> Result<CacheTtlTable, ValidationError> {
        let mut table = CacheTtlTable::default()
            .with_premium(self.premium_cost_threshold, self.premium_ttl_multiplier);
        if let Some(seconds) = self.default_ttl_secs {
            table = table.with_default_ttl(Duration::from_secs(seconds));
        }
        for (category, seconds) in &self.category_ttl_secs {
            table = table.with_category(Category::parse(category)?, Duration::from_secs(*seconds));
        }
        Ok(table)
    }
}

impl BreakerSettings {
    fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            open_timeout: Duration::from_secs(self.open_timeout_secs),
            failure_window: Duration::from_secs(self.failure_window_secs),
        }
    }
}

impl BackoffSettings {
    fn backoff(&self) -> Backoff {
        Backoff::Exponential {
            base: Duration::from_millis(self.base_ms),
            factor: self.factor,
            max: Duration::from_millis(self.max_ms),
            jitter: self.jitter,
        }
    }
}

impl MonitorSettings {
    fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            degraded_consecutive_failures: self.degraded_consecutive_failures,
            unhealthy_consecutive_failures: self.unhealthy_consecutive_failures,
            degraded_error_rate: self.degraded_error_rate,
            unhealthy_error_rate: self.unhealthy_error_rate,
            window: self.window,
            min_samples: self.min_samples,
            latency_alpha: self.latency_alpha,
        }
    }
}

impl HttpSettings {
    fn pool_config(&self) -> HttpPoolConfig {
        let defaults = HttpPoolConfig::default();
        HttpPoolConfig {
            max_idle_per_host: self.max_idle_per_host,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            user_agent: self.user_agent.clone().unwrap_or(defaults.user_agent),
        }
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_source_type() -> SourceType {
    SourceType::Government
}

fn default_method() -> HttpMethod {
    HttpMethod::Get
}

fn default_priority() -> u32 {
    ProviderConfig::default().priority
}

fn default_reliability() -> f64 {
    ProviderConfig::default().reliability
}

fn default_concurrency_ceiling() -> u32 {
    ProviderConfig::default().concurrency_ceiling
}

fn default_timeout_ms() -> u64 {
    duration_to_ms(ProviderConfig::default().timeout)
}

fn default_retry_budget() -> u32 {
    ProviderConfig::default().retry_budget
}

fn default_true() -> bool {
    true
}

fn default_rate_capacity() -> u32 {
    RateLimit::default().capacity
}

fn default_rate_window_secs() -> u64 {
    RateLimit::default().window.as_secs()
}

fn default_probe_interval_secs() -> u64 {
    60
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}
