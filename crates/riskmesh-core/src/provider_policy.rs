use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::data_source::ProviderAdapter;
use crate::monitor::ProbeConfig;
use crate::throttling::QuotaPolicy;
use crate::{Category, ProviderId, SourceType, ValidationError};

/// Token-bucket shape for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub capacity: u32,
    pub window: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            capacity: 60,
            window: Duration::from_secs(60),
        }
    }
}

/// Fixed per-provider settings. Only `enabled` and `priority` change at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    /// Lower values are tried first.
    pub priority: u32,
    /// Estimated success probability in `[0, 1]`; breaks priority ties.
    pub reliability: f64,
    pub cost_per_call: f64,
    pub concurrency_ceiling: u32,
    /// Per-attempt request timeout.
    pub timeout: Duration,
    /// Retries after the first attempt, transient failures only.
    pub retry_budget: u32,
    pub enabled: bool,
    pub rate_limit: RateLimit,
    pub daily_cost_ceiling: Option<f64>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            priority: 100,
            reliability: 0.9,
            cost_per_call: 0.0,
            concurrency_ceiling: 10,
            timeout: Duration::from_secs(10),
            retry_budget: 2,
            enabled: true,
            rate_limit: RateLimit::default(),
            daily_cost_ceiling: None,
        }
    }
}

impl ProviderConfig {
    pub fn validate(&self, provider: &ProviderId) -> Result<(), ValidationError> {
        let name = || provider.to_string();

        if !self.reliability.is_finite() || !(0.0..=1.0).contains(&self.reliability) {
            return Err(ValidationError::ReliabilityOutOfRange {
                provider: name(),
                value: self.reliability.to_string(),
            });
        }
        if !self.cost_per_call.is_finite() || self.cost_per_call < 0.0 {
            return Err(ValidationError::InvalidAmount {
                provider: name(),
                field: "cost_per_call",
            });
        }
        if let Some(ceiling) = self.daily_cost_ceiling {
            if !ceiling.is_finite() || ceiling < 0.0 {
                return Err(ValidationError::InvalidAmount {
                    provider: name(),
                    field: "daily_cost_ceiling",
                });
            }
        }

        let positive = [
            ("concurrency_ceiling", self.concurrency_ceiling > 0),
            ("timeout", !self.timeout.is_zero()),
            ("rate_limit.capacity", self.rate_limit.capacity > 0),
            ("rate_limit.window", !self.rate_limit.window.is_zero()),
        ];
        if let Some((field, _)) = positive.into_iter().find(|(_, ok)| !ok) {
            return Err(ValidationError::NonPositive {
                provider: name(),
                field,
            });
        }

        Ok(())
    }

    pub fn quota_policy(&self) -> QuotaPolicy {
        QuotaPolicy {
            capacity: self.rate_limit.capacity,
            window: self.rate_limit.window,
            concurrency_ceiling: self.concurrency_ceiling,
            unit_price: self.cost_per_call,
            daily_cost_ceiling: self.daily_cost_ceiling,
        }
    }
}

/// A provider as registered with the orchestrator.
///
/// ```rust,ignore
/// let usgs = ProviderRegistration::new(ProviderId::parse("USGS")?, Arc::new(adapter))
///     .named("US Geological Survey")
///     .serving_with_priority(Category::EARTHQUAKE_RISK, 1)
///     .with_config(ProviderConfig { reliability: 0.98, ..ProviderConfig::default() });
/// ```
#[derive(Clone)]
pub struct ProviderRegistration {
    pub id: ProviderId,
    pub name: String,
    pub source_type: SourceType,
    /// Served categories, each with an optional priority override.
    pub categories: BTreeMap<Category, Option<u32>>,
    pub config: ProviderConfig,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub probe: Option<ProbeConfig>,
}

impl ProviderRegistration {
    pub fn new(id: ProviderId, adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            name: id.to_string(),
            id,
            source_type: SourceType::Government,
            categories: BTreeMap::new(),
            config: ProviderConfig::default(),
            adapter,
            probe: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn of_type(mut self, source_type: SourceType) -> Self {
        self.source_type = source_type;
        self
    }

    /// Serve `category` at the provider's default priority.
    pub fn serving(mut self, category: Category) -> Self {
        self.categories.insert(category, None);
        self
    }

    pub fn serving_with_priority(mut self, category: Category, priority: u32) -> Self {
        self.categories.insert(category, Some(priority));
        self
    }

    pub fn with_config(mut self, config: ProviderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Priority within `category`, or `None` when the category is not served.
    pub fn priority_for(&self, category: &Category) -> Option<u32> {
        self.categories
            .get(category)
            .map(|priority| priority.unwrap_or(self.config.priority))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.categories.is_empty() {
            return Err(ValidationError::NoCategories {
                provider: self.id.to_string(),
            });
        }
        self.config.validate(&self.id)
    }
}

impl Debug for ProviderRegistration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistration")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("source_type", &self.source_type)
            .field("categories", &self.categories)
            .field("config", &self.config)
            .field("probe", &self.probe)
            .finish_non_exhaustive()
    }
}
