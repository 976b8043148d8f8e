use std::collections::HashMap;
use std::time::Duration;

use crate::Category;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Longest time any entry is kept, whatever the table says.
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(365 * DAY);
pub const MAX_PREMIUM_TTL_MULTIPLIER: f64 = 100.0;

/// Per-category time-to-live table.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheTtlTable {
    default_ttl: Duration,
    by_category: HashMap<Category, Duration>,
    premium_cost_threshold: f64,
    premium_ttl_multiplier: f64,
}

impl Default for CacheTtlTable {
    fn default() -> Self {
        let by_category = [
            (Category::GEOCODING, 30 * DAY),
            (Category::FLOOD_ZONE_BOUNDARY, 7 * DAY),
            (Category::FLOOD_RISK, DAY),
            (Category::EARTHQUAKE_RISK, HOUR),
            (Category::FIRE_RISK, 6 * HOUR),
            (Category::STORM_RISK, 30 * MINUTE),
            (Category::WEATHER_ALERTS, 5 * MINUTE),
        ]
        .into_iter()
        .map(|(category, seconds)| (category, Duration::from_secs(seconds)))
        .collect();

        Self {
            default_ttl: Duration::from_secs(HOUR),
            by_category,
            premium_cost_threshold: 0.05,
            premium_ttl_multiplier: 2.0,
        }
    }
}

impl CacheTtlTable {
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_category(mut self, category: Category, ttl: Duration) -> Self {
        self.by_category.insert(category, ttl);
        self
    }

    /// Providers costing at least `threshold` per call keep results `multiplier` times longer.
    /// The multiplier is clamped to `[1, MAX_PREMIUM_TTL_MULTIPLIER]`.
    pub fn with_premium(mut self, threshold: f64, multiplier: f64) -> Self {
        self.premium_cost_threshold = threshold;
        self.premium_ttl_multiplier = if multiplier.is_nan() {
            1.0
        } else {
            multiplier.clamp(1.0, MAX_PREMIUM_TTL_MULTIPLIER)
        };
        self
    }

    pub fn ttl_for(&self, category: &Category) -> Duration {
        self.by_category
            .get(category)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    /// TTL for a result produced by a provider charging `cost_per_call`,
    /// never longer than [`MAX_CACHE_TTL`].
    pub fn ttl_for_source(&self, category: &Category, cost_per_call: f64) -> Duration {
        let ttl = self.ttl_for(category).min(MAX_CACHE_TTL);
        if cost_per_call > 0.0 && cost_per_call >= self.premium_cost_threshold {
            Duration::try_from_secs_f64(ttl.as_secs_f64() * self.premium_ttl_multiplier)
                .map_or(MAX_CACHE_TTL, |premium| premium.min(MAX_CACHE_TTL))
        } else {
            ttl
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}
