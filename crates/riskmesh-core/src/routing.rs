//! Source orchestrator: cache lookup, candidate planning, quota admission,
//! circuit breaking and sequential fallback across providers.

use std::collections::{BTreeMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheMode, CacheTtlTable, DurableStore, ResponseCache, DEFAULT_VOLATILE_CAPACITY};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use crate::data_source::{SourceError, SourceErrorKind};
use crate::events::{EventBus, OrchestratorEvent, DEFAULT_EVENT_CAPACITY};
use crate::http_client::{HttpClient, HttpPoolConfig, HttpRequest, ReqwestHttpClient};
use crate::monitor::{AvailabilityMonitor, HealthRecord, HealthThresholds, DEFAULT_PROBE_BUDGET_PER_SECOND};
use crate::provider_policy::ProviderRegistration;
use crate::retry::Backoff;
use crate::throttling::{QuotaGovernor, QuotaPermit, QuotaSnapshot, DEFAULT_QUEUE_POLL_INTERVAL};
use crate::transport::{duration_ms, Transport};
use crate::{CacheKey, Category, CoreError, ProviderId, Query, SourceType, ValidationError};

/// Per-call knobs for [`SourceOrchestrator::fetch`].
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOptions {
    pub cache_mode: CacheMode,
    /// Providers costing more per call are not considered.
    pub max_cost: Option<f64>,
    pub source_type: Option<SourceType>,
    /// Overall deadline. When it passes the in-flight call is aborted and no
    /// further candidate is tried.
    pub timeout: Option<Duration>,
    /// Wait in the provider's admission queue for up to this long instead of
    /// skipping on a quota denial.
    pub quota_wait: Option<Duration>,
    /// Admission-queue priority; higher is served first.
    pub priority: u8,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            cache_mode: CacheMode::Use,
            max_cost: None,
            source_type: None,
            timeout: None,
            quota_wait: None,
            priority: 0,
        }
    }
}

impl FetchOptions {
    /// Skip the cache read but still store the fresh payload.
    pub fn skip_cache(mut self) -> Self {
        self.cache_mode = CacheMode::Refresh;
        self
    }

    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    pub fn with_source_type(mut self, source_type: SourceType) -> Self {
        self.source_type = Some(source_type);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_quota_wait(mut self, wait: Duration, priority: u8) -> Self {
        self.quota_wait = Some(wait);
        self.priority = priority;
        self
    }
}

/// Where a payload came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceUsed {
    Cache,
    Provider(ProviderId),
}

impl SourceUsed {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Cache => "cache",
            Self::Provider(provider) => provider.as_str(),
        }
    }
}

impl Display for SourceUsed {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SourceUsed {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    CircuitOpen,
    QuotaDenied,
    InvalidRequest,
}

/// A candidate that was passed over without a network call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSource {
    pub provider: ProviderId,
    pub reason: SkipReason,
    pub detail: String,
}

/// A provider call that was made and failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderFailure {
    pub provider: ProviderId,
    pub kind: SourceErrorKind,
    pub code: &'static str,
    pub message: String,
    pub status: Option<u16>,
    pub retryable: bool,
}

impl ProviderFailure {
    fn new(provider: &ProviderId, error: &SourceError) -> Self {
        Self {
            provider: provider.clone(),
            kind: error.kind(),
            code: error.code(),
            message: error.message().to_owned(),
            status: error.status(),
            retryable: error.retryable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResult {
    pub request_id: Uuid,
    pub category: Category,
    pub payload: Value,
    pub source_used: SourceUsed,
    /// Providers actually called, in order.
    pub attempted_sources: Vec<ProviderId>,
    pub skipped: Vec<SkippedSource>,
    pub warnings: Vec<String>,
    /// Failures of providers called before the one that answered.
    pub errors: Vec<ProviderFailure>,
    pub latency_ms: u64,
}

impl FetchResult {
    pub fn cache_hit(&self) -> bool {
        self.source_used == SourceUsed::Cache
    }
}

/// Terminal failure of [`SourceOrchestrator::fetch`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error(
    "all sources exhausted for '{category}' ({} attempted, {} skipped)",
    .attempted_sources.len(),
    .skipped.len()
)]
pub struct AllSourcesExhausted {
    pub request_id: Uuid,
    pub category: Category,
    pub attempted_sources: Vec<ProviderId>,
    pub skipped: Vec<SkippedSource>,
    pub errors: Vec<ProviderFailure>,
    /// Cause of the final failure, if any provider was called.
    pub last_error: Option<ProviderFailure>,
    pub latency_ms: u64,
}

impl AllSourcesExhausted {
    pub const fn code(&self) -> &'static str {
        "source.exhausted"
    }
}

/// Status of one provider, for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatus {
    pub provider: ProviderId,
    pub name: String,
    pub source_type: SourceType,
    pub enabled: bool,
    /// Effective priority per served category.
    pub categories: BTreeMap<Category, u32>,
    pub reliability: f64,
    pub cost_per_call: f64,
    pub circuit: CircuitSnapshot,
    pub quota: Option<QuotaSnapshot>,
    pub health: Option<HealthRecord>,
}

#[derive(Debug)]
struct SlotRouting {
    enabled: bool,
    priorities: BTreeMap<Category, u32>,
}

struct ProviderSlot {
    registration: ProviderRegistration,
    breaker: CircuitBreaker,
    routing: Mutex<SlotRouting>,
}

impl ProviderSlot {
    fn id(&self) -> &ProviderId {
        &self.registration.id
    }

    fn routing(&self) -> MutexGuard<'_, SlotRouting> {
        self.routing.lock().unwrap_or_else(|poisoned| {
            warn!(provider = %self.id(), "provider routing mutex was poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }
}

struct Candidate {
    slot: Arc<ProviderSlot>,
    priority: u32,
}

/// Builder for [`SourceOrchestrator`].
///
/// ```rust,ignore
/// let orchestrator = OrchestratorBuilder::new()
///     .register(usgs)
///     .register(fema)
///     .durable_store(Arc::new(DuckDbCacheStore::open_default()?))
///     .build()?;
/// ```
pub struct OrchestratorBuilder {
    registrations: Vec<ProviderRegistration>,
    http_client: Option<Arc<dyn HttpClient>>,
    http_pool: HttpPoolConfig,
    backoff: Backoff,
    breaker_config: CircuitBreakerConfig,
    cache_ttl: CacheTtlTable,
    volatile_capacity: usize,
    durable: Option<Arc<dyn DurableStore>>,
    event_capacity: usize,
    monitor_thresholds: HealthThresholds,
    probe_budget: u32,
    queue_poll_interval: Duration,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            http_client: None,
            http_pool: HttpPoolConfig::default(),
            backoff: Backoff::default(),
            breaker_config: CircuitBreakerConfig::default(),
            cache_ttl: CacheTtlTable::default(),
            volatile_capacity: DEFAULT_VOLATILE_CAPACITY,
            durable: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            monitor_thresholds: HealthThresholds::default(),
            probe_budget: DEFAULT_PROBE_BUDGET_PER_SECOND,
            queue_poll_interval: DEFAULT_QUEUE_POLL_INTERVAL,
        }
    }

    pub fn register(mut self, registration: ProviderRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    /// Use this client instead of a pooled reqwest client.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn http_pool(mut self, pool: HttpPoolConfig) -> Self {
        self.http_pool = pool;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn cache_ttl(mut self, ttl: CacheTtlTable) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn volatile_capacity(mut self, capacity: usize) -> Self {
        self.volatile_capacity = capacity;
        self
    }

    pub fn durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn monitor_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.monitor_thresholds = thresholds;
        self
    }

    /// Global probe rate across all providers, per second.
    pub fn probe_budget(mut self, per_second: u32) -> Self {
        self.probe_budget = per_second;
        self
    }

    pub fn queue_poll_interval(mut self, interval: Duration) -> Self {
        self.queue_poll_interval = interval;
        self
    }

    pub fn build(self) -> Result<SourceOrchestrator, CoreError> {
        let mut seen = HashSet::new();
        for registration in &self.registrations {
            registration.validate()?;
            if !seen.insert(registration.id.clone()) {
                return Err(ValidationError::DuplicateProvider {
                    provider: registration.id.to_string(),
                }
                .into());
            }
        }

        let client: Arc<dyn HttpClient> = match self.http_client {
            Some(client) => client,
            None => Arc::new(
                ReqwestHttpClient::from_config(&self.http_pool)
                    .map_err(|error| CoreError::HttpSetup(error.to_string()))?,
            ),
        };

        let events = EventBus::new(self.event_capacity);
        let transport = Transport::new(client, self.backoff, events.clone());

        let mut cache =
            ResponseCache::new(self.cache_ttl, self.volatile_capacity).with_events(events.clone());
        if let Some(durable) = self.durable {
            cache = cache.with_durable(durable);
        }

        let quota = QuotaGovernor::new(self.queue_poll_interval, events.clone());
        let monitor = AvailabilityMonitor::new(
            transport.clone(),
            self.monitor_thresholds,
            self.probe_budget,
            events.clone(),
        );

        let mut providers = BTreeMap::new();
        for registration in self.registrations {
            let id = registration.id.clone();
            let enabled = registration.config.enabled;

            quota.register(id.clone(), registration.config.quota_policy());
            monitor.register(id.clone(), enabled);
            if let Some(probe) = &registration.probe {
                monitor.configure(&id, probe.clone());
            }

            let priorities = registration
                .categories
                .keys()
                .filter_map(|category| {
                    registration
                        .priority_for(category)
                        .map(|priority| (category.clone(), priority))
                })
                .collect();
            let slot = ProviderSlot {
                breaker: CircuitBreaker::new(self.breaker_config).observed(id.clone(), events.clone()),
                routing: Mutex::new(SlotRouting { enabled, priorities }),
                registration,
            };
            providers.insert(id, Arc::new(slot));
        }

        info!(providers = providers.len(), durable = cache.has_durable_tier(), "orchestrator built");

        Ok(SourceOrchestrator {
            providers,
            transport,
            cache,
            quota,
            monitor,
            events,
            shutdown: Mutex::new(CancellationToken::new()),
        })
    }
}

/// Owns every provider, the cache, the quota governor and the monitor.
/// Share it behind an `Arc`; all operations take `&self`.
pub struct SourceOrchestrator {
    providers: BTreeMap<ProviderId, Arc<ProviderSlot>>,
    transport: Transport,
    cache: ResponseCache,
    quota: QuotaGovernor,
    monitor: AvailabilityMonitor,
    events: EventBus,
    shutdown: Mutex<CancellationToken>,
}

impl SourceOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Start background probing. Must be called from within a Tokio runtime.
    pub fn start(&self) {
        {
            let mut shutdown = self.lock_shutdown();
            if shutdown.is_cancelled() {
                *shutdown = CancellationToken::new();
            }
        }
        self.monitor.start();
    }

    /// Stop probing and cancel every queued quota wait.
    pub async fn stop(&self) {
        self.lock_shutdown().cancel();
        self.monitor.stop().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn monitor(&self) -> &AvailabilityMonitor {
        &self.monitor
    }

    pub fn quota(&self) -> &QuotaGovernor {
        &self.quota
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub async fn fetch(
        &self,
        category: &Category,
        query: &Query,
        options: &FetchOptions,
    ) -> Result<FetchResult, AllSourcesExhausted> {
        let started = Instant::now();
        let deadline = options.timeout.and_then(|timeout| started.checked_add(timeout));
        let request_id = Uuid::new_v4();
        let key = CacheKey::new(category, query);

        if options.cache_mode.reads() {
            if let Some(payload) = self.cache.get(key.as_str()).await {
                let latency_ms = duration_ms(started.elapsed());
                debug!(%request_id, category = %category, "served from cache");
                self.events.publish(OrchestratorEvent::FetchCompleted {
                    request_id,
                    category: category.clone(),
                    source: String::from("cache"),
                    latency_ms,
                });
                return Ok(FetchResult {
                    request_id,
                    category: category.clone(),
                    payload,
                    source_used: SourceUsed::Cache,
                    attempted_sources: Vec::new(),
                    skipped: Vec::new(),
                    warnings: Vec::new(),
                    errors: Vec::new(),
                    latency_ms,
                });
            }
        }

        let (candidates, mut skipped) = self.plan(category, options);
        debug!(
            %request_id,
            category = %category,
            candidates = candidates.len(),
            skipped = skipped.len(),
            "planned candidates"
        );

        let mut attempted_sources = Vec::new();
        let mut errors: Vec<ProviderFailure> = Vec::new();

        for candidate in candidates {
            let slot = candidate.slot;
            let provider = slot.id();

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                let error = SourceError::deadline_exceeded("fetch deadline passed before the call");
                errors.push(ProviderFailure::new(provider, &error));
                break;
            }

            let request = match slot.registration.adapter.build_request(category, query) {
                Ok(request) => request.with_timeout(slot.registration.config.timeout),
                Err(error) => {
                    debug!(provider = %provider, error = %error, "adapter rejected query");
                    skipped.push(SkippedSource {
                        provider: provider.clone(),
                        reason: SkipReason::InvalidRequest,
                        detail: error.message().to_owned(),
                    });
                    continue;
                }
            };

            let Some(call) = slot.breaker.try_acquire() else {
                skipped.push(SkippedSource {
                    provider: provider.clone(),
                    reason: SkipReason::CircuitOpen,
                    detail: String::from("circuit rejected the call"),
                });
                continue;
            };

            let permit = match self.reserve(provider, options, deadline).await {
                Ok(permit) => permit,
                Err(detail) => {
                    debug!(provider = %provider, detail = %detail, "quota denied, skipping");
                    skipped.push(SkippedSource {
                        provider: provider.clone(),
                        reason: SkipReason::QuotaDenied,
                        detail,
                    });
                    continue;
                }
            };

            attempted_sources.push(provider.clone());
            let outcome = self.invoke(&slot, category, request, deadline).await;
            permit.release();

            match outcome {
                Ok(payload) => {
                    call.success();

                    if options.cache_mode.writes() {
                        let ttl = self
                            .cache
                            .ttl_table()
                            .ttl_for_source(category, slot.registration.config.cost_per_call);
                        self.cache.set(key.as_str(), &payload, Some(ttl)).await;
                    }

                    let mut warnings = Vec::new();
                    if !errors.is_empty() {
                        warnings.push(format!(
                            "source fallback succeeded with '{provider}' after {} failed attempt(s)",
                            errors.len()
                        ));
                        info!(%request_id, provider = %provider, failed = errors.len(), "fallback succeeded");
                    }

                    let latency_ms = duration_ms(started.elapsed());
                    self.events.publish(OrchestratorEvent::FetchCompleted {
                        request_id,
                        category: category.clone(),
                        source: provider.to_string(),
                        latency_ms,
                    });

                    return Ok(FetchResult {
                        request_id,
                        category: category.clone(),
                        payload,
                        source_used: SourceUsed::Provider(provider.clone()),
                        attempted_sources,
                        skipped,
                        warnings,
                        errors,
                        latency_ms,
                    });
                }
                Err(error) => {
                    let deadline_hit = error.kind() == SourceErrorKind::DeadlineExceeded;
                    if error.counts_toward_breaker() {
                        call.failure();
                    } else {
                        drop(call);
                    }

                    warn!(%request_id, provider = %provider, error = %error, "provider call failed");
                    self.events.publish(OrchestratorEvent::SourceFailed {
                        request_id,
                        provider: provider.clone(),
                        code: error.code(),
                        message: error.message().to_owned(),
                    });
                    errors.push(ProviderFailure::new(provider, &error));

                    if deadline_hit {
                        break;
                    }
                }
            }
        }

        warn!(
            %request_id,
            category = %category,
            attempted = attempted_sources.len(),
            skipped = skipped.len(),
            "all sources exhausted"
        );
        self.events.publish(OrchestratorEvent::FetchExhausted {
            request_id,
            category: category.clone(),
            attempted: attempted_sources.clone(),
        });

        Err(AllSourcesExhausted {
            request_id,
            category: category.clone(),
            attempted_sources,
            skipped,
            last_error: errors.last().cloned(),
            errors,
            latency_ms: duration_ms(started.elapsed()),
        })
    }

    /// Providers that `fetch` would try for `category`, in order.
    pub fn candidates(&self, category: &Category, options: &FetchOptions) -> Vec<ProviderId> {
        self.plan(category, options)
            .0
            .into_iter()
            .map(|candidate| candidate.slot.id().clone())
            .collect()
    }

    pub fn get_source_status(&self, provider: &ProviderId) -> Option<SourceStatus> {
        let slot = self.providers.get(provider)?;
        let (enabled, categories) = {
            let routing = slot.routing();
            (routing.enabled, routing.priorities.clone())
        };
        let registration = &slot.registration;

        Some(SourceStatus {
            provider: provider.clone(),
            name: registration.name.clone(),
            source_type: registration.source_type,
            enabled,
            categories,
            reliability: registration.config.reliability,
            cost_per_call: registration.config.cost_per_call,
            circuit: slot.breaker.snapshot(),
            quota: self.quota.snapshot(provider),
            health: self.monitor.record(provider),
        })
    }

    /// Status of every provider, sorted by id.
    pub fn get_all_source_status(&self) -> Vec<SourceStatus> {
        self.providers
            .keys()
            .filter_map(|provider| self.get_source_status(provider))
            .collect()
    }

    /// Enable or disable a provider for routing and probing.
    pub fn set_source_enabled(&self, provider: &ProviderId, enabled: bool) -> Result<(), ValidationError> {
        let slot = self.slot(provider)?;
        slot.routing().enabled = enabled;
        if enabled {
            self.monitor.enable(provider);
        } else {
            self.monitor.disable(provider);
        }
        info!(provider = %provider, enabled, "provider availability changed");
        Ok(())
    }

    /// Force a provider's circuit closed. Returns `false` when it already was.
    pub fn reset_circuit_breaker(&self, provider: &ProviderId) -> Result<bool, ValidationError> {
        Ok(self.slot(provider)?.breaker.reset())
    }

    pub fn update_priority(
        &self,
        provider: &ProviderId,
        category: &Category,
        priority: u32,
    ) -> Result<(), ValidationError> {
        let slot = self.slot(provider)?;
        let mut routing = slot.routing();
        let Some(current) = routing.priorities.get_mut(category) else {
            return Err(ValidationError::CategoryNotServed {
                provider: provider.to_string(),
                category: category.to_string(),
            });
        };
        *current = priority;
        info!(provider = %provider, category = %category, priority, "provider priority updated");
        Ok(())
    }

    pub async fn invalidate_category(&self, category: &Category) -> usize {
        self.cache.invalidate_category(category).await
    }

    fn slot(&self, provider: &ProviderId) -> Result<&Arc<ProviderSlot>, ValidationError> {
        self.providers
            .get(provider)
            .ok_or_else(|| ValidationError::UnknownProvider {
                provider: provider.to_string(),
            })
    }

    fn plan(&self, category: &Category, options: &FetchOptions) -> (Vec<Candidate>, Vec<SkippedSource>) {
        let mut ranked = self
            .providers
            .values()
            .filter_map(|slot| {
                let priority = {
                    let routing = slot.routing();
                    if !routing.enabled {
                        return None;
                    }
                    *routing.priorities.get(category)?
                };
                let registration = &slot.registration;
                if options
                    .max_cost
                    .is_some_and(|max_cost| registration.config.cost_per_call > max_cost)
                {
                    return None;
                }
                if options
                    .source_type
                    .is_some_and(|source_type| registration.source_type != source_type)
                {
                    return None;
                }
                Some(Candidate {
                    slot: Arc::clone(slot),
                    priority,
                })
            })
            .collect::<Vec<_>>();

        ranked.sort_by(|left, right| {
            let (l, r) = (&left.slot.registration.config, &right.slot.registration.config);
            left.priority
                .cmp(&right.priority)
                .then_with(|| r.reliability.total_cmp(&l.reliability))
                .then_with(|| l.cost_per_call.total_cmp(&r.cost_per_call))
                .then_with(|| left.slot.id().cmp(right.slot.id()))
        });

        let mut skipped = Vec::new();
        let candidates = ranked
            .into_iter()
            .filter(|candidate| {
                if candidate.slot.breaker.is_accepting() {
                    return true;
                }
                let retry_in = candidate
                    .slot
                    .breaker
                    .snapshot()
                    .retry_in_ms
                    .map_or_else(|| String::from("circuit is open"), |ms| format!("circuit is open, retry in {ms} ms"));
                skipped.push(SkippedSource {
                    provider: candidate.slot.id().clone(),
                    reason: SkipReason::CircuitOpen,
                    detail: retry_in,
                });
                false
            })
            .collect();

        (candidates, skipped)
    }

    async fn reserve(
        &self,
        provider: &ProviderId,
        options: &FetchOptions,
        deadline: Option<Instant>,
    ) -> Result<QuotaPermit, String> {
        let Some(wait) = options.quota_wait else {
            return self
                .quota
                .check_and_reserve(provider, 1)
                .map_err(|denied| denied.to_string());
        };

        let until = match (deadline, Instant::now().checked_add(wait)) {
            (Some(deadline), Some(limit)) => Some(deadline.min(limit)),
            (deadline, limit) => deadline.or(limit),
        };
        let cancel = self.lock_shutdown().child_token();
        let acquire = self.quota.acquire_queued(provider, 1, options.priority, &cancel);
        let admitted = match until {
            Some(until) => tokio::time::timeout_at(until, acquire)
                .await
                .map_err(|_| format!("no quota for '{provider}' within {wait:?}"))?,
            None => acquire.await,
        };
        admitted.map_err(|error| error.to_string())
    }

    async fn invoke(
        &self,
        slot: &ProviderSlot,
        category: &Category,
        request: HttpRequest,
        deadline: Option<Instant>,
    ) -> Result<Value, SourceError> {
        let registration = &slot.registration;
        let call = async {
            let response = self
                .transport
                .send(slot.id(), request, registration.config.retry_budget)
                .await?;
            registration.adapter.parse_response(category, response)
        };

        match deadline {
            None => call.await,
            Some(deadline) => tokio::time::timeout_at(deadline, call)
                .await
                .unwrap_or_else(|_| Err(SourceError::deadline_exceeded("fetch deadline passed during the call"))),
        }
    }

    fn lock_shutdown(&self) -> MutexGuard<'_, CancellationToken> {
        self.shutdown.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
