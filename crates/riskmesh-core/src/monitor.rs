//! Availability monitor: periodic synthetic probes per provider.
//!
//! Each configured provider gets its own probe task on its own cadence. A probe
//! sends a lightweight request through the shared [`Transport`] without
//! retries, validates it and folds the outcome into the provider's
//! [`HealthRecord`]. Probe traffic is paced by a monitor-wide rate limiter and
//! never touches the quota governor. Health is tracked independently of the
//! circuit breakers.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventBus, OrchestratorEvent};
use crate::http_client::{HttpRequest, HttpResponse};
use crate::transport::Transport;
use crate::ProviderId;

pub const DEFAULT_PROBE_BUDGET_PER_SECOND: u32 = 10;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Probe lifecycle of one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    /// No probe configured.
    Unconfigured,
    /// Probe configured; the monitor is not running.
    Idle,
    /// Probe task running.
    Scheduled,
    /// Provider disabled; probes suspended.
    Disabled,
}

/// Thresholds turning probe history into a [`HealthState`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub degraded_consecutive_failures: u32,
    pub unhealthy_consecutive_failures: u32,
    pub degraded_error_rate: f64,
    pub unhealthy_error_rate: f64,
    /// Number of most recent probes in the rolling error rate.
    pub window: usize,
    /// Error-rate thresholds apply only once this many probes are in the window.
    pub min_samples: usize,
    /// Smoothing factor for the latency moving average.
    pub latency_alpha: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_consecutive_failures: 2,
            unhealthy_consecutive_failures: 5,
            degraded_error_rate: 0.2,
            unhealthy_error_rate: 0.5,
            window: 20,
            min_samples: 5,
            latency_alpha: 0.3,
        }
    }
}

/// Structural check applied to a probe response.
pub trait ResponseValidator: Send + Sync {
    fn validate(&self, response: &HttpResponse) -> Result<(), String>;
}

impl<F> ResponseValidator for F
where
    F: Fn(&HttpResponse) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, response: &HttpResponse) -> Result<(), String> {
        self(response)
    }
}

/// Requires the body to be JSON with a non-null value at each JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonFieldsValidator {
    pointers: Vec<String>,
}

impl JsonFieldsValidator {
    pub fn new<I, S>(pointers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pointers: pointers.into_iter().map(Into::into).collect(),
        }
    }
}

impl ResponseValidator for JsonFieldsValidator {
    fn validate(&self, response: &HttpResponse) -> Result<(), String> {
        let body: Value = response
            .json()
            .map_err(|error| format!("probe body is not JSON: {error}"))?;

        for pointer in &self.pointers {
            match body.pointer(pointer) {
                Some(value) if !value.is_null() => {}
                _ => return Err(format!("probe body is missing '{pointer}'")),
            }
        }
        Ok(())
    }
}

/// Synthetic health probe for one provider.
#[derive(Clone)]
pub struct ProbeConfig {
    pub request: HttpRequest,
    pub interval: Duration,
    /// Statuses counted as up; empty means any 2xx.
    pub expected_statuses: Vec<u16>,
    pub validator: Option<Arc<dyn ResponseValidator>>,
}

impl ProbeConfig {
    pub fn new(request: HttpRequest, interval: Duration) -> Self {
        Self {
            request,
            interval,
            expected_statuses: Vec::new(),
            validator: None,
        }
    }

    pub fn expecting(mut self, statuses: impl Into<Vec<u16>>) -> Self {
        self.expected_statuses = statuses.into();
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn ResponseValidator>) -> Self {
        self.validator = Some(validator);
        self
    }
}

impl std::fmt::Debug for ProbeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeConfig")
            .field("request", &self.request)
            .field("interval", &self.interval)
            .field("expected_statuses", &self.expected_statuses)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

/// Rolling health metrics for one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub provider: ProviderId,
    pub status: HealthState,
    pub schedule: ScheduleState,
    pub total_checks: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    /// Failure share over the rolling window.
    pub error_rate: f64,
    pub avg_latency_ms: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_failure_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub alert_active: bool,
    #[serde(skip)]
    recent: VecDeque<bool>,
}

impl HealthRecord {
    fn new(provider: ProviderId) -> Self {
        Self {
            provider,
            status: HealthState::Unknown,
            schedule: ScheduleState::Unconfigured,
            total_checks: 0,
            total_successes: 0,
            total_failures: 0,
            consecutive_failures: 0,
            error_rate: 0.0,
            avg_latency_ms: None,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
            alert_active: false,
            recent: VecDeque::new(),
        }
    }

    fn observe(&mut self, outcome: &Result<(), String>, latency: Duration, thresholds: &HealthThresholds) {
        let now = OffsetDateTime::now_utc();
        self.total_checks = self.total_checks.saturating_add(1);

        match outcome {
            Ok(()) => {
                self.total_successes = self.total_successes.saturating_add(1);
                self.consecutive_failures = 0;
                self.last_success_at = Some(now);
                let sample = latency.as_secs_f64() * 1000.0;
                let alpha = thresholds.latency_alpha.clamp(0.0, 1.0);
                self.avg_latency_ms = Some(match self.avg_latency_ms {
                    Some(average) => alpha * sample + (1.0 - alpha) * average,
                    None => sample,
                });
            }
            Err(message) => {
                self.total_failures = self.total_failures.saturating_add(1);
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_failure_at = Some(now);
                self.last_error = Some(message.clone());
            }
        }

        self.recent.push_back(outcome.is_ok());
        while self.recent.len() > thresholds.window.max(1) {
            self.recent.pop_front();
        }
        let failures = self.recent.iter().filter(|ok| !**ok).count();
        self.error_rate = failures as f64 / self.recent.len() as f64;
    }

    fn classify(&self, thresholds: &HealthThresholds) -> HealthState {
        let rated = self.recent.len() >= thresholds.min_samples;

        if self.consecutive_failures >= thresholds.unhealthy_consecutive_failures
            || (rated && self.error_rate >= thresholds.unhealthy_error_rate)
        {
            HealthState::Unhealthy
        } else if self.consecutive_failures >= thresholds.degraded_consecutive_failures
            || (rated && self.error_rate >= thresholds.degraded_error_rate)
        {
            HealthState::Degraded
        } else if self.total_checks == 0 {
            HealthState::Unknown
        } else {
            HealthState::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("provider '{provider}' is not monitored")]
    UnknownProvider { provider: ProviderId },
    #[error("provider '{provider}' has no probe configured")]
    NotConfigured { provider: ProviderId },
}

struct ProbeTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct MonitoredProvider {
    probe: Option<ProbeConfig>,
    record: HealthRecord,
    enabled: bool,
    task: Option<ProbeTask>,
}

impl MonitoredProvider {
    fn schedule(&self, running: bool) -> ScheduleState {
        match (&self.probe, self.enabled, &self.task) {
            (None, _, _) => ScheduleState::Unconfigured,
            (Some(_), false, _) => ScheduleState::Disabled,
            (Some(_), true, Some(_)) if running => ScheduleState::Scheduled,
            (Some(_), true, _) => ScheduleState::Idle,
        }
    }

    fn snapshot(&self, running: bool) -> HealthRecord {
        let mut record = self.record.clone();
        record.schedule = self.schedule(running);
        record
    }
}

struct MonitorInner {
    transport: Transport,
    thresholds: HealthThresholds,
    events: EventBus,
    probe_limiter: DirectRateLimiter,
    providers: Mutex<HashMap<ProviderId, MonitoredProvider>>,
    running: AtomicBool,
}

/// Probe scheduler and health bookkeeping. Cheap to clone.
#[derive(Clone)]
pub struct AvailabilityMonitor {
    inner: Arc<MonitorInner>,
}

impl AvailabilityMonitor {
    pub fn new(
        transport: Transport,
        thresholds: HealthThresholds,
        probe_budget_per_second: u32,
        events: EventBus,
    ) -> Self {
        let per_second = NonZeroU32::new(probe_budget_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            inner: Arc::new(MonitorInner {
                transport,
                thresholds,
                events,
                probe_limiter: RateLimiter::direct(Quota::per_second(per_second)),
                providers: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Track a provider. Records exist for every registered provider, probed or not.
    pub fn register(&self, provider: ProviderId, enabled: bool) {
        let mut providers = self.inner.lock();
        providers
            .entry(provider.clone())
            .or_insert_with(|| MonitoredProvider {
                probe: None,
                record: HealthRecord::new(provider),
                enabled,
                task: None,
            });
    }

    /// Set or replace a provider's probe. A running monitor reschedules it at once.
    pub fn configure(&self, provider: &ProviderId, probe: ProbeConfig) {
        self.register(provider.clone(), true);
        let running = self.is_running();
        let mut providers = self.inner.lock();
        if let Some(entry) = providers.get_mut(provider) {
            entry.probe = Some(probe);
            cancel_task(entry);
            if running && entry.enabled {
                entry.task = Some(self.spawn_probe_task(provider));
            }
        }
    }

    /// Start probing every configured, enabled provider. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut providers = self.inner.lock();
        let mut started = 0_usize;
        for (provider, entry) in providers.iter_mut() {
            if entry.probe.is_some() && entry.enabled && entry.task.is_none() {
                entry.task = Some(self.spawn_probe_task(provider));
                started += 1;
            }
        }
        info!(providers = started, "availability monitor started");
    }

    /// Cancel every probe task and wait for all of them to exit.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);

        let tasks = {
            let mut providers = self.inner.lock();
            providers
                .values_mut()
                .filter_map(|entry| entry.task.take())
                .collect::<Vec<_>>()
        };
        for task in &tasks {
            task.cancel.cancel();
        }
        for task in tasks {
            if let Err(error) = task.handle.await {
                if !error.is_cancelled() {
                    warn!(error = %error, "probe task ended abnormally");
                }
            }
        }
        info!("availability monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Resume probing a provider. Returns `false` for unknown providers.
    pub fn enable(&self, provider: &ProviderId) -> bool {
        let running = self.is_running();
        let mut providers = self.inner.lock();
        let Some(entry) = providers.get_mut(provider) else {
            return false;
        };

        entry.enabled = true;
        if running && entry.probe.is_some() && entry.task.is_none() {
            entry.task = Some(self.spawn_probe_task(provider));
        }
        true
    }

    /// Suspend probing a provider; its task is cancelled immediately.
    pub fn disable(&self, provider: &ProviderId) -> bool {
        let mut providers = self.inner.lock();
        let Some(entry) = providers.get_mut(provider) else {
            return false;
        };

        entry.enabled = false;
        cancel_task(entry);
        debug!(provider = %provider, "probe schedule cancelled");
        true
    }

    /// Run one probe right away, outside the schedule.
    pub async fn probe_now(&self, provider: &ProviderId) -> Result<HealthRecord, MonitorError> {
        self.inner.probe_once(provider).await
    }

    pub fn record(&self, provider: &ProviderId) -> Option<HealthRecord> {
        let running = self.is_running();
        self.inner
            .lock()
            .get(provider)
            .map(|entry| entry.snapshot(running))
    }

    /// Every record, sorted by provider id.
    pub fn records(&self) -> Vec<HealthRecord> {
        let running = self.is_running();
        let mut records = self
            .inner
            .lock()
            .values()
            .map(|entry| entry.snapshot(running))
            .collect::<Vec<_>>();
        records.sort_by(|left, right| left.provider.cmp(&right.provider));
        records
    }

    fn spawn_probe_task(&self, provider: &ProviderId) -> ProbeTask {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_probe_loop(
            Arc::clone(&self.inner),
            provider.clone(),
            cancel.clone(),
        ));
        ProbeTask { cancel, handle }
    }
}

fn cancel_task(entry: &mut MonitoredProvider) {
    if let Some(task) = entry.task.take() {
        task.cancel.cancel();
        task.handle.abort();
    }
}

async fn run_probe_loop(inner: Arc<MonitorInner>, provider: ProviderId, cancel: CancellationToken) {
    let Some(interval) = inner.probe_interval(&provider) else {
        return;
    };
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    outcome = inner.probe_once(&provider) => {
                        if let Err(error) = outcome {
                            debug!(provider = %provider, error = %error, "probe skipped");
                        }
                    }
                }
            }
        }
    }
    debug!(provider = %provider, "probe loop exited");
}

impl MonitorInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<ProviderId, MonitoredProvider>> {
        self.providers.lock().unwrap_or_else(|poisoned| {
            warn!("monitor mutex was poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn probe_interval(&self, provider: &ProviderId) -> Option<Duration> {
        self.lock()
            .get(provider)
            .and_then(|entry| entry.probe.as_ref())
            .map(|probe| probe.interval)
    }

    async fn probe_once(&self, provider: &ProviderId) -> Result<HealthRecord, MonitorError> {
        let probe = {
            let providers = self.lock();
            let entry = providers
                .get(provider)
                .ok_or_else(|| MonitorError::UnknownProvider {
                    provider: provider.clone(),
                })?;
            entry
                .probe
                .clone()
                .ok_or_else(|| MonitorError::NotConfigured {
                    provider: provider.clone(),
                })?
        };

        self.probe_limiter.until_ready().await;

        let started = Instant::now();
        let outcome = self
            .transport
            .send_expecting(provider, probe.request.clone(), 0, &probe.expected_statuses)
            .await;
        let latency = started.elapsed();

        let verdict = match outcome {
            Ok(response) => match &probe.validator {
                Some(validator) => validator.validate(&response),
                None => Ok(()),
            },
            Err(error) => Err(error.to_string()),
        };

        self.apply(provider, verdict, latency)
    }

    fn apply(
        &self,
        provider: &ProviderId,
        verdict: Result<(), String>,
        latency: Duration,
    ) -> Result<HealthRecord, MonitorError> {
        let running = self.running.load(Ordering::SeqCst);
        let mut events = Vec::new();

        let record = {
            let mut providers = self.lock();
            let entry = providers
                .get_mut(provider)
                .ok_or_else(|| MonitorError::UnknownProvider {
                    provider: provider.clone(),
                })?;
            let record = &mut entry.record;
            let previous = record.status;

            record.observe(&verdict, latency, &self.thresholds);
            record.status = record.classify(&self.thresholds);

            if record.status != previous {
                events.push(OrchestratorEvent::HealthStatusChanged {
                    provider: provider.clone(),
                    from: previous,
                    to: record.status,
                });
            }
            if record.status == HealthState::Unhealthy && !record.alert_active {
                record.alert_active = true;
                events.push(OrchestratorEvent::AlertRaised {
                    provider: provider.clone(),
                    consecutive_failures: record.consecutive_failures,
                    error_rate: record.error_rate,
                });
            } else if record.status == HealthState::Healthy && record.alert_active {
                record.alert_active = false;
                events.push(OrchestratorEvent::AlertCleared {
                    provider: provider.clone(),
                });
            }

            entry.snapshot(running)
        };

        for event in events {
            match &event {
                OrchestratorEvent::AlertRaised { .. } => {
                    warn!(provider = %provider, error = ?record.last_error, "provider alert raised");
                }
                OrchestratorEvent::AlertCleared { .. } => {
                    info!(provider = %provider, "provider alert cleared");
                }
                OrchestratorEvent::HealthStatusChanged { from, to, .. } => {
                    info!(provider = %provider, from = from.as_str(), to = to.as_str(), "provider health changed");
                }
                _ => {}
            }
            self.events.publish(event);
        }

        Ok(record)
    }
}
