//! Quota governor: per-provider token buckets, concurrency ceilings and daily
//! cost budgets, plus a priority admission queue.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use time::{Date, OffsetDateTime, Time};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{EventBus, OrchestratorEvent};
use crate::transport::duration_ms;
use crate::ProviderId;

pub const DEFAULT_QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Admission limits for one provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaPolicy {
    /// Tokens available in a full bucket.
    pub capacity: u32,
    /// Time to refill an empty bucket.
    pub window: Duration,
    pub concurrency_ceiling: u32,
    /// Monetary cost of one token.
    pub unit_price: f64,
    pub daily_cost_ceiling: Option<f64>,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            capacity: 60,
            window: Duration::from_secs(60),
            concurrency_ceiling: 10,
            unit_price: 0.0,
            daily_cost_ceiling: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    RateLimited,
    ConcurrencyLimited,
    CostLimited,
    UnknownProvider,
}

impl DenialReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::ConcurrencyLimited => "concurrency_limited",
            Self::CostLimited => "cost_limited",
            Self::UnknownProvider => "unknown_provider",
        }
    }
}

impl Display for DenialReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reservation was refused. Not a provider fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("quota denied for '{provider}': {reason} (retry after {retry_after:?})")]
pub struct QuotaDenied {
    pub provider: ProviderId,
    pub reason: DenialReason,
    pub retry_after: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queued reservation for '{provider}' was cancelled")]
    Cancelled { provider: ProviderId },
    #[error(transparent)]
    Denied(#[from] QuotaDenied),
}

/// Bucket state reported by [`QuotaGovernor::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuotaSnapshot {
    pub tokens: f64,
    pub capacity: u32,
    pub active_requests: u32,
    pub concurrency_ceiling: u32,
    pub today_cost: f64,
    pub daily_cost_ceiling: Option<f64>,
    pub queued: usize,
}

#[derive(Debug)]
struct TokenBucket {
    policy: QuotaPolicy,
    tokens: f64,
    last_refill: Instant,
    active_requests: u32,
    today_cost: f64,
    cost_day: Date,
}

impl TokenBucket {
    fn new(policy: QuotaPolicy) -> Self {
        Self {
            policy,
            tokens: f64::from(policy.capacity),
            last_refill: Instant::now(),
            active_requests: 0,
            today_cost: 0.0,
            cost_day: OffsetDateTime::now_utc().date(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let window = self.policy.window.as_secs_f64().max(f64::EPSILON);
        let capacity = f64::from(self.policy.capacity);

        self.tokens = (self.tokens + elapsed * capacity / window).min(capacity);
        self.last_refill = now;
    }

    fn roll_cost_day(&mut self, now: OffsetDateTime) {
        let today = now.date();
        if today != self.cost_day {
            self.cost_day = today;
            self.today_cost = 0.0;
        }
    }

    fn try_reserve(&mut self, cost: u32, poll_interval: Duration) -> Result<(), (DenialReason, Duration)> {
        self.refill();
        let now = OffsetDateTime::now_utc();
        self.roll_cost_day(now);

        if self.active_requests >= self.policy.concurrency_ceiling {
            return Err((DenialReason::ConcurrencyLimited, poll_interval));
        }

        let needed = f64::from(cost);
        if self.tokens < needed {
            let capacity = f64::from(self.policy.capacity.max(1));
            let missing = needed - self.tokens;
            let wait = missing * self.policy.window.as_secs_f64() / capacity;
            let retry_after = Duration::try_from_secs_f64(wait.max(0.0)).unwrap_or(Duration::MAX);
            return Err((DenialReason::RateLimited, retry_after));
        }

        let spend = needed * self.policy.unit_price;
        if let Some(ceiling) = self.policy.daily_cost_ceiling {
            if self.today_cost + spend > ceiling {
                return Err((DenialReason::CostLimited, until_next_utc_midnight(now)));
            }
        }

        self.tokens -= needed;
        self.active_requests += 1;
        self.today_cost += spend;
        Ok(())
    }

    fn release(&mut self) -> bool {
        if self.active_requests == 0 {
            return false;
        }
        self.active_requests -= 1;
        true
    }
}

#[derive(Debug, Default)]
struct AdmissionQueue {
    waiting: BTreeSet<(Reverse<u8>, u64)>,
    next_seq: u64,
}

#[derive(Debug)]
struct ProviderQuota {
    bucket: Mutex<TokenBucket>,
    queue: Mutex<AdmissionQueue>,
}

impl ProviderQuota {
    fn lock_bucket(&self) -> MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(|poisoned| {
            warn!("token bucket mutex was poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn lock_queue(&self) -> MutexGuard<'_, AdmissionQueue> {
        self.queue.lock().unwrap_or_else(|poisoned| {
            warn!("admission queue mutex was poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn release(&self, provider: &ProviderId) {
        if !self.lock_bucket().release() {
            warn!(provider = %provider, "quota release without an active reservation");
        }
    }
}

struct GovernorInner {
    providers: RwLock<HashMap<ProviderId, Arc<ProviderQuota>>>,
    poll_interval: Duration,
    events: EventBus,
}

/// Per-provider admission control.
#[derive(Clone)]
pub struct QuotaGovernor {
    inner: Arc<GovernorInner>,
}

impl Default for QuotaGovernor {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_POLL_INTERVAL, EventBus::default())
    }
}

impl QuotaGovernor {
    pub fn new(poll_interval: Duration, events: EventBus) -> Self {
        Self {
            inner: Arc::new(GovernorInner {
                providers: RwLock::new(HashMap::new()),
                poll_interval: poll_interval.max(Duration::from_millis(1)),
                events,
            }),
        }
    }

    /// Register or replace the policy for a provider. Replacing resets its bucket.
    pub fn register(&self, provider: ProviderId, policy: QuotaPolicy) {
        let quota = Arc::new(ProviderQuota {
            bucket: Mutex::new(TokenBucket::new(policy)),
            queue: Mutex::new(AdmissionQueue::default()),
        });
        let mut providers = self
            .inner
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        providers.insert(provider, quota);
    }

    /// Reserve `cost` tokens and one concurrency slot. The slot is returned when
    /// the permit is dropped or released.
    pub fn check_and_reserve(&self, provider: &ProviderId, cost: u32) -> Result<QuotaPermit, QuotaDenied> {
        let quota = self.quota(provider)?;
        self.reserve_on(provider, &quota, cost)?;
        Ok(QuotaPermit::new(provider.clone(), quota))
    }

    /// Reserve without a guard; the caller must call [`QuotaGovernor::release`].
    pub fn reserve_detached(&self, provider: &ProviderId, cost: u32) -> Result<(), QuotaDenied> {
        let quota = self.quota(provider)?;
        self.reserve_on(provider, &quota, cost)
    }

    /// Return a concurrency slot taken by [`QuotaGovernor::reserve_detached`].
    pub fn release(&self, provider: &ProviderId) {
        if let Ok(quota) = self.quota(provider) {
            quota.release(provider);
        }
    }

    /// Wait in the provider's admission queue until a reservation succeeds.
    ///
    /// Waiters are ordered by descending `priority`, then arrival. Only the head
    /// of the queue is re-evaluated, once per poll interval. Cancelling the
    /// token or dropping the future removes the waiter.
    pub async fn acquire_queued(
        &self,
        provider: &ProviderId,
        cost: u32,
        priority: u8,
        cancel: &CancellationToken,
    ) -> Result<QuotaPermit, QueueError> {
        let quota = self.quota(provider)?;
        let ticket = QueueTicket::enqueue(Arc::clone(&quota), priority);
        debug!(provider = %provider, priority, "queued quota reservation");

        loop {
            if ticket.is_head() {
                let admitted = quota.lock_bucket().try_reserve(cost, self.inner.poll_interval);
                if admitted.is_ok() {
                    drop(ticket);
                    return Ok(QuotaPermit::new(provider.clone(), quota));
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(QueueError::Cancelled { provider: provider.clone() });
                }
                _ = tokio::time::sleep(self.inner.poll_interval) => {}
            }
        }
    }

    pub fn snapshot(&self, provider: &ProviderId) -> Option<QuotaSnapshot> {
        let quota = self.quota(provider).ok()?;
        let queued = quota.lock_queue().waiting.len();
        let mut bucket = quota.lock_bucket();
        bucket.refill();
        bucket.roll_cost_day(OffsetDateTime::now_utc());

        Some(QuotaSnapshot {
            tokens: bucket.tokens,
            capacity: bucket.policy.capacity,
            active_requests: bucket.active_requests,
            concurrency_ceiling: bucket.policy.concurrency_ceiling,
            today_cost: bucket.today_cost,
            daily_cost_ceiling: bucket.policy.daily_cost_ceiling,
            queued,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    fn quota(&self, provider: &ProviderId) -> Result<Arc<ProviderQuota>, QuotaDenied> {
        let providers = self
            .inner
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        providers.get(provider).cloned().ok_or_else(|| QuotaDenied {
            provider: provider.clone(),
            reason: DenialReason::UnknownProvider,
            retry_after: Duration::ZERO,
        })
    }

    fn reserve_on(&self, provider: &ProviderId, quota: &ProviderQuota, cost: u32) -> Result<(), QuotaDenied> {
        let outcome = quota.lock_bucket().try_reserve(cost, self.inner.poll_interval);
        outcome.map_err(|(reason, retry_after)| {
            debug!(
                provider = %provider,
                reason = reason.as_str(),
                retry_after_ms = duration_ms(retry_after),
                "quota denied"
            );
            self.inner.events.publish(OrchestratorEvent::QuotaDenied {
                provider: provider.clone(),
                reason,
                retry_after_ms: duration_ms(retry_after),
            });
            QuotaDenied {
                provider: provider.clone(),
                reason,
                retry_after,
            }
        })
    }

    #[cfg(test)]
    fn rewind_refill_clock(&self, provider: &ProviderId, by: Duration) {
        let quota = self.quota(provider).expect("registered");
        let mut bucket = quota.lock_bucket();
        bucket.last_refill = bucket.last_refill.checked_sub(by).expect("clock rewinds");
    }
}

/// Guard for one reservation; releases its concurrency slot on drop.
#[must_use = "dropping the permit releases the reservation immediately"]
#[derive(Debug)]
pub struct QuotaPermit {
    provider: ProviderId,
    quota: Arc<ProviderQuota>,
    released: bool,
}

impl QuotaPermit {
    fn new(provider: ProviderId, quota: Arc<ProviderQuota>) -> Self {
        Self {
            provider,
            quota,
            released: false,
        }
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.quota.release(&self.provider);
        }
    }
}

impl Drop for QuotaPermit {
    fn drop(&mut self) {
        self.release_once();
    }
}

struct QueueTicket {
    quota: Arc<ProviderQuota>,
    key: (Reverse<u8>, u64),
}

impl QueueTicket {
    fn enqueue(quota: Arc<ProviderQuota>, priority: u8) -> Self {
        let key = {
            let mut queue = quota.lock_queue();
            let key = (Reverse(priority), queue.next_seq);
            queue.next_seq += 1;
            queue.waiting.insert(key);
            key
        };
        Self { quota, key }
    }

    fn is_head(&self) -> bool {
        self.quota.lock_queue().waiting.first() == Some(&self.key)
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.quota.lock_queue().waiting.remove(&self.key);
    }
}

fn until_next_utc_midnight(now: OffsetDateTime) -> Duration {
    let next_day = now.date().next_day().unwrap_or(now.date());
    let midnight = next_day.with_time(Time::MIDNIGHT).assume_utc();
    let remaining = midnight - now;
    Duration::try_from(remaining).unwrap_or(Duration::ZERO)
}
