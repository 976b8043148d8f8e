use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::events::{EventBus, OrchestratorEvent};
use crate::ProviderId;

/// Runtime circuit state for provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures within `failure_window` that open the circuit.
    pub failure_threshold: u32,
    /// Cooldown before an open circuit allows a half-open trial.
    pub open_timeout: Duration,
    /// A failure streak older than this starts over.
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            failure_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    streak_started_at: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    times_opened: u64,
    total_successes: u64,
    total_failures: u64,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            streak_started_at: None,
            opened_at: None,
            trial_in_flight: false,
            times_opened: 0,
            total_successes: 0,
            total_failures: 0,
        }
    }
}

/// Point-in-time view of a breaker, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Milliseconds until an open circuit admits a trial call.
    pub retry_in_ms: Option<u64>,
    pub times_opened: u64,
    pub total_successes: u64,
    pub total_failures: u64,
}

/// Thread-safe circuit breaker for one provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
    provider: Option<ProviderId>,
    events: Option<EventBus>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner::default()),
            provider: None,
            events: None,
        }
    }

    /// Attach the provider identity and event channel used for transition reports.
    pub fn observed(mut self, provider: ProviderId, events: EventBus) -> Self {
        self.provider = Some(provider);
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Ask to make a call. `None` means the circuit rejects it right now.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and hands
    /// out exactly one trial permit; further callers are rejected until that
    /// trial reports or is dropped.
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(CallPermit::new(self, false)),
            CircuitState::HalfOpen if inner.trial_in_flight => None,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Some(CallPermit::new(self, true))
            }
            CircuitState::Open => {
                if !self.cooldown_elapsed(&inner) {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.opened_at = None;
                inner.trial_in_flight = true;
                drop(inner);
                self.report(CircuitState::Open, CircuitState::HalfOpen);
                Some(CallPermit::new(self, true))
            }
        }
    }

    /// Whether a call would currently be admitted, without claiming a trial.
    pub fn is_accepting(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !inner.trial_in_flight,
            CircuitState::Open => self.cooldown_elapsed(&inner),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let retry_in_ms = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                let remaining = self.config.open_timeout.saturating_sub(opened_at.elapsed());
                Some(u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX))
            }
            _ => None,
        };

        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            retry_in_ms,
            times_opened: inner.times_opened,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
        }
    }

    /// Force the circuit closed. Returns `false` when it already was.
    pub fn reset(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == CircuitState::Closed {
            return false;
        }

        let previous = inner.state;
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.streak_started_at = None;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        drop(inner);

        self.report(previous, CircuitState::Closed);
        true
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.lock();
        inner.total_successes = inner.total_successes.saturating_add(1);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.streak_started_at = None;
            }
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.streak_started_at = None;
                inner.trial_in_flight = false;
                drop(inner);
                self.report(CircuitState::HalfOpen, CircuitState::Closed);
            }
            // A call admitted before the circuit opened does not close it.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.lock();
        inner.total_failures = inner.total_failures.saturating_add(1);
        let now = Instant::now();

        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                self.open(&mut inner, now);
                drop(inner);
                self.report(CircuitState::HalfOpen, CircuitState::Open);
            }
            CircuitState::Closed => {
                let streak_expired = inner
                    .streak_started_at
                    .map(|started| now.duration_since(started) > self.config.failure_window)
                    .unwrap_or(true);
                if streak_expired {
                    inner.consecutive_failures = 0;
                    inner.streak_started_at = Some(now);
                }
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut inner, now);
                    drop(inner);
                    self.report(CircuitState::Closed, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            }
        }
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    fn open(&self, inner: &mut CircuitInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.streak_started_at = None;
        inner.times_opened = inner.times_opened.saturating_add(1);
    }

    fn cooldown_elapsed(&self, inner: &CircuitInner) -> bool {
        inner
            .opened_at
            .map(|opened_at| opened_at.elapsed() >= self.config.open_timeout)
            .unwrap_or(true)
    }

    fn report(&self, from: CircuitState, to: CircuitState) {
        let Some(provider) = &self.provider else {
            return;
        };

        match to {
            CircuitState::Open => warn!(
                provider = %provider,
                from = from.as_str(),
                cooldown_ms = u64::try_from(self.config.open_timeout.as_millis()).unwrap_or(u64::MAX),
                "circuit opened"
            ),
            _ => info!(provider = %provider, from = from.as_str(), to = to.as_str(), "circuit state changed"),
        }

        if let Some(events) = &self.events {
            events.publish(OrchestratorEvent::CircuitStateChanged {
                provider: provider.clone(),
                from,
                to,
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("circuit breaker mutex was poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }
}

/// Admission ticket for one call. Report the outcome with [`CallPermit::success`]
/// or [`CallPermit::failure`]; dropping it unreported leaves the counters alone
/// and frees a half-open trial slot.
#[must_use = "report the call outcome or drop the permit"]
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            open_timeout: cooldown,
            failure_window: Duration::from_secs(60),
        })
    }

    fn fail(breaker: &CircuitBreaker) {
        breaker.try_acquire().expect("admitted").failure();
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = breaker(2, Duration::from_secs(30));

        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_none());
        assert!(!breaker.is_accepting());
        assert!(breaker.snapshot().retry_in_ms.is_some());
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let breaker = breaker(3, Duration::from_secs(30));

        fail(&breaker);
        fail(&breaker);
        breaker.try_acquire().expect("admitted").success();
        fail(&breaker);

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[test]
    fn failures_outside_the_window_start_a_new_streak() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            open_timeout: Duration::from_secs(30),
            failure_window: Duration::from_millis(5),
        });

        fail(&breaker);
        std::thread::sleep(Duration::from_millis(10));
        fail(&breaker);

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[test]
    fn half_open_admits_a_single_trial_then_closes_on_success() {
        let breaker = breaker(1, Duration::from_millis(1));
        fail(&breaker);
        std::thread::sleep(Duration::from_millis(3));

        let trial = breaker.try_acquire().expect("trial after cooldown");
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_none());

        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn failed_trial_reopens_the_circuit() {
        let breaker = breaker(1, Duration::from_millis(1));
        fail(&breaker);
        std::thread::sleep(Duration::from_millis(3));

        breaker.try_acquire().expect("trial").failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().times_opened, 2);
    }

    #[test]
    fn dropped_trial_frees_the_slot() {
        let breaker = breaker(1, Duration::from_millis(1));
        fail(&breaker);
        std::thread::sleep(Duration::from_millis(3));

        drop(breaker.try_acquire().expect("trial"));

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_some());
    }

    #[test]
    fn reset_is_a_no_op_on_a_closed_circuit() {
        let breaker = breaker(1, Duration::from_secs(30));
        assert!(!breaker.reset());
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker);
        assert!(breaker.reset());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.reset());
    }

    #[tokio::test]
    async fn transitions_are_published() {
        let events = EventBus::new(8);
        let mut receiver = events.subscribe();
        let breaker = breaker(1, Duration::from_secs(30))
            .observed(ProviderId::from_static("USGS"), events);

        fail(&breaker);

        assert_eq!(
            receiver.recv().await.expect("event"),
            OrchestratorEvent::CircuitStateChanged {
                provider: ProviderId::from_static("USGS"),
                from: CircuitState::Closed,
                to: CircuitState::Open,
            }
        );
    }
}
