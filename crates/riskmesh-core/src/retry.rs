//! Retry backoff with exponential growth and jitter.

use std::time::Duration;

/// Relative jitter applied around an exponential delay.
pub const JITTER_RATIO: f64 = 0.10;

/// Backoff strategy for retrying failed transport attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same pause before every retry. Mostly useful in tests.
    Fixed { delay: Duration },
    /// `base * factor^attempt`, never longer than `max`.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        /// Spread each delay by up to [`JITTER_RATIO`] either way.
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(200),
            factor: 2.0,
            max: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Exponential backoff doubling from `base` up to `max`, with jitter.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::Exponential {
            base,
            factor: 2.0,
            max,
            jitter: true,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let seconds = base.as_secs_f64() * factor.powi(exponent);
                let capped_seconds = seconds.min(max.as_secs_f64());

                if !jitter {
                    return Duration::from_secs_f64(capped_seconds);
                }

                let offset = (fastrand::f64() * 2.0 - 1.0) * JITTER_RATIO;
                Duration::from_secs_f64((capped_seconds * (1.0 + offset)).max(0.0))
            }
        }
    }

    /// Longest delay this strategy will produce before jitter.
    pub fn cap(self) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential { max, .. } => max,
        }
    }
}
