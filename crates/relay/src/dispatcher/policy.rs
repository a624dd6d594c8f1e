//! Exponential backoff policy for sink deliveries.
//!
//! Delays double per failed attempt starting at `base_delay`, are capped at
//! `max_delay`, and are jittered into `[delay / 2, delay]` so that a burst of
//! failures against one sink does not retry in lockstep. No delay ever
//! exceeds `max_delay`, and `max_delay` itself is bounded by
//! [`MAX_RETRY_DELAY`].

use std::time::Duration;

use rand::Rng;

/// Upper bound for any retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for delivery retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Maximum number of sink invocations per delivery, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Cap for exponential growth and for sink-requested delays.
    /// Values above [`MAX_RETRY_DELAY`] are treated as [`MAX_RETRY_DELAY`].
    pub max_delay: Duration,

    /// A sink call running longer than this counts as a failure.
    pub attempt_timeout: Duration,

    /// Bound of the queue feeding the retry scheduler.
    pub retry_queue_capacity: usize,
}

impl DeliveryPolicy {
    /// Default policy: 5 attempts, 500ms base, 60s cap, 10s per-call timeout.
    pub const DEFAULT: Self = Self {
        max_attempts: 5,
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(60),
        attempt_timeout: Duration::from_secs(10),
        retry_queue_capacity: 1024,
    };

    /// Un-jittered delay after `failed_attempts` failures (1-indexed).
    ///
    /// `base_delay * 2^(failed_attempts - 1)`, capped at `max_delay`.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.cap())
    }

    /// Jittered delay before the next attempt.
    ///
    /// `floor` is a sink-requested minimum (e.g. `Retry-After`). It raises
    /// the jittered delay but is itself clamped to the cap.
    pub fn retry_delay(&self, failed_attempts: u32, floor: Option<Duration>) -> Duration {
        let delay = jitter(self.backoff(failed_attempts));
        match floor {
            Some(min) => delay.max(min.min(self.cap())),
            None => delay,
        }
    }

    fn cap(&self) -> Duration {
        self.max_delay.min(MAX_RETRY_DELAY)
    }

    /// Returns `true` once `attempt_count` invocations exhaust the budget.
    pub fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = rand::rng().random_range(0.5..=1.0);
    delay.mul_f64(factor)
}
