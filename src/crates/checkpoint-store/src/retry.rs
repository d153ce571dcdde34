//! Backoff between commit attempts
//!
//! A commit that loses the pointer race is rebased onto the new pointer and
//! tried again. Attempts are spaced with exponential backoff and jitter so
//! writers racing on the same thread do not retry in lockstep.

use rand::Rng;
use std::time::Duration;

/// Commit retry schedule
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    pub initial_interval: Duration,

    /// Multiplier applied to the delay after each failed attempt
    pub backoff_factor: f64,

    /// Upper bound for a single delay
    pub max_interval: Duration,

    /// Scale each delay by a random factor in `0.5..=1.5`
    pub jitter: bool,
}

impl RetryPolicy {
    /// Policy making at most `max_attempts` attempts
    ///
    /// ```rust
    /// use checkpoint_store::RetryPolicy;
    ///
    /// let policy = RetryPolicy::new(3);
    /// assert!(policy.should_retry(2));
    /// assert!(!policy.should_retry(3));
    /// ```
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: Duration::from_millis(10),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(1),
            jitter: true,
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after failed attempt number `attempt` (0-indexed)
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_interval.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let scaled = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            capped
        };
        Duration::from_secs_f64(scaled.max(0.0))
    }

    /// Whether another attempt may follow `attempts` failed ones
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}
