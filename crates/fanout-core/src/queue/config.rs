//! Queue policy: retry budget, backoff and concurrency caps.

use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::FanoutError;

/// Floor for any non-zero retry wait.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Immutable configuration for one provider queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub name: String,

    /// Total attempts per item, first try included (>= 1).
    pub max_attempts: u32,

    /// Wait before the second attempt.
    pub initial_wait: Duration,

    /// Multiplier applied for each further attempt (>= 1).
    pub backoff_factor: f64,

    /// Jitter fraction in 0..=1.
    pub randomness_factor: f64,

    /// Concurrency cap for first attempts. `None` = unbounded.
    pub max_parallel_first_attempt: Option<usize>,

    /// Concurrency cap for retries.
    pub max_parallel_retry: usize,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_attempts: 3,
            initial_wait: Duration::from_secs(30),
            backoff_factor: 2.0,
            randomness_factor: 0.2,
            max_parallel_first_attempt: None,
            max_parallel_retry: 1,
        }
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_initial_wait(mut self, wait: Duration) -> Self {
        self.initial_wait = wait;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_randomness_factor(mut self, factor: f64) -> Self {
        self.randomness_factor = factor;
        self
    }

    pub fn with_max_parallel_first_attempt(mut self, cap: Option<usize>) -> Self {
        self.max_parallel_first_attempt = cap;
        self
    }

    pub fn with_max_parallel_retry(mut self, cap: usize) -> Self {
        self.max_parallel_retry = cap;
        self
    }

    /// Reject values the permit machinery cannot work with.
    pub fn validate(&self) -> Result<(), FanoutError> {
        if self.max_attempts < 1 {
            return Err(FanoutError::invalid_config("max_attempts", "must be >= 1"));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(FanoutError::invalid_config("backoff_factor", "must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.randomness_factor) {
            return Err(FanoutError::invalid_config(
                "randomness_factor",
                "must be within 0..=1",
            ));
        }
        if let Some(cap) = self.max_parallel_first_attempt
            && !(1..=Semaphore::MAX_PERMITS).contains(&cap)
        {
            return Err(FanoutError::invalid_config(
                "max_parallel_first_attempt",
                format!("must be within 1..={} or unbounded", Semaphore::MAX_PERMITS),
            ));
        }
        if !(1..=Semaphore::MAX_PERMITS).contains(&self.max_parallel_retry) {
            return Err(FanoutError::invalid_config(
                "max_parallel_retry",
                format!("must be within 1..={}", Semaphore::MAX_PERMITS),
            ));
        }
        Ok(())
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Un-jittered wait before `attempt` (1-indexed).
    ///
    /// attempt 1 waits nothing; attempt n>1 waits
    /// `initial_wait * backoff_factor^(n-2)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(i32::MAX as u32) as i32;
        let secs = self.initial_wait.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Jittered wait before `attempt`, floored at `MIN_RETRY_DELAY`.
    ///
    /// A zero base (zero `initial_wait`, or attempt 1) means no wait at all.
    pub fn retry_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if base.is_zero() {
            return Duration::ZERO;
        }
        let jitter = if self.randomness_factor > 0.0 {
            rng.gen_range(-self.randomness_factor..=self.randomness_factor)
        } else {
            0.0
        };
        let delay = Duration::try_from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
            .unwrap_or(Duration::MAX)
            .max(MIN_RETRY_DELAY);
        debug!(
            queue = %self.name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retry delay computed"
        );
        delay
    }

    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_delay_with(attempt, &mut rand::thread_rng())
    }
}
