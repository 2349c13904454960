//! Settings - 実行時の既定値と環境変数による上書き
//!
//! 環境変数（すべて任意）:
//! - `FANOUT_QUEUE_MAX_ATTEMPTS`, `FANOUT_QUEUE_INITIAL_WAIT_MS`,
//!   `FANOUT_QUEUE_BACKOFF_FACTOR`, `FANOUT_QUEUE_RANDOMNESS_FACTOR`
//! - `FANOUT_QUEUE_MAX_PARALLEL_FIRST`（`-1` で無制限）, `FANOUT_QUEUE_MAX_PARALLEL_RETRY`
//! - `FANOUT_BREAKER_FAILURE_THRESHOLD`, `FANOUT_BREAKER_RESET_TIMEOUT_SECS`,
//!   `FANOUT_BREAKER_SUCCESS_THRESHOLD`
//! - `FANOUT_OPERATION_TTL_SECS`

use std::str::FromStr;
use std::time::Duration;

use crate::error::FanoutError;
use crate::queue::QueueConfig;
use crate::resilience::CircuitBreakerConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct FanoutSettings {
    pub max_attempts: u32,
    pub initial_wait: Duration,
    pub backoff_factor: f64,
    pub randomness_factor: f64,
    /// `None` = unbounded.
    pub max_parallel_first: Option<usize>,
    pub max_parallel_retry: usize,
    pub breaker: CircuitBreakerConfig,
    pub operation_ttl: Duration,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_wait: Duration::from_secs(1),
            backoff_factor: 2.0,
            randomness_factor: 0.2,
            max_parallel_first: Some(3),
            max_parallel_retry: 1,
            breaker: CircuitBreakerConfig::default(),
            operation_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl FanoutSettings {
    /// Defaults overridden by `FANOUT_*` environment variables.
    pub fn from_env() -> Result<Self, FanoutError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, FanoutError> {
        let mut s = Self::default();

        if let Some(v) = parse(&lookup, "FANOUT_QUEUE_MAX_ATTEMPTS")? {
            s.max_attempts = v;
        }
        if let Some(ms) = parse::<u64>(&lookup, "FANOUT_QUEUE_INITIAL_WAIT_MS")? {
            s.initial_wait = Duration::from_millis(ms);
        }
        if let Some(v) = parse(&lookup, "FANOUT_QUEUE_BACKOFF_FACTOR")? {
            s.backoff_factor = v;
        }
        if let Some(v) = parse(&lookup, "FANOUT_QUEUE_RANDOMNESS_FACTOR")? {
            s.randomness_factor = v;
        }
        if let Some(v) = parse::<i64>(&lookup, "FANOUT_QUEUE_MAX_PARALLEL_FIRST")? {
            s.max_parallel_first = match v {
                -1 => None,
                n if n >= 0 => Some(n as usize),
                _ => {
                    return Err(FanoutError::invalid_config(
                        "FANOUT_QUEUE_MAX_PARALLEL_FIRST",
                        "must be >= 0 or -1 for unbounded",
                    ));
                }
            };
        }
        if let Some(v) = parse(&lookup, "FANOUT_QUEUE_MAX_PARALLEL_RETRY")? {
            s.max_parallel_retry = v;
        }
        if let Some(v) = parse(&lookup, "FANOUT_BREAKER_FAILURE_THRESHOLD")? {
            s.breaker.failure_threshold = v;
        }
        if let Some(secs) = parse::<u64>(&lookup, "FANOUT_BREAKER_RESET_TIMEOUT_SECS")? {
            s.breaker.reset_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = parse(&lookup, "FANOUT_BREAKER_SUCCESS_THRESHOLD")? {
            s.breaker.success_threshold = v;
        }
        if let Some(secs) = parse::<u64>(&lookup, "FANOUT_OPERATION_TTL_SECS")? {
            s.operation_ttl = Duration::from_secs(secs);
        }

        s.validate()?;
        Ok(s)
    }

    /// Queue policy for one provider queue.
    pub fn queue_config(&self, name: impl Into<String>) -> QueueConfig {
        QueueConfig::new(name)
            .with_max_attempts(self.max_attempts)
            .with_initial_wait(self.initial_wait)
            .with_backoff_factor(self.backoff_factor)
            .with_randomness_factor(self.randomness_factor)
            .with_max_parallel_first_attempt(self.max_parallel_first)
            .with_max_parallel_retry(self.max_parallel_retry)
    }

    pub fn operation_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.operation_ttl).unwrap_or(chrono::Duration::MAX)
    }

    pub fn validate(&self) -> Result<(), FanoutError> {
        self.queue_config("settings").validate()?;
        self.breaker.validate()
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, FanoutError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| FanoutError::invalid_config(key, format!("cannot parse {raw:?}")))
}
