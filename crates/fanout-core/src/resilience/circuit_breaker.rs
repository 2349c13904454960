//! # Circuit Breaker
//!
//! Per-service state machine:
//! CLOSED -> (failures >= threshold) -> OPEN -> (cooldown elapsed) -> HALF_OPEN
//! -> (successes >= threshold) -> CLOSED, or HALF_OPEN -> (any failure) -> OPEN.
//!
//! Each service has its own lock, so unrelated services never block each other.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::CircuitBreakerConfig;
use crate::error::FanoutError;
use crate::ports::Clock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls go through
    #[default]
    Closed,
    /// Failing fast, calls are rejected
    Open,
    /// Trial calls allowed to probe recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Per-service record. Counters are consecutive, totals are cumulative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_state_change: Option<DateTime<Utc>>,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_rejected: u64,
}

impl CircuitMetrics {
    fn transition(&mut self, service: &str, to: CircuitState, now: DateTime<Utc>) {
        if self.state == to {
            return;
        }
        info!(service, from = %self.state, to = %to, "circuit state changed");
        self.state = to;
        self.last_state_change = Some(now);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker is open for {service}")]
    CircuitOpen { service: String },

    #[error("operation failed: {0}")]
    OperationFailed(E),
}

/// Shared gate in front of every external service, keyed by service name.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    services: RwLock<HashMap<String, Arc<Mutex<CircuitMetrics>>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Result<Self, FanoutError> {
        config.validate()?;
        info!(
            failure_threshold = config.failure_threshold,
            reset_timeout_secs = config.reset_timeout.as_secs(),
            success_threshold = config.success_threshold,
            "circuit breaker initialized"
        );
        Ok(Self {
            config,
            clock,
            services: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Metrics cell for `service`, created on first reference.
    fn cell(&self, service: &str) -> Arc<Mutex<CircuitMetrics>> {
        {
            let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(cell) = services.get(service) {
                return Arc::clone(cell);
            }
        }
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(services.entry(service.to_string()).or_default())
    }

    fn lock(cell: &Mutex<CircuitMetrics>) -> MutexGuard<'_, CircuitMetrics> {
        cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reset_timeout(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.reset_timeout).unwrap_or(TimeDelta::MAX)
    }

    /// Whether a call to `service` may proceed.
    /// An open circuit whose cooldown elapsed moves to HALF_OPEN and allows the call.
    ///
    /// HALF_OPEN does not limit trial calls: every caller is admitted until
    /// `success_threshold` successes close the circuit or one failure reopens it.
    /// Concurrency toward a recovering service is bounded only by the queue caps.
    pub fn can_execute(&self, service: &str) -> bool {
        let cell = self.cell(service);
        let mut m = Self::lock(&cell);
        match m.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let now = self.clock.now();
                let opened_at = m.last_failure_time.or(m.last_state_change);
                let cooled = opened_at
                    .is_none_or(|t| now.signed_duration_since(t) >= self.reset_timeout());
                if cooled {
                    m.transition(service, CircuitState::HalfOpen, now);
                    m.success_count = 0;
                    true
                } else {
                    m.total_rejected += 1;
                    debug!(service, "call rejected, circuit open");
                    false
                }
            }
        }
    }

    pub fn record_success(&self, service: &str) {
        let cell = self.cell(service);
        let mut m = Self::lock(&cell);
        let now = self.clock.now();
        m.failure_count = 0;
        m.total_successes += 1;
        m.last_success_time = Some(now);
        if m.state == CircuitState::HalfOpen {
            m.success_count += 1;
            if m.success_count >= self.config.success_threshold {
                m.transition(service, CircuitState::Closed, now);
                m.success_count = 0;
            }
        }
    }

    pub fn record_failure(&self, service: &str) {
        let cell = self.cell(service);
        let mut m = Self::lock(&cell);
        let now = self.clock.now();
        m.last_failure_time = Some(now);
        m.failure_count += 1;
        m.total_failures += 1;
        match m.state {
            CircuitState::HalfOpen => {
                warn!(service, "failure during trial, reopening circuit");
                m.transition(service, CircuitState::Open, now);
                m.success_count = 0;
            }
            CircuitState::Closed if m.failure_count >= self.config.failure_threshold => {
                warn!(service, failures = m.failure_count, "failure threshold reached");
                m.transition(service, CircuitState::Open, now);
            }
            _ => {}
        }
    }

    pub fn state(&self, service: &str) -> CircuitState {
        Self::lock(&self.cell(service)).state
    }

    /// Copy of the service's metrics.
    pub fn snapshot(&self, service: &str) -> CircuitMetrics {
        Self::lock(&self.cell(service)).clone()
    }

    /// Names of every service referenced so far.
    pub fn services(&self) -> Vec<String> {
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Admin reset: back to CLOSED with zeroed counters.
    pub fn reset(&self, service: &str) {
        let cell = self.cell(service);
        let mut m = Self::lock(&cell);
        let now = self.clock.now();
        info!(service, "circuit reset by operator");
        *m = CircuitMetrics {
            last_state_change: Some(now),
            ..CircuitMetrics::default()
        };
    }

    /// Operator override: open the circuit now, cooldown starts now.
    pub fn force_open(&self, service: &str) {
        let cell = self.cell(service);
        let mut m = Self::lock(&cell);
        let now = self.clock.now();
        m.last_failure_time = Some(now);
        m.success_count = 0;
        m.transition(service, CircuitState::Open, now);
    }

    /// Run `op` behind the breaker, recording its outcome.
    pub async fn call<T, E, F, Fut>(&self, service: &str, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.can_execute(service) {
            return Err(CircuitBreakerError::CircuitOpen {
                service: service.to_string(),
            });
        }
        match op().await {
            Ok(value) => {
                self.record_success(service);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(service);
                Err(CircuitBreakerError::OperationFailed(e))
            }
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("services", &self.services())
            .finish()
    }
}
