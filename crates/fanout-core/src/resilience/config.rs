use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FanoutError;

/// Thresholds shared by every service a breaker tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,

    /// Cooldown after the last failure before a trial call is allowed.
    pub reset_timeout: Duration,

    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), FanoutError> {
        if self.failure_threshold == 0 {
            return Err(FanoutError::invalid_config(
                "failure_threshold",
                "must be >= 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(FanoutError::invalid_config(
                "success_threshold",
                "must be >= 1",
            ));
        }
        Ok(())
    }
}
