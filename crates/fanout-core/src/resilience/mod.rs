//! Resilience - サービス単位の Circuit Breaker
//!
//! 失敗が続くプロバイダへの呼び出しを止め、クールダウン後に試験的に再開します。

mod circuit_breaker;
mod config;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitMetrics, CircuitState};
pub use config::CircuitBreakerConfig;
