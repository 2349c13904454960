use thiserror::Error;

use crate::domain::{OperationId, ProviderId, Status, TaskId};

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no enabled providers for caller {caller}")]
    NoEnabledProviders { caller: String },

    #[error("provider not registered: {0}")]
    UnknownProvider(ProviderId),

    #[error("provider registered twice: {0}")]
    DuplicateProvider(ProviderId),

    #[error("missing credentials for provider {provider}")]
    MissingCredentials { provider: ProviderId },

    #[error("invalid configuration value for {key}: {message}")]
    InvalidConfig { key: String, message: String },

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: Status,
        to: Status,
    },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("operation store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure of a single work attempt. Never escapes `TaskQueue::run`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkError {
    /// Retried until the attempt budget runs out.
    #[error("{0}")]
    Transient(String),

    /// Breaker refused the call; finalized at once without using an attempt.
    #[error("service unavailable: circuit open for {service}")]
    CircuitOpen { service: String },
}

impl WorkError {
    pub fn transient(message: impl Into<String>) -> Self {
        WorkError::Transient(message.into())
    }
}

impl FanoutError {
    pub(crate) fn invalid_config(key: impl Into<String>, message: impl Into<String>) -> Self {
        FanoutError::InvalidConfig {
            key: key.into(),
            message: message.into(),
        }
    }
}
