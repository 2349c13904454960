//! Provider port - 外部 AI プロバイダへの 1 回の呼び出し
//!
//! 通常のプロバイダ側エラーは `Err(ProviderError)` で返す（panic しない）。
//! panic はキュー側で attempt 単位に捕捉され、一時的エラーとして扱われる。

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ProviderConfig, ProviderResponse, StudentPayload};
use crate::error::FanoutError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("communication failure: {0}")]
    Communication(String),

    #[error("provider timed out after {0}ms")]
    Timeout(u64),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

/// Capability set implemented once per provider integration.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Compare one student submission against the instructor reference.
    ///
    /// The client enforces its own deadline.
    async fn call(
        &self,
        config: &ProviderConfig,
        payload: &StudentPayload,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Whether the provider supports fine-tuning.
    fn can_train(&self) -> bool {
        false
    }

    /// Checked before dispatch; failures surface immediately, without retry.
    fn validate_config(&self, config: &ProviderConfig) -> Result<(), FanoutError> {
        if config.has_credentials() {
            Ok(())
        } else {
            Err(FanoutError::MissingCredentials {
                provider: config.provider.clone(),
            })
        }
    }
}
