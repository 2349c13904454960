//! ProviderConfigStore port - 呼び出し元ごとの有効なプロバイダ設定

use async_trait::async_trait;

use crate::domain::{CallerToken, ProviderConfig};
use crate::error::FanoutError;

#[async_trait]
pub trait ProviderConfigStore: Send + Sync {
    /// Enabled provider configurations for `caller`, possibly empty.
    async fn enabled_providers(
        &self,
        caller: &CallerToken,
    ) -> Result<Vec<ProviderConfig>, FanoutError>;
}
