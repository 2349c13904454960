//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - expect_providers() で期待されるプロバイダを登録
//! - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 設定値も build() 時に検証する

use std::sync::Arc;

use super::comparison::ComparisonService;
use super::settings::FanoutSettings;
use crate::domain::ProviderId;
use crate::error::FanoutError;
use crate::impls::{InMemoryOperationStore, ProviderRegistry};
use crate::ports::{
    Clock, IdGenerator, OperationStore, ProviderClient, ProviderConfigStore, SystemClock,
    UlidGenerator,
};
use crate::resilience::CircuitBreaker;

/// AppBuilder は ComparisonService を構築
///
/// # 使用例
/// ```ignore
/// let service = AppBuilder::new()
///     .register_provider("openai", Arc::new(OpenAiClient::new()))?
///     .expect_providers(&["openai"])
///     .config_store(Arc::new(configs))
///     .build()?;
/// ```
///
/// 省略時の既定値:
/// - clock: `SystemClock`
/// - ids: clock ベースの `UlidGenerator`
/// - operation store: `InMemoryOperationStore`
/// - circuit breaker: settings の breaker 設定から生成
pub struct AppBuilder {
    registry: ProviderRegistry,
    expected_providers: Option<Vec<ProviderId>>,
    settings: FanoutSettings,
    configs: Option<Arc<dyn ProviderConfigStore>>,
    store: Option<Arc<dyn OperationStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    breaker: Option<Arc<CircuitBreaker>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing providers: {0:?}. These providers were expected but not registered.")]
    MissingProviders(Vec<String>),

    #[error("Provider registered twice: {0}")]
    DuplicateProvider(ProviderId),

    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    #[error(transparent)]
    Config(#[from] FanoutError),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: ProviderRegistry::new(),
            expected_providers: None,
            settings: FanoutSettings::default(),
            configs: None,
            store: None,
            clock: None,
            ids: None,
            breaker: None,
        }
    }

    /// Provider client を登録
    pub fn register_provider(
        mut self,
        id: impl Into<ProviderId>,
        client: Arc<dyn ProviderClient>,
    ) -> Result<Self, BuildError> {
        self.registry.register(id, client).map_err(|e| match e {
            FanoutError::DuplicateProvider(id) => BuildError::DuplicateProvider(id),
            other => BuildError::Config(other),
        })?;
        Ok(self)
    }

    /// 期待されるプロバイダのリストを設定
    pub fn expect_providers(mut self, ids: &[&str]) -> Self {
        self.expected_providers = Some(ids.iter().map(|&id| ProviderId::new(id)).collect());
        self
    }

    pub fn settings(mut self, settings: FanoutSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn config_store(mut self, configs: Arc<dyn ProviderConfigStore>) -> Self {
        self.configs = Some(configs);
        self
    }

    pub fn operation_store(mut self, store: Arc<dyn OperationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Share an existing breaker (e.g. across several services in one process).
    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// 検証してから ComparisonService を生成
    pub fn build(self) -> Result<Arc<ComparisonService>, BuildError> {
        if let Some(expected) = &self.expected_providers {
            let missing: Vec<String> = expected
                .iter()
                .filter(|id| !self.registry.contains(id))
                .map(ToString::to_string)
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingProviders(missing));
            }
        }
        self.settings.validate()?;

        let configs = self
            .configs
            .ok_or(BuildError::MissingCollaborator("provider config store"))?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))) as Arc<dyn IdGenerator>);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryOperationStore::new()) as Arc<dyn OperationStore>);
        let breaker = match self.breaker {
            Some(breaker) => breaker,
            None => Arc::new(CircuitBreaker::new(
                self.settings.breaker.clone(),
                Arc::clone(&clock),
            )?),
        };

        Ok(Arc::new(ComparisonService::new(
            Arc::new(self.registry),
            configs,
            store,
            breaker,
            clock,
            ids,
            self.settings,
        )))
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}
