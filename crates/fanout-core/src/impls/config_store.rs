use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::domain::{CallerToken, ProviderConfig};
use crate::error::FanoutError;
use crate::ports::ProviderConfigStore;

/// Enabled provider configurations keyed by caller token.
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    by_caller: RwLock<HashMap<String, Vec<ProviderConfig>>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable `config` for `caller`.
    pub fn enable(&self, caller: &CallerToken, config: ProviderConfig) {
        self.by_caller
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(caller.as_str().to_string())
            .or_default()
            .push(config);
    }

    pub fn with_provider(self, caller: &CallerToken, config: ProviderConfig) -> Self {
        self.enable(caller, config);
        self
    }

    /// Remove every configuration of `caller`.
    pub fn clear(&self, caller: &CallerToken) {
        self.by_caller
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(caller.as_str());
    }
}

#[async_trait]
impl ProviderConfigStore for InMemoryConfigStore {
    async fn enabled_providers(
        &self,
        caller: &CallerToken,
    ) -> Result<Vec<ProviderConfig>, FanoutError> {
        Ok(self
            .by_caller
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(caller.as_str())
            .cloned()
            .unwrap_or_default())
    }
}
