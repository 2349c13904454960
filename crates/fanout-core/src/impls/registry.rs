use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::ProviderId;
use crate::error::FanoutError;
use crate::ports::ProviderClient;

/// Registry of provider clients (provider id -> client).
///
/// Design:
/// - Built during initialization (mutable).
/// - Used during dispatch (immutable, shared behind `Arc`).
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderId, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. A second registration for the same id is an error.
    pub fn register(
        &mut self,
        id: impl Into<ProviderId>,
        client: Arc<dyn ProviderClient>,
    ) -> Result<(), FanoutError> {
        let id = id.into();
        if self.providers.contains_key(&id) {
            return Err(FanoutError::DuplicateProvider(id));
        }
        self.providers.insert(id, client);
        Ok(())
    }

    pub fn get(&self, id: &ProviderId) -> Option<&Arc<dyn ProviderClient>> {
        self.providers.get(id)
    }

    /// Like `get`, but an unknown id is an error.
    pub fn resolve(&self, id: &ProviderId) -> Result<Arc<dyn ProviderClient>, FanoutError> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| FanoutError::UnknownProvider(id.clone()))
    }

    pub fn contains(&self, id: &ProviderId) -> bool {
        self.providers.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<ProviderId> {
        let mut ids: Vec<ProviderId> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}
