//! InMemoryOperationStore - 開発用の Operation 永続化
//!
//! # 実装詳細
//! - Operation を serde_json で文字列化して保持する（永続化の往復を本物に近づける）
//! - Mutex のクリティカルセクションに await は含まない

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::domain::{Operation, OperationId};
use crate::error::FanoutError;
use crate::ports::OperationStore;

#[derive(Debug, Default)]
pub struct InMemoryOperationStore {
    records: Mutex<HashMap<OperationId, String>>,
}

impl InMemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<OperationId, String>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    /// Raw persisted form, for inspection.
    pub fn raw(&self, operation_id: OperationId) -> Option<String> {
        self.records().get(&operation_id).cloned()
    }

    /// Drop every operation whose expiration has passed. Returns how many went.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, FanoutError> {
        let mut records = self.records();
        let mut expired = Vec::new();
        for (id, raw) in records.iter() {
            let operation: Operation = serde_json::from_str(raw)?;
            if operation.is_expired(now) {
                expired.push(*id);
            }
        }
        for id in &expired {
            records.remove(id);
        }
        if !expired.is_empty() {
            info!(purged = expired.len(), "expired operations purged");
        }
        Ok(expired.len())
    }
}

#[async_trait]
impl OperationStore for InMemoryOperationStore {
    async fn create(&self, operation: &Operation) -> Result<(), FanoutError> {
        let raw = serde_json::to_string(operation)?;
        let mut records = self.records();
        if records.contains_key(&operation.operation_id) {
            return Err(FanoutError::Store(format!(
                "operation {} already exists",
                operation.operation_id
            )));
        }
        records.insert(operation.operation_id, raw);
        debug!(operation_id = %operation.operation_id, "operation created");
        Ok(())
    }

    async fn update(&self, operation: &Operation) -> Result<(), FanoutError> {
        let raw = serde_json::to_string(operation)?;
        let mut records = self.records();
        let slot = records
            .get_mut(&operation.operation_id)
            .ok_or(FanoutError::OperationNotFound(operation.operation_id))?;
        *slot = raw;
        Ok(())
    }

    async fn get(&self, operation_id: OperationId) -> Result<Option<Operation>, FanoutError> {
        let raw = self.records().get(&operation_id).cloned();
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(FanoutError::from)
    }
}
