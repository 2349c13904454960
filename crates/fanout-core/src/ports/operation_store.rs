//! OperationStore port - Operation の永続化（正本）
//!
//! # 設計原則
//! - Operation 全体（タスク含む）を 1 レコードとして保存する
//! - status / progress は保存しない（読み出し時にタスクから導出）
//! - 書き込みはメモリ上の遷移とトランザクション的に結合されていない。
//!   読み手はスナップショットが少し遅れていることを許容する

use async_trait::async_trait;

use crate::domain::{Operation, OperationId};
use crate::error::FanoutError;

#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn create(&self, operation: &Operation) -> Result<(), FanoutError>;

    /// Replace the stored snapshot. Unknown ids are an error.
    async fn update(&self, operation: &Operation) -> Result<(), FanoutError>;

    async fn get(&self, operation_id: OperationId) -> Result<Option<Operation>, FanoutError>;
}
