//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: Clock ベースの ULID（本番用、FixedClock でテスト可能）

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::ids::{OperationId, TaskId};
use crate::ports::Clock;

/// IdGenerator は Operation / Task の ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（ワーカーから共有される）
pub trait IdGenerator: Send + Sync {
    fn generate_operation_id(&self) -> OperationId;

    fn generate_task_id(&self) -> TaskId;
}

/// UlidGenerator は Clock の時刻を timestamp 部分に使う
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_operation_id(&self) -> OperationId {
        OperationId::from(self.next())
    }

    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }
}
