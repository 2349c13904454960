//! Aggregator - キューイベントを Operation に反映する唯一の書き手
//!
//! - 1 Operation につき 1 タスク、1 チャネル
//! - Operation とレポートは同じ Mutex の中（Operation ごとに 1 つのロック）
//! - スナップショットの永続化はロックを保持したまま行う（書き込み順序を保つため）

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::domain::{ComparisonReport, Operation, ProviderResponse, Status, TaskId};
use crate::error::{FanoutError, WorkError};
use crate::ports::{Clock, OperationStore};
use crate::queue::{QueueEvent, WorkOutcome};

/// Where a task's response lands in the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Route {
    pub student_id: String,
    pub entry: String,
}

/// Mutable state of one running comparison.
#[derive(Debug)]
pub(crate) struct Batch {
    pub operation: Operation,
    pub report: ComparisonReport,
    pub routes: HashMap<TaskId, Route>,
}

pub(crate) type SharedBatch = Arc<Mutex<Batch>>;

/// Copy the report onto the operation so a finished snapshot always carries it.
pub(crate) fn attach_report(batch: &mut Batch, now: DateTime<Utc>) {
    match serde_json::to_value(&batch.report) {
        Ok(value) => batch.operation.set_report(value, now),
        Err(e) => warn!(error = %e, "report not serializable"),
    }
}

/// Progress shown while attempt `attempt` of `max_attempts` runs.
pub(crate) fn attempt_progress(attempt: u32, max_attempts: u32) -> f64 {
    let max = max_attempts.max(1) as f64;
    (attempt as f64 - 0.5) / max * 100.0
}

pub(crate) struct Aggregator {
    batch: SharedBatch,
    store: Arc<dyn OperationStore>,
    clock: Arc<dyn Clock>,
}

impl Aggregator {
    pub(crate) fn new(
        batch: SharedBatch,
        store: Arc<dyn OperationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { batch, store, clock }
    }

    /// Consume events until every sender is gone.
    pub(crate) async fn run(self, mut events: mpsc::UnboundedReceiver<QueueEvent>) {
        while let Some(event) = events.recv().await {
            let mut batch = self.batch.lock().await;
            let now = self.clock.now();
            let applied = apply(&mut batch, event, now);
            if let Err(e) = applied {
                // late events for tasks already cancelled land here
                debug!(operation_id = %batch.operation.operation_id, error = %e, "event ignored");
                continue;
            }
            if batch.operation.is_done() {
                attach_report(&mut batch, now);
            }
            if let Err(e) = self.store.update(&batch.operation).await {
                warn!(operation_id = %batch.operation.operation_id, error = %e, "snapshot not persisted");
            }
        }
    }
}

fn apply(batch: &mut Batch, event: QueueEvent, now: DateTime<Utc>) -> Result<(), FanoutError> {
    match event {
        QueueEvent::Started {
            task_id,
            attempt,
            max_attempts,
        } => {
            let task = batch
                .operation
                .task(task_id)
                .ok_or(FanoutError::TaskNotFound(task_id))?;
            if task.status() == Status::Pending {
                batch.operation.start_task(task_id, now)?;
            }
            batch
                .operation
                .set_task_progress(task_id, attempt_progress(attempt, max_attempts), now)
        }
        QueueEvent::Finished {
            task_id,
            attempts,
            outcome,
        } => {
            debug!(%task_id, attempts, success = outcome.is_success(), "task finished");
            match outcome {
                WorkOutcome::Succeeded(value) => {
                    batch.operation.complete_task(task_id, value.clone(), now)?;
                    record(batch, task_id, value);
                    Ok(())
                }
                WorkOutcome::Failed(message) => batch.operation.fail_task(task_id, message, now),
                WorkOutcome::Rejected { service } => {
                    let message = WorkError::CircuitOpen { service }.to_string();
                    batch.operation.fail_task(task_id, message, now)
                }
                WorkOutcome::Cancelled => batch.operation.cancel_task(task_id, now),
            }
        }
    }
}

fn record(batch: &mut Batch, task_id: TaskId, value: Value) {
    let Some(route) = batch.routes.get(&task_id) else {
        return;
    };
    match serde_json::from_value::<ProviderResponse>(value) {
        Ok(response) => batch
            .report
            .insert(&route.student_id, &route.entry, response),
        Err(e) => warn!(%task_id, error = %e, "result is not a provider response"),
    }
}
