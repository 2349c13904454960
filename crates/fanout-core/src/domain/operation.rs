//! Operation: the externally visible long-running unit of work.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ids::{OperationId, TaskId};
use super::status::Status;
use super::task::AsyncTask;
use crate::error::FanoutError;

/// Message attached to tasks cancelled by an operator.
pub const CANCELLED_MESSAGE: &str = "operation cancelled by caller";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Comparison,
    Training,
    Generic,
}

/// Operation record: owns its tasks, derives status and progress from them.
///
/// Design: following the same pattern as the task record.
/// - Status and progress are computed, never stored.
/// - The whole struct is the persisted form (see `OperationStore`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: OperationId,
    pub operation_type: OperationType,
    pub caller_token_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
    tasks: BTreeMap<TaskId, AsyncTask>,

    /// Aggregate report attached when the batch finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    report: Option<serde_json::Value>,
}

impl Operation {
    pub fn new(
        operation_id: OperationId,
        operation_type: OperationType,
        caller_token_id: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            operation_id,
            operation_type,
            caller_token_id: caller_token_id.into(),
            created_at: now,
            updated_at: now,
            expiration: now + ttl,
            tasks: BTreeMap::new(),
            report: None,
        }
    }

    pub fn add_task(&mut self, task: AsyncTask) {
        self.updated_at = self.updated_at.max(task.updated_at);
        self.tasks.insert(task.task_id, task);
    }

    pub fn task(&self, task_id: TaskId) -> Option<&AsyncTask> {
        self.tasks.get(&task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &AsyncTask> {
        self.tasks.values()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    fn task_mut(&mut self, task_id: TaskId) -> Result<&mut AsyncTask, FanoutError> {
        self.tasks
            .get_mut(&task_id)
            .ok_or(FanoutError::TaskNotFound(task_id))
    }

    /// Mark the task as having an attempt in flight.
    pub fn start_task(&mut self, task_id: TaskId, now: DateTime<Utc>) -> Result<(), FanoutError> {
        self.task_mut(task_id)?
            .update_status(Status::Processing, None, now)?;
        self.updated_at = now;
        Ok(())
    }

    pub fn complete_task(
        &mut self,
        task_id: TaskId,
        value: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), FanoutError> {
        self.task_mut(task_id)?.set_result(value, now)?;
        self.updated_at = now;
        Ok(())
    }

    pub fn fail_task(
        &mut self,
        task_id: TaskId,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), FanoutError> {
        self.task_mut(task_id)?.set_failure(message, now)?;
        self.updated_at = now;
        Ok(())
    }

    pub fn cancel_task(&mut self, task_id: TaskId, now: DateTime<Utc>) -> Result<(), FanoutError> {
        self.task_mut(task_id)?.update_status(
            Status::Cancelled,
            Some(CANCELLED_MESSAGE.to_string()),
            now,
        )?;
        self.updated_at = now;
        Ok(())
    }

    pub fn set_task_progress(
        &mut self,
        task_id: TaskId,
        progress: f64,
        now: DateTime<Utc>,
    ) -> Result<(), FanoutError> {
        self.task_mut(task_id)?.set_progress(progress, now);
        self.updated_at = now;
        Ok(())
    }

    /// Consolidated status, derived from the tasks.
    ///
    /// Precedence: Failed > Processing (any pending/processing) > Cancelled > Completed.
    pub fn status(&self) -> Status {
        if self.tasks.is_empty() {
            return Status::NotStarted;
        }
        let states = || self.tasks.values().map(AsyncTask::status);
        if states().any(|s| s == Status::Failed) {
            Status::Failed
        } else if states().any(Status::is_active) {
            Status::Processing
        } else if states().any(|s| s == Status::Cancelled) {
            Status::Cancelled
        } else {
            Status::Completed
        }
    }

    /// Mean task progress normalised to 0.0..=1.0.
    pub fn progress(&self) -> f64 {
        if self.tasks.is_empty() {
            return 0.0;
        }
        let total: f64 = self.tasks.values().map(|t| t.progress() / 100.0).sum();
        total / self.tasks.len() as f64
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expiration
    }

    /// Latest task update when every task completed.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        if self.status() != Status::Completed {
            return None;
        }
        self.tasks.values().map(|t| t.updated_at).max()
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts {
            count: self.tasks.len(),
            ..TaskCounts::default()
        };
        for task in self.tasks.values() {
            match task.status() {
                Status::Completed => counts.completed += 1,
                Status::Failed => counts.failed += 1,
                Status::Cancelled => counts.cancelled += 1,
                Status::Pending | Status::Processing => counts.in_progress += 1,
                Status::NotStarted => {}
            }
        }
        counts
    }

    /// Results of completed tasks, keyed by task id.
    pub fn results(&self) -> BTreeMap<TaskId, serde_json::Value> {
        self.tasks
            .values()
            .filter(|t| t.status() == Status::Completed)
            .filter_map(|t| t.result().map(|r| (t.task_id, r.clone())))
            .collect()
    }

    /// Distinct failure messages, in task order.
    pub fn error_messages(&self) -> Vec<String> {
        let mut messages: Vec<String> = Vec::new();
        for task in self.tasks.values() {
            if task.status() != Status::Failed {
                continue;
            }
            if let Some(msg) = task.error()
                && !messages.iter().any(|m| m == msg)
            {
                messages.push(msg.to_string());
            }
        }
        messages
    }

    pub fn report(&self) -> Option<&serde_json::Value> {
        self.report.as_ref()
    }

    pub fn set_report(&mut self, report: serde_json::Value, now: DateTime<Utc>) {
        self.report = Some(report);
        self.updated_at = now;
    }

    /// Cancel every non-terminal task. Returns how many were cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> usize {
        let mut cancelled = 0;
        for task in self.tasks.values_mut() {
            if task.is_terminal() {
                continue;
            }
            if task
                .update_status(Status::Cancelled, Some(CANCELLED_MESSAGE.to_string()), now)
                .is_ok()
            {
                cancelled += 1;
            }
        }
        self.updated_at = now;
        info!(operation_id = %self.operation_id, cancelled, "operation cancelled");
        cancelled
    }

    /// Fail every non-terminal task with `message`. Returns how many were failed.
    pub fn set_failure(&mut self, message: &str, now: DateTime<Utc>) -> usize {
        let mut failed = 0;
        for task in self.tasks.values_mut() {
            if task.is_terminal() {
                continue;
            }
            match task.set_failure(message, now) {
                Ok(()) => failed += 1,
                Err(e) => warn!(operation_id = %self.operation_id, error = %e, "task not failed"),
            }
        }
        self.updated_at = now;
        failed
    }

    /// Caller-safe view.
    pub fn summary(&self) -> OperationSummary {
        let errors = self.error_messages();
        let results = if errors.is_empty() {
            let results = self.results();
            (!results.is_empty()).then_some(results)
        } else {
            None
        };
        OperationSummary {
            operation_id: self.operation_id,
            operation_type: self.operation_type,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expiration: self.expiration,
            completed_at: self.completed_at(),
            status: self.status(),
            progress: self.progress(),
            tasks: self.counts(),
            results,
            errors,
            report: self.report.clone(),
        }
    }
}

/// Per-status task counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub count: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub in_progress: usize,
}

/// Operation status for API responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub operation_id: OperationId,
    pub operation_type: OperationType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: Status,
    pub progress: f64,
    pub tasks: TaskCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<BTreeMap<TaskId, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<serde_json::Value>,
}

impl OperationSummary {
    pub fn is_done(&self) -> bool {
        self.status.is_terminal()
    }
}
