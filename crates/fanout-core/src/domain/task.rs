//! AsyncTask: the trackable record of one work item's lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::ids::TaskId;
use super::status::Status;
use crate::error::FanoutError;

/// Progress value of a completed task.
pub const PROGRESS_DONE: f64 = 100.0;

/// Ceiling for tasks still in flight; only completion reaches `PROGRESS_DONE`.
pub const PROGRESS_ACTIVE_MAX: f64 = 99.0;

/// One sub-unit of an Operation.
///
/// Design:
/// - State transitions go through methods (`update_status`, `set_result`, ...),
///   never by field assignment, so terminal tasks stay terminal.
/// - `progress` is 0..=100 and never decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncTask {
    pub task_id: TaskId,
    status: Status,
    progress: f64,
    pub input_data: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AsyncTask {
    pub fn new(task_id: TaskId, input_data: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            status: Status::Pending,
            progress: 0.0,
            input_data,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, attaching `error_msg` when failing or cancelling.
    pub fn update_status(
        &mut self,
        next: Status,
        error_msg: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), FanoutError> {
        if !self.status.can_transition_to(next) {
            return Err(FanoutError::InvalidTransition {
                task_id: self.task_id,
                from: self.status,
                to: next,
            });
        }
        let previous = self.status;
        self.status = next;
        self.updated_at = now;
        if matches!(next, Status::Failed | Status::Cancelled) && error_msg.is_some() {
            self.error = error_msg;
        }
        if next == Status::Completed {
            self.progress = PROGRESS_DONE;
        }
        debug!(task_id = %self.task_id, from = %previous, to = %next, "task status updated");
        Ok(())
    }

    /// Complete with `value` attached.
    pub fn set_result(
        &mut self,
        value: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), FanoutError> {
        self.update_status(Status::Completed, None, now)?;
        self.result = Some(value);
        info!(task_id = %self.task_id, "task completed");
        Ok(())
    }

    /// Fail with `message` attached.
    pub fn set_failure(
        &mut self,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), FanoutError> {
        let message = message.into();
        self.update_status(Status::Failed, Some(message.clone()), now)?;
        warn!(task_id = %self.task_id, error = %message, "task failed");
        Ok(())
    }

    /// Raise progress; lower values and terminal tasks are ignored.
    pub fn set_progress(&mut self, progress: f64, now: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }
        let progress = progress.clamp(0.0, PROGRESS_ACTIVE_MAX);
        if progress > self.progress {
            self.progress = progress;
            self.updated_at = now;
        }
    }
}
