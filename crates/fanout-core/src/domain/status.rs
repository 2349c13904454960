//! Status - タスクと Operation で共有する状態型
//!
//! AsyncTask と Operation は同じ `Status` を使う。
//! - task: Pending -> Processing -> {Completed | Failed}、非終端からは Cancelled
//! - operation: タスクから導出（`NotStarted` はタスク 0 件のときだけ）

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Operation with no tasks yet. Never carried by a task.
    NotStarted,

    /// Queued, no attempt started.
    Pending,

    /// At least one attempt has started.
    Processing,

    Completed,

    /// Provider-side failure, retries exhausted or circuit open.
    Failed,

    /// Operator-level cancellation, distinct from a provider failure.
    Cancelled,
}

impl Status {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Status::Pending | Status::Processing)
    }

    /// Allowed task-level transitions.
    pub fn can_transition_to(self, next: Status) -> bool {
        match (self, next) {
            (Status::Pending, Status::Processing) => true,
            // circuit-open rejection and cancellation can land before any attempt
            (Status::Pending, Status::Failed | Status::Cancelled) => true,
            (Status::Processing, Status::Processing) => true,
            (Status::Processing, Status::Completed | Status::Failed | Status::Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::NotStarted => "not_started",
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
