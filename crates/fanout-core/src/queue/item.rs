//! Work item: one schedulable call plus its outcome channel.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::TaskId;
use crate::error::WorkError;

/// The callable behind a work item. `attempt` is 1-indexed.
#[async_trait]
pub trait Work: Send + Sync {
    async fn run(&self, attempt: u32) -> Result<Value, WorkError>;
}

struct FnWork<F>(F);

#[async_trait]
impl<F, Fut> Work for FnWork<F>
where
    F: Fn(u32) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, WorkError>> + Send,
{
    async fn run(&self, attempt: u32) -> Result<Value, WorkError> {
        (self.0)(attempt).await
    }
}

/// Wrap an async closure as `Work`.
pub fn work_fn<F, Fut>(f: F) -> Arc<dyn Work>
where
    F: Fn(u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, WorkError>> + Send + 'static,
{
    Arc::new(FnWork(f))
}

/// Terminal outcome of a work item.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    Succeeded(Value),

    /// Attempts exhausted; carries the last error message.
    Failed(String),

    /// Circuit open, the call was never made.
    Rejected { service: String },

    /// Stopped by cancellation before reaching another outcome.
    Cancelled,
}

impl WorkOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkOutcome::Succeeded(_))
    }
}

/// Lifecycle events sent on a work item's channel.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Started {
        task_id: TaskId,
        attempt: u32,
        max_attempts: u32,
    },
    Finished {
        task_id: TaskId,
        attempts: u32,
        outcome: WorkOutcome,
    },
}

impl QueueEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            QueueEvent::Started { task_id, .. } | QueueEvent::Finished { task_id, .. } => *task_id,
        }
    }
}

/// One schedulable unit owned by a `TaskQueue`.
pub struct WorkItem {
    pub id: TaskId,
    pub(crate) work: Arc<dyn Work>,
    events: Option<mpsc::UnboundedSender<QueueEvent>>,
    pub(crate) attempt: u32,
}

impl WorkItem {
    pub fn new(id: TaskId, work: Arc<dyn Work>) -> Self {
        Self {
            id,
            work,
            events: None,
            attempt: 1,
        }
    }

    /// Report lifecycle events on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<QueueEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn emit(&self, event: QueueEvent) {
        if let Some(tx) = &self.events
            && tx.send(event).is_err()
        {
            // receiver gone: nobody is tracking this item any more
            debug!(task_id = %self.id, "event receiver dropped");
        }
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("attempt", &self.attempt)
            .field("tracked", &self.events.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn closure_work_sees_attempt_number() {
        let work = work_fn(|attempt| async move {
            Ok::<_, WorkError>(json!({ "attempt": attempt }))
        });
        assert_eq!(work.run(3).await.unwrap(), json!({ "attempt": 3 }));
    }

    #[tokio::test]
    async fn events_reach_the_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = TaskId::generate();
        let work = work_fn(|_| async { Ok::<_, WorkError>(Value::Null) });
        let item = WorkItem::new(id, work).with_events(tx);

        item.emit(QueueEvent::Started {
            task_id: id,
            attempt: 1,
            max_attempts: 2,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id(), id);
        assert_eq!(item.attempt(), 1);
    }

    #[test]
    fn emit_without_receiver_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let work = work_fn(|_| async { Ok::<_, WorkError>(Value::Null) });
        let item = WorkItem::new(TaskId::generate(), work).with_events(tx);

        item.emit(QueueEvent::Finished {
            task_id: item.id,
            attempts: 1,
            outcome: WorkOutcome::Cancelled,
        });
    }
}
