use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tracing::{error, info};

use super::stats::{QueueStats, StatsCell};
use super::task_queue::TaskQueue;

/// Runs many queues concurrently, one spawned task per queue.
/// - 完了順序の保証はない（全キュー終了だけを保証）
/// - `probe()` で実行中の進捗を外から覗ける
#[derive(Default)]
pub struct TaskManager {
    queues: Vec<TaskQueue>,
    probe: ManagerProbe,
}

/// Cloneable read-only view of a running `TaskManager`.
#[derive(Debug, Clone, Default)]
pub struct ManagerProbe {
    inner: Arc<ProbeInner>,
}

#[derive(Debug, Default)]
struct ProbeInner {
    processing: AtomicBool,
    queues: Mutex<Vec<Arc<StatsCell>>>,
}

impl ManagerProbe {
    /// True between the first queue starting and the last one finishing.
    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire)
    }

    /// Current stats of every registered queue, in registration order.
    pub fn stats(&self) -> Vec<QueueStats> {
        let cells = self
            .inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        cells.iter().map(|cell| cell.snapshot()).collect()
    }

    fn register(&self, cell: Arc<StatsCell>) {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cell);
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_queue(&mut self, queue: TaskQueue) {
        self.probe.register(queue.stats_cell());
        self.queues.push(queue);
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn probe(&self) -> ManagerProbe {
        self.probe.clone()
    }

    pub fn is_processing(&self) -> bool {
        self.probe.is_processing()
    }

    /// Run every registered queue and wait for all of them.
    /// Queues are consumed; stats come back in registration order.
    pub async fn run(&mut self) -> Vec<QueueStats> {
        let queues = std::mem::take(&mut self.queues);
        if queues.is_empty() {
            return Vec::new();
        }

        self.probe.inner.processing.store(true, Ordering::Release);
        info!(queues = queues.len(), "task manager started");

        let mut running = JoinSet::new();
        for mut queue in queues {
            running.spawn(async move {
                queue.run().await;
            });
        }
        while let Some(joined) = running.join_next().await {
            // a queue never propagates work errors; this is a bug or abort
            if let Err(e) = joined {
                error!(error = %e, "queue task aborted");
            }
        }

        self.probe.inner.processing.store(false, Ordering::Release);
        info!("task manager finished");
        self.probe.stats()
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("queues", &self.queues)
            .field("processing", &self.is_processing())
            .finish()
    }
}
