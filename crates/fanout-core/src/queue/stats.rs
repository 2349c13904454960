//! Per-queue counters for progress polling.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smoothing factor for the attempt-duration moving average.
pub const DURATION_EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub name: String,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub retried: usize,
    pub rejected: usize,
    pub cancelled: usize,
    /// Exponential moving average of attempt duration.
    pub avg_attempt_ms: Option<f64>,
}

impl QueueStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Items that reached a terminal outcome.
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.rejected + self.cancelled
    }

    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }

    pub(crate) fn observe_duration(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_attempt_ms = Some(match self.avg_attempt_ms {
            None => ms,
            Some(prev) => DURATION_EMA_ALPHA * ms + (1.0 - DURATION_EMA_ALPHA) * prev,
        });
    }
}

/// Shared, lock-protected stats of one queue.
#[derive(Debug)]
pub(crate) struct StatsCell(Mutex<QueueStats>);

impl StatsCell {
    pub(crate) fn new(name: &str) -> Self {
        Self(Mutex::new(QueueStats::new(name)))
    }

    // counters stay usable even if a holder panicked
    fn lock(&self) -> MutexGuard<'_, QueueStats> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut QueueStats)) {
        f(&mut self.lock());
    }

    pub(crate) fn snapshot(&self) -> QueueStats {
        self.lock().clone()
    }
}
