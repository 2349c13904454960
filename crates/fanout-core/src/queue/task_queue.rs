//! Bounded, retrying executor for one logical group of work items.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::config::QueueConfig;
use super::item::{QueueEvent, WorkItem, WorkOutcome};
use super::stats::{QueueStats, StatsCell};
use crate::error::{FanoutError, WorkError};

/// Executes work items with two permit pools:
/// - first attempts compete for `max_parallel_first_attempt` permits
/// - retries compete for `max_parallel_retry` permits
///
/// No permit is held during the backoff sleep.
pub struct TaskQueue {
    config: QueueConfig,
    pending: Vec<WorkItem>,
    stats: Arc<StatsCell>,
    cancel: Option<watch::Receiver<bool>>,
}

/// State shared by every item driver of one `run()`.
struct Lanes {
    config: QueueConfig,
    first: Arc<Semaphore>,
    retry: Arc<Semaphore>,
    stats: Arc<StatsCell>,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Result<Self, FanoutError> {
        config.validate()?;
        let stats = Arc::new(StatsCell::new(&config.name));
        Ok(Self {
            config,
            pending: Vec::new(),
            stats,
            cancel: None,
        })
    }

    /// Stop starting attempts once `true` is sent on the channel.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append to the pending list. Nothing runs until `run()`.
    pub fn add_task(&mut self, item: WorkItem) {
        self.pending.push(item);
        self.stats.update(|s| s.pending += 1);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.snapshot()
    }

    pub(crate) fn stats_cell(&self) -> Arc<StatsCell> {
        Arc::clone(&self.stats)
    }

    /// Drain the pending list. Returns once every item is terminal.
    pub async fn run(&mut self) -> QueueStats {
        let items = std::mem::take(&mut self.pending);
        if items.is_empty() {
            return self.stats();
        }

        let first_permits = self
            .config
            .max_parallel_first_attempt
            .unwrap_or(Semaphore::MAX_PERMITS);
        let lanes = Arc::new(Lanes {
            config: self.config.clone(),
            first: Arc::new(Semaphore::new(first_permits)),
            retry: Arc::new(Semaphore::new(self.config.max_parallel_retry)),
            stats: Arc::clone(&self.stats),
        });

        info!(queue = %self.config.name, items = items.len(), "queue run started");

        let mut drivers = JoinSet::new();
        for item in items {
            let cancel = self.cancel.clone();
            drivers.spawn(drive(Arc::clone(&lanes), item, cancel));
        }
        while let Some(joined) = drivers.join_next().await {
            if let Err(e) = joined {
                error!(queue = %self.config.name, error = %e, "work item driver aborted");
            }
        }

        let stats = self.stats();
        info!(
            queue = %self.config.name,
            completed = stats.completed,
            failed = stats.failed,
            rejected = stats.rejected,
            cancelled = stats.cancelled,
            "queue run finished"
        );
        stats
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("config", &self.config)
            .field("pending", &self.pending.len())
            .finish()
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().is_some_and(|rx| *rx.borrow())
}

/// Resolves when cancellation is requested; never if the sender is gone.
async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = cancel.as_mut() else {
        return std::future::pending().await;
    };
    let sender_gone = rx.wait_for(|flag| *flag).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

/// Drives one item through its attempts until it is terminal.
async fn drive(lanes: Arc<Lanes>, mut item: WorkItem, mut cancel: Option<watch::Receiver<bool>>) {
    let name = lanes.config.name.as_str();
    let max_attempts = lanes.config.max_attempts;
    let mut started = false;
    let mut made = 0;

    loop {
        let attempt = item.attempt;

        if attempt > 1 {
            let delay = lanes.config.retry_delay(attempt);
            if !delay.is_zero() {
                debug!(queue = name, task_id = %item.id, attempt, ?delay, "backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancelled(&mut cancel) => {
                        return finish(&lanes, &item, started, made, WorkOutcome::Cancelled);
                    }
                }
            }
        }

        if is_cancelled(&cancel) {
            return finish(&lanes, &item, started, made, WorkOutcome::Cancelled);
        }

        let pool = if attempt == 1 { &lanes.first } else { &lanes.retry };
        let permit = tokio::select! {
            permit = Arc::clone(pool).acquire_owned() => permit,
            _ = cancelled(&mut cancel) => {
                return finish(&lanes, &item, started, made, WorkOutcome::Cancelled);
            }
        };
        let permit = match permit {
            Ok(_) if is_cancelled(&cancel) => {
                return finish(&lanes, &item, started, made, WorkOutcome::Cancelled);
            }
            Ok(permit) => permit,
            Err(e) => {
                error!(queue = name, task_id = %item.id, error = %e, "permit pool closed");
                let outcome = WorkOutcome::Failed(e.to_string());
                return finish(&lanes, &item, started, made, outcome);
            }
        };

        if !started {
            started = true;
            lanes.stats.update(|s| {
                s.pending = s.pending.saturating_sub(1);
                s.in_progress += 1;
            });
        }
        item.emit(QueueEvent::Started {
            task_id: item.id,
            attempt,
            max_attempts,
        });
        debug!(queue = name, task_id = %item.id, attempt, "attempt started");

        // own task per attempt so a panicking work function surfaces as JoinError
        let work = Arc::clone(&item.work);
        let began = Instant::now();
        let joined = tokio::spawn(async move { work.run(attempt).await }).await;
        drop(permit);
        lanes.stats.update(|s| s.observe_duration(began.elapsed()));
        if !matches!(joined, Ok(Err(WorkError::CircuitOpen { .. }))) {
            made += 1;
        }

        let message = match joined {
            Ok(Ok(value)) => {
                return finish(&lanes, &item, started, made, WorkOutcome::Succeeded(value));
            }
            Ok(Err(WorkError::CircuitOpen { service })) => {
                return finish(&lanes, &item, started, made, WorkOutcome::Rejected { service });
            }
            Ok(Err(WorkError::Transient(message))) => message,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(queue = name, task_id = %item.id, attempt, panic = %message, "work panicked");
                message
            }
            Err(e) => e.to_string(),
        };

        if lanes.config.should_retry(attempt) {
            warn!(queue = name, task_id = %item.id, attempt, error = %message, "attempt failed, retrying");
            lanes.stats.update(|s| s.retried += 1);
            item.attempt += 1;
            continue;
        }

        warn!(queue = name, task_id = %item.id, attempt, error = %message, "attempts exhausted");
        return finish(&lanes, &item, started, made, WorkOutcome::Failed(message));
    }
}

fn finish(lanes: &Lanes, item: &WorkItem, started: bool, attempts: u32, outcome: WorkOutcome) {
    lanes.stats.update(|s| {
        if started {
            s.in_progress = s.in_progress.saturating_sub(1);
        } else {
            s.pending = s.pending.saturating_sub(1);
        }
        match &outcome {
            WorkOutcome::Succeeded(_) => s.completed += 1,
            WorkOutcome::Failed(_) => s.failed += 1,
            WorkOutcome::Rejected { .. } => s.rejected += 1,
            WorkOutcome::Cancelled => s.cancelled += 1,
        }
    });
    debug!(queue = %lanes.config.name, task_id = %item.id, ?outcome, "work item finished");
    item.emit(QueueEvent::Finished {
        task_id: item.id,
        attempts,
        outcome,
    });
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    format!("work function panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;
    use crate::queue::work_fn;
    use rstest::rstest;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn fast_config(name: &str) -> QueueConfig {
        QueueConfig::new(name)
            .with_initial_wait(Duration::ZERO)
            .with_randomness_factor(0.0)
    }

    fn finished(events: &mut mpsc::UnboundedReceiver<QueueEvent>) -> Vec<(u32, WorkOutcome)> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::Finished {
                attempts, outcome, ..
            } = event
            {
                out.push((attempts, outcome));
            }
        }
        out
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(5)]
    #[tokio::test]
    async fn always_failing_work_runs_exactly_max_attempts(#[case] max_attempts: u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let work = work_fn(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(WorkError::transient("boom"))
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = TaskQueue::new(fast_config("q").with_max_attempts(max_attempts)).unwrap();
        queue.add_task(WorkItem::new(TaskId::generate(), work).with_events(tx));
        let stats = queue.run().await;

        assert_eq!(calls.load(Ordering::SeqCst), max_attempts);
        assert_eq!(
            finished(&mut rx),
            vec![(max_attempts, WorkOutcome::Failed("boom".into()))]
        );
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, (max_attempts - 1) as usize);
        assert!(stats.is_idle());
    }

    #[tokio::test]
    async fn success_after_retry_reports_result() {
        let work = work_fn(|attempt| async move {
            if attempt < 2 {
                Err(WorkError::transient("flaky"))
            } else {
                Ok(json!("ok"))
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = TaskQueue::new(fast_config("q").with_max_attempts(3)).unwrap();
        queue.add_task(WorkItem::new(TaskId::generate(), work).with_events(tx));
        queue.run().await;

        assert_eq!(
            finished(&mut rx),
            vec![(2, WorkOutcome::Succeeded(json!("ok")))]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn first_attempts_respect_the_parallel_cap() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut queue = TaskQueue::new(
            fast_config("capped").with_max_parallel_first_attempt(Some(1)),
        )
        .unwrap();
        for _ in 0..5 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let work = work_fn(move |_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, WorkError>(Value::Null)
                }
            });
            queue.add_task(WorkItem::new(TaskId::generate(), work));
        }

        let stats = queue.run().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(stats.completed, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn retries_respect_their_own_parallel_cap() {
        let first_running = Arc::new(AtomicUsize::new(0));
        let first_peak = Arc::new(AtomicUsize::new(0));
        let retry_running = Arc::new(AtomicUsize::new(0));
        let retry_peak = Arc::new(AtomicUsize::new(0));

        let mut queue = TaskQueue::new(
            fast_config("retry-capped")
                .with_max_attempts(2)
                .with_max_parallel_first_attempt(None)
                .with_max_parallel_retry(1),
        )
        .unwrap();
        for _ in 0..5 {
            let counters = [
                (Arc::clone(&first_running), Arc::clone(&first_peak)),
                (Arc::clone(&retry_running), Arc::clone(&retry_peak)),
            ];
            let work = work_fn(move |attempt| {
                let (running, peak) = counters[(attempt - 1) as usize].clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    if attempt == 1 {
                        Err(WorkError::transient("first try fails"))
                    } else {
                        Ok(json!(attempt))
                    }
                }
            });
            queue.add_task(WorkItem::new(TaskId::generate(), work));
        }

        let stats = queue.run().await;

        assert!(first_peak.load(Ordering::SeqCst) > 1);
        assert_eq!(retry_peak.load(Ordering::SeqCst), 1);
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.retried, 5);
    }

    // current-thread scheduling drives items in insertion order, so the
    // flaky item takes the single first-attempt permit before the others
    #[tokio::test]
    async fn backoff_does_not_hold_a_first_attempt_permit() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut queue = TaskQueue::new(
            QueueConfig::new("backoff")
                .with_max_attempts(2)
                .with_initial_wait(Duration::from_millis(300))
                .with_randomness_factor(0.0)
                .with_max_parallel_first_attempt(Some(1))
                .with_max_parallel_retry(1),
        )
        .unwrap();

        let flaky_log = Arc::clone(&log);
        let flaky = work_fn(move |attempt| {
            let log = Arc::clone(&flaky_log);
            async move {
                log.lock().unwrap().push(format!("flaky#{attempt}"));
                if attempt == 1 {
                    Err(WorkError::transient("not yet"))
                } else {
                    Ok(json!("recovered"))
                }
            }
        });
        queue.add_task(WorkItem::new(TaskId::generate(), flaky));
        for i in 0..3 {
            let log = Arc::clone(&log);
            let work = work_fn(move |_| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(format!("steady{i}"));
                    Ok::<_, WorkError>(Value::Null)
                }
            });
            queue.add_task(WorkItem::new(TaskId::generate(), work));
        }

        let stats = queue.run().await;

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 5);
        assert_eq!(log.first().map(String::as_str), Some("flaky#1"), "{log:?}");
        assert_eq!(log.last().map(String::as_str), Some("flaky#2"), "{log:?}");
        assert_eq!(stats.completed, 4);
    }

    #[tokio::test]
    async fn circuit_open_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let work = work_fn(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(WorkError::CircuitOpen {
                    service: "svc".into(),
                })
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = TaskQueue::new(fast_config("q").with_max_attempts(3)).unwrap();
        queue.add_task(WorkItem::new(TaskId::generate(), work).with_events(tx));
        let stats = queue.run().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            finished(&mut rx),
            vec![(
                0,
                WorkOutcome::Rejected {
                    service: "svc".into()
                }
            )]
        );
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.retried, 0);
    }

    #[tokio::test]
    async fn panics_are_caught_per_attempt() {
        let work = work_fn(|attempt| async move {
            if attempt == 1 {
                panic!("kaboom");
            }
            Ok::<_, WorkError>(json!(attempt))
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = TaskQueue::new(fast_config("q").with_max_attempts(2)).unwrap();
        queue.add_task(WorkItem::new(TaskId::generate(), work).with_events(tx));
        queue.run().await;

        assert_eq!(finished(&mut rx), vec![(2, WorkOutcome::Succeeded(json!(2)))]);
    }

    #[tokio::test]
    async fn cancel_stops_further_retries() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let work = work_fn(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(WorkError::transient("down"))
            }
        });

        let config = QueueConfig::new("q")
            .with_max_attempts(5)
            .with_initial_wait(Duration::from_secs(60))
            .with_randomness_factor(0.0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = TaskQueue::new(config).unwrap().with_cancel(cancel_rx);
        queue.add_task(WorkItem::new(TaskId::generate(), work).with_events(tx));

        let run = tokio::spawn(async move { queue.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.send(true).unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run should stop promptly after cancel")
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(finished(&mut rx), vec![(1, WorkOutcome::Cancelled)]);
    }

    #[tokio::test]
    async fn cancelled_before_start_never_runs() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let work = work_fn(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, WorkError>(Value::Null)
            }
        });

        let mut queue = TaskQueue::new(fast_config("q")).unwrap().with_cancel(cancel_rx);
        queue.add_task(WorkItem::new(TaskId::generate(), work));
        let stats = queue.run().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_up_front() {
        let err = TaskQueue::new(QueueConfig::new("q").with_max_parallel_retry(0)).unwrap_err();
        assert!(matches!(err, FanoutError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn empty_run_returns_immediately() {
        let mut queue = TaskQueue::new(fast_config("empty")).unwrap();
        assert!(queue.is_empty());
        let stats = queue.run().await;
        assert_eq!(stats.finished(), 0);
    }
}
