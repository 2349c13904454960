//! ComparisonService - 比較リクエストのファンアウトと LRO 管理
//!
//! # フロー
//! 1. リクエスト検証 → 有効なプロバイダ解決 → 資格情報チェック（ここまでは即時エラー）
//! 2. (student, provider config) ごとに AsyncTask を 1 つ持つ Operation を作成・保存
//! 3. プロバイダごとに TaskQueue を 1 つ作り、TaskManager で並行実行
//! 4. 各 WorkItem の結果はチャネル経由で Aggregator が Operation に反映
//! 5. 同期モードは完了まで待って結果を返し、非同期モードは Operation ID を即返す

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{info, warn};

use super::aggregator::{Aggregator, Batch, Route, SharedBatch, attach_report};
use super::settings::FanoutSettings;
use crate::domain::{
    AsyncTask, CallerToken, ComparisonReport, ComparisonRequest, Operation, OperationId,
    OperationSummary, OperationType, ProviderConfig, ProviderId, StudentPayload,
};
use crate::error::{FanoutError, WorkError};
use crate::impls::ProviderRegistry;
use crate::ports::{Clock, IdGenerator, OperationStore, ProviderClient, ProviderConfigStore};
use crate::queue::{QueueEvent, TaskManager, TaskQueue, Work, WorkItem};
use crate::resilience::{CircuitBreaker, CircuitBreakerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Run to completion before returning.
    Synchronous,
    /// Hand off to a background task and return the operation id.
    Asynchronous,
}

/// Finished comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonOutcome {
    pub operation_id: OperationId,
    pub summary: OperationSummary,
    pub report: ComparisonReport,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Completed(ComparisonOutcome),
    Accepted(OperationId),
}

impl Dispatch {
    pub fn operation_id(&self) -> OperationId {
        match self {
            Dispatch::Completed(outcome) => outcome.operation_id,
            Dispatch::Accepted(id) => *id,
        }
    }
}

/// One provider call behind the circuit breaker.
struct ProviderCall {
    client: Arc<dyn ProviderClient>,
    config: Arc<ProviderConfig>,
    payload: Arc<StudentPayload>,
    breaker: Arc<CircuitBreaker>,
}

#[async_trait]
impl Work for ProviderCall {
    async fn run(&self, _attempt: u32) -> Result<Value, WorkError> {
        let service = self.config.provider.as_str();
        let response = self
            .breaker
            .call(service, || self.client.call(&self.config, &self.payload))
            .await
            .map_err(|e| match e {
                CircuitBreakerError::CircuitOpen { service } => WorkError::CircuitOpen { service },
                CircuitBreakerError::OperationFailed(e) => WorkError::Transient(e.to_string()),
            })?;
        serde_json::to_value(response).map_err(|e| WorkError::Transient(e.to_string()))
    }
}

type ProviderGroup = (Arc<dyn ProviderClient>, Vec<Arc<ProviderConfig>>);

/// A running batch: its shared state plus the switch that cancels it.
struct Running {
    batch: SharedBatch,
    cancel: watch::Sender<bool>,
}

pub struct ComparisonService {
    registry: Arc<ProviderRegistry>,
    configs: Arc<dyn ProviderConfigStore>,
    store: Arc<dyn OperationStore>,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    settings: FanoutSettings,
    running: StdMutex<HashMap<OperationId, Running>>,
}

impl ComparisonService {
    pub(crate) fn new(
        registry: Arc<ProviderRegistry>,
        configs: Arc<dyn ProviderConfigStore>,
        store: Arc<dyn OperationStore>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        settings: FanoutSettings,
    ) -> Self {
        Self {
            registry,
            configs,
            store,
            breaker,
            clock,
            ids,
            settings,
            running: StdMutex::new(HashMap::new()),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &FanoutSettings {
        &self.settings
    }

    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<OperationId, Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the batch of `operation_id` is still executing in this process.
    pub fn is_running(&self, operation_id: OperationId) -> bool {
        self.running().contains_key(&operation_id)
    }

    /// Fan `request` out to every provider enabled for `caller`.
    ///
    /// Configuration errors (empty students, no providers, missing credentials)
    /// are returned before anything is dispatched.
    pub async fn compare(
        self: &Arc<Self>,
        request: ComparisonRequest,
        caller: &CallerToken,
        mode: DispatchMode,
    ) -> Result<Dispatch, FanoutError> {
        request.validate()?;

        let configs = self.configs.enabled_providers(caller).await?;
        if configs.is_empty() {
            warn!("no enabled providers for caller");
            return Err(FanoutError::NoEnabledProviders {
                caller: caller.as_str().to_string(),
            });
        }

        // group configs per provider; one queue each
        let mut groups: BTreeMap<ProviderId, ProviderGroup> = BTreeMap::new();
        let mut entries = HashSet::new();
        for config in configs {
            let client = self.registry.resolve(&config.provider)?;
            client.validate_config(&config)?;
            if !entries.insert(config.report_key()) {
                return Err(FanoutError::invalid_config(
                    config.report_key(),
                    "config name enabled twice for this provider",
                ));
            }
            groups
                .entry(config.provider.clone())
                .or_insert_with(|| (client, Vec::new()))
                .1
                .push(Arc::new(config));
        }

        let now = self.clock.now();
        let mut operation = Operation::new(
            self.ids.generate_operation_id(),
            OperationType::Comparison,
            caller.as_str(),
            now,
            self.settings.operation_ttl(),
        );
        let operation_id = operation.operation_id;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut manager = TaskManager::new();
        let mut routes = HashMap::new();

        for (provider, (client, configs)) in &groups {
            let mut queue = TaskQueue::new(self.settings.queue_config(format!("comp_{provider}")))?
                .with_cancel(cancel_rx.clone());
            for config in configs {
                for student_id in request.students.keys() {
                    let Some(payload) = request.payload_for(student_id) else {
                        continue;
                    };
                    let task_id = self.ids.generate_task_id();
                    let input = json!({
                        "student_id": student_id,
                        "provider": provider,
                        "config": config.name,
                        "model": config.model,
                    });
                    operation.add_task(AsyncTask::new(task_id, input, now));
                    routes.insert(
                        task_id,
                        Route {
                            student_id: student_id.clone(),
                            entry: config.report_key(),
                        },
                    );

                    let work = Arc::new(ProviderCall {
                        client: Arc::clone(client),
                        config: Arc::clone(config),
                        payload: Arc::new(payload),
                        breaker: Arc::clone(&self.breaker),
                    });
                    queue.add_task(WorkItem::new(task_id, work).with_events(events_tx.clone()));
                }
            }
            manager.add_queue(queue);
        }
        drop(events_tx);

        self.store.create(&operation).await?;
        info!(
            %operation_id,
            tasks = operation.task_count(),
            providers = groups.len(),
            ?mode,
            "comparison dispatched"
        );

        let batch = Arc::new(Mutex::new(Batch {
            operation,
            report: ComparisonReport::for_students(request.students.keys()),
            routes,
        }));
        self.running().insert(
            operation_id,
            Running {
                batch: Arc::clone(&batch),
                cancel: cancel_tx,
            },
        );

        match mode {
            DispatchMode::Synchronous => {
                let outcome = Arc::clone(self).execute(batch, manager, events_rx).await;
                Ok(Dispatch::Completed(outcome))
            }
            DispatchMode::Asynchronous => {
                let service = Arc::clone(self);
                tokio::spawn(async move {
                    service.execute(batch, manager, events_rx).await;
                });
                Ok(Dispatch::Accepted(operation_id))
            }
        }
    }

    /// Run every queue, wait for the aggregator, attach and persist the report.
    async fn execute(
        self: Arc<Self>,
        batch: SharedBatch,
        mut manager: TaskManager,
        events: mpsc::UnboundedReceiver<QueueEvent>,
    ) -> ComparisonOutcome {
        let aggregator = Aggregator::new(
            Arc::clone(&batch),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
        );
        let aggregating = tokio::spawn(aggregator.run(events));

        manager.run().await;
        if let Err(e) = aggregating.await {
            warn!(error = %e, "aggregator task aborted");
        }

        let mut batch = batch.lock().await;
        attach_report(&mut batch, self.clock.now());
        let operation_id = batch.operation.operation_id;
        if let Err(e) = self.store.update(&batch.operation).await {
            warn!(%operation_id, error = %e, "final snapshot not persisted");
        }

        let summary = batch.operation.summary();
        info!(
            %operation_id,
            status = %summary.status,
            completed = summary.tasks.completed,
            failed = summary.tasks.failed,
            "comparison finished"
        );
        let outcome = ComparisonOutcome {
            operation_id,
            summary,
            report: batch.report.clone(),
        };
        drop(batch);

        self.running().remove(&outcome.operation_id);
        outcome
    }

    /// Summary of the persisted operation; poll until `is_done()`.
    pub async fn get_operation(
        &self,
        operation_id: OperationId,
    ) -> Result<OperationSummary, FanoutError> {
        self.store
            .get(operation_id)
            .await?
            .map(|operation| operation.summary())
            .ok_or(FanoutError::OperationNotFound(operation_id))
    }

    /// Stop further attempts and cancel every non-terminal task.
    ///
    /// Calls already in flight run to completion; their results are dropped.
    pub async fn cancel(&self, operation_id: OperationId) -> Result<OperationSummary, FanoutError> {
        let batch = self.running().get(&operation_id).map(|running| {
            // receivers may already be gone when the batch is wrapping up
            let _ = running.cancel.send(true);
            Arc::clone(&running.batch)
        });

        let now = self.clock.now();
        let summary = match batch {
            Some(batch) => {
                let mut batch = batch.lock().await;
                let cancelled = batch.operation.cancel(now);
                attach_report(&mut batch, now);
                self.store.update(&batch.operation).await?;
                info!(%operation_id, cancelled, "running operation cancelled");
                batch.operation.summary()
            }
            None => {
                let mut operation = self
                    .store
                    .get(operation_id)
                    .await?
                    .ok_or(FanoutError::OperationNotFound(operation_id))?;
                let cancelled = operation.cancel(now);
                if cancelled > 0 {
                    self.store.update(&operation).await?;
                    info!(%operation_id, cancelled, "stored operation cancelled");
                }
                operation.summary()
            }
        };
        Ok(summary)
    }
}

impl std::fmt::Debug for ComparisonService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComparisonService")
            .field("registry", &self.registry)
            .field("breaker", &self.breaker)
            .field("settings", &self.settings)
            .field("running", &self.running().len())
            .finish()
    }
}
