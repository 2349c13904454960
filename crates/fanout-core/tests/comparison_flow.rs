use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::sync::Notify;

use fanout_core::domain::{
    CallerToken, ComparisonRequest, OperationId, OperationSummary, ProviderConfig,
    ProviderResponse, Status, StudentPayload,
};
use fanout_core::impls::{InMemoryConfigStore, InMemoryOperationStore};
use fanout_core::ports::{FixedClock, ProviderClient, ProviderError};
use fanout_core::{
    AppBuilder, ComparisonService, Dispatch, DispatchMode, FanoutError, FanoutSettings,
};

/// Answers every call, counting them.
#[derive(Default)]
struct Succeeds {
    calls: AtomicU32,
}

#[async_trait]
impl ProviderClient for Succeeds {
    async fn call(
        &self,
        config: &ProviderConfig,
        payload: &StudentPayload,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProviderResponse {
            model_name: config.model.clone(),
            content: json!({ "student": payload.student_id, "score": 1.0 }),
            processing_time_ms: 1,
        })
    }
}

/// Fails every call with the same communication error.
#[derive(Default)]
struct Fails {
    calls: AtomicU32,
}

#[async_trait]
impl ProviderClient for Fails {
    async fn call(
        &self,
        _config: &ProviderConfig,
        _payload: &StudentPayload,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Communication("connection refused".into()))
    }
}

/// Blocks every call until released.
#[derive(Default)]
struct Gated {
    release: Notify,
}

#[async_trait]
impl ProviderClient for Gated {
    async fn call(
        &self,
        config: &ProviderConfig,
        _payload: &StudentPayload,
    ) -> Result<ProviderResponse, ProviderError> {
        self.release.notified().await;
        Ok(ProviderResponse {
            model_name: config.model.clone(),
            content: json!("late"),
            processing_time_ms: 0,
        })
    }
}

fn client<P: ProviderClient + 'static>(provider: Arc<P>) -> Arc<dyn ProviderClient> {
    provider
}

fn caller() -> CallerToken {
    CallerToken::new("caller-token-secret")
}

fn fast_settings() -> FanoutSettings {
    FanoutSettings {
        initial_wait: Duration::ZERO,
        randomness_factor: 0.0,
        ..FanoutSettings::default()
    }
}

fn request(students: &[&str]) -> ComparisonRequest {
    ComparisonRequest {
        instructor: json!("reference answer"),
        students: students
            .iter()
            .map(|s| (s.to_string(), json!(format!("answer of {s}"))))
            .collect(),
    }
}

fn config(name: &str, provider: &str) -> ProviderConfig {
    ProviderConfig::new(name, provider, format!("{provider}-model")).with_api_key("key")
}

fn build(
    settings: FanoutSettings,
    providers: Vec<(&str, Arc<dyn ProviderClient>)>,
    configs: InMemoryConfigStore,
) -> (Arc<ComparisonService>, Arc<InMemoryOperationStore>) {
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 0).unwrap(),
    ));
    let store = Arc::new(InMemoryOperationStore::new());
    let mut builder = AppBuilder::new()
        .settings(settings)
        .config_store(Arc::new(configs))
        .operation_store(store.clone())
        .clock(clock);
    for (id, client) in providers {
        builder = builder.register_provider(id, client).unwrap();
    }
    (builder.build().unwrap(), store)
}

async fn wait_until_done(service: &ComparisonService, id: OperationId) -> OperationSummary {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let summary = service.get_operation(id).await.unwrap();
            if summary.is_done() {
                return summary;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("operation should finish")
}

#[tokio::test]
async fn one_failing_provider_fails_the_operation() {
    let a = Arc::new(Succeeds::default());
    let b = Arc::new(Fails::default());
    let configs = InMemoryConfigStore::new()
        .with_provider(&caller(), config("a-cfg", "a"))
        .with_provider(&caller(), config("b-cfg", "b"));
    let (service, _) = build(
        fast_settings(),
        vec![("a", client(a.clone())), ("b", client(b.clone()))],
        configs,
    );

    let dispatch = service
        .compare(request(&["s1", "s2"]), &caller(), DispatchMode::Synchronous)
        .await
        .unwrap();
    let Dispatch::Completed(outcome) = dispatch else {
        panic!("synchronous compare must complete");
    };

    let summary = &outcome.summary;
    assert_eq!(summary.tasks.count, 4);
    assert_eq!(summary.tasks.completed, 2);
    assert_eq!(summary.tasks.failed, 2);
    assert_eq!(summary.status, Status::Failed);
    assert!(summary.is_done());
    assert_eq!(
        summary.errors,
        vec!["communication failure: connection refused".to_string()]
    );
    assert!(summary.results.is_none());

    assert_eq!(outcome.report.len(), 2);
    assert!(outcome.report.get("s1", "a/a-cfg").is_some());
    assert!(outcome.report.get("s2", "a/a-cfg").is_some());
    assert!(outcome.report.get("s1", "b/b-cfg").is_none());

    assert_eq!(a.calls.load(Ordering::SeqCst), 2);
    assert_eq!(b.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn same_config_name_on_two_providers_keeps_both_responses() {
    let configs = InMemoryConfigStore::new()
        .with_provider(&caller(), config("default", "a"))
        .with_provider(&caller(), config("default", "b"));
    let (service, _) = build(
        fast_settings(),
        vec![
            ("a", client(Arc::new(Succeeds::default()))),
            ("b", client(Arc::new(Succeeds::default()))),
        ],
        configs,
    );

    let dispatch = service
        .compare(request(&["s1"]), &caller(), DispatchMode::Synchronous)
        .await
        .unwrap();
    let Dispatch::Completed(outcome) = dispatch else {
        panic!("synchronous compare must complete");
    };

    assert_eq!(outcome.summary.tasks.completed, 2);
    assert_eq!(outcome.report.len(), 2);
    assert_eq!(outcome.report.get("s1", "a/default").unwrap().model_name, "a-model");
    assert_eq!(outcome.report.get("s1", "b/default").unwrap().model_name, "b-model");
}

#[tokio::test]
async fn persisted_operation_reloads_to_the_same_summary() {
    let configs = InMemoryConfigStore::new().with_provider(&caller(), config("a-cfg", "a"));
    let (service, store) = build(
        fast_settings(),
        vec![("a", client(Arc::new(Succeeds::default())))],
        configs,
    );

    let dispatch = service
        .compare(request(&["s1", "s2", "s3"]), &caller(), DispatchMode::Synchronous)
        .await
        .unwrap();
    let Dispatch::Completed(outcome) = dispatch else {
        panic!("synchronous compare must complete");
    };

    let reloaded = service.get_operation(outcome.operation_id).await.unwrap();
    assert_eq!(reloaded, outcome.summary);
    assert_eq!(reloaded.status, Status::Completed);
    assert_eq!(reloaded.progress, 1.0);
    assert_eq!(reloaded.results.as_ref().map(|r| r.len()), Some(3));
    assert!(reloaded.report.is_some());

    let raw = store.raw(outcome.operation_id).unwrap();
    assert!(raw.contains("caller-token-secret"));
    let summary_json = serde_json::to_string(&reloaded).unwrap();
    assert!(!summary_json.contains("caller-token-secret"));
}

#[tokio::test]
async fn asynchronous_compare_is_polled_to_completion() {
    let configs = InMemoryConfigStore::new()
        .with_provider(&caller(), config("a-small", "a"))
        .with_provider(&caller(), config("a-large", "a"));
    let (service, _) = build(
        fast_settings(),
        vec![("a", client(Arc::new(Succeeds::default())))],
        configs,
    );

    let dispatch = service
        .compare(request(&["s1", "s2"]), &caller(), DispatchMode::Asynchronous)
        .await
        .unwrap();
    let Dispatch::Accepted(id) = dispatch else {
        panic!("asynchronous compare must return a handle");
    };

    let summary = wait_until_done(&service, id).await;
    assert_eq!(summary.status, Status::Completed);
    assert_eq!(summary.tasks.completed, 4);
    assert_eq!(summary.progress, 1.0);
    assert!(summary.completed_at.is_some());

    let report = summary.report.unwrap();
    assert_eq!(report["s1"].as_object().unwrap().len(), 2);
    assert!(report["s2"]["a-large"].is_object());
}

#[tokio::test]
async fn cancel_marks_open_tasks_cancelled() {
    let gated = Arc::new(Gated::default());
    let configs = InMemoryConfigStore::new().with_provider(&caller(), config("g-cfg", "g"));
    let (service, _) = build(fast_settings(), vec![("g", client(gated.clone()))], configs);

    let id = service
        .compare(request(&["s1", "s2"]), &caller(), DispatchMode::Asynchronous)
        .await
        .unwrap()
        .operation_id();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(service.is_running(id));

    let summary = service.cancel(id).await.unwrap();
    assert_eq!(summary.status, Status::Cancelled);
    assert_eq!(summary.tasks.cancelled, 2);
    assert!(summary.is_done());

    // in-flight calls finish, but their results no longer count
    gated.release.notify_waiters();
    tokio::time::timeout(Duration::from_secs(5), async {
        while service.is_running(id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("batch should wind down");

    let after = service.get_operation(id).await.unwrap();
    assert_eq!(after.status, Status::Cancelled);
    assert_eq!(after.tasks.completed, 0);
}

#[tokio::test]
async fn open_circuit_skips_the_provider() {
    let a = Arc::new(Succeeds::default());
    let b = Arc::new(Succeeds::default());
    let configs = InMemoryConfigStore::new()
        .with_provider(&caller(), config("a-cfg", "a"))
        .with_provider(&caller(), config("b-cfg", "b"));
    let (service, _) = build(
        fast_settings(),
        vec![("a", client(a.clone())), ("b", client(b.clone()))],
        configs,
    );
    service.breaker().force_open("b");

    let Dispatch::Completed(outcome) = service
        .compare(request(&["s1", "s2"]), &caller(), DispatchMode::Synchronous)
        .await
        .unwrap()
    else {
        panic!("synchronous compare must complete");
    };

    assert_eq!(b.calls.load(Ordering::SeqCst), 0);
    assert_eq!(a.calls.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.summary.tasks.failed, 2);
    assert_eq!(
        outcome.summary.errors,
        vec!["service unavailable: circuit open for b".to_string()]
    );
    assert_eq!(service.breaker().snapshot("b").total_rejected, 2);
}

#[tokio::test]
async fn breaker_opens_during_a_batch() {
    let b = Arc::new(Fails::default());
    let configs = InMemoryConfigStore::new().with_provider(&caller(), config("b-cfg", "b"));
    let mut settings = FanoutSettings {
        max_attempts: 1,
        max_parallel_first: Some(1),
        ..fast_settings()
    };
    settings.breaker.failure_threshold = 2;
    let (service, _) = build(settings, vec![("b", client(b.clone()))], configs);

    let Dispatch::Completed(outcome) = service
        .compare(request(&["s1", "s2", "s3", "s4"]), &caller(), DispatchMode::Synchronous)
        .await
        .unwrap()
    else {
        panic!("synchronous compare must complete");
    };

    assert_eq!(b.calls.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.summary.tasks.failed, 4);
    assert_eq!(outcome.summary.errors.len(), 2);
}

#[tokio::test]
async fn configuration_errors_surface_before_dispatch() {
    let store_providers = vec![("a", client(Arc::new(Succeeds::default())))];

    // no providers enabled
    let (service, store) = build(
        fast_settings(),
        store_providers.clone(),
        InMemoryConfigStore::new(),
    );
    let err = service
        .compare(request(&["s1"]), &caller(), DispatchMode::Synchronous)
        .await
        .unwrap_err();
    assert!(matches!(err, FanoutError::NoEnabledProviders { .. }));
    assert!(store.is_empty());

    // missing credentials
    let configs = InMemoryConfigStore::new()
        .with_provider(&caller(), ProviderConfig::new("a-cfg", "a", "a-model"));
    let (service, store) = build(fast_settings(), store_providers.clone(), configs);
    let err = service
        .compare(request(&["s1"]), &caller(), DispatchMode::Asynchronous)
        .await
        .unwrap_err();
    assert!(matches!(err, FanoutError::MissingCredentials { .. }));
    assert!(store.is_empty());

    // unregistered provider
    let configs = InMemoryConfigStore::new().with_provider(&caller(), config("x-cfg", "x"));
    let (service, _) = build(fast_settings(), store_providers.clone(), configs);
    let err = service
        .compare(request(&["s1"]), &caller(), DispatchMode::Synchronous)
        .await
        .unwrap_err();
    assert!(matches!(err, FanoutError::UnknownProvider(_)));

    // one provider config enabled twice
    let configs = InMemoryConfigStore::new()
        .with_provider(&caller(), config("a-cfg", "a"))
        .with_provider(&caller(), config("a-cfg", "a"));
    let (service, store) = build(fast_settings(), store_providers.clone(), configs);
    let err = service
        .compare(request(&["s1"]), &caller(), DispatchMode::Synchronous)
        .await
        .unwrap_err();
    assert!(matches!(err, FanoutError::InvalidConfig { ref key, .. } if key == "a/a-cfg"));
    assert!(store.is_empty());

    // empty students
    let configs = InMemoryConfigStore::new().with_provider(&caller(), config("a-cfg", "a"));
    let (service, _) = build(fast_settings(), store_providers, configs);
    let err = service
        .compare(request(&[]), &caller(), DispatchMode::Synchronous)
        .await
        .unwrap_err();
    assert!(matches!(err, FanoutError::InvalidRequest(_)));
}

#[tokio::test]
async fn unknown_operation_is_not_found() {
    let (service, _) = build(fast_settings(), Vec::new(), InMemoryConfigStore::new());
    let id = OperationId::generate();

    assert!(matches!(
        service.get_operation(id).await,
        Err(FanoutError::OperationNotFound(missing)) if missing == id
    ));
    assert!(matches!(
        service.cancel(id).await,
        Err(FanoutError::OperationNotFound(_))
    ));
}
