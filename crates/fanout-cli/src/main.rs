use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::time::{Duration, Instant, sleep};
use tracing::info;

use fanout_core::domain::{
    CallerToken, ComparisonRequest, ProviderConfig, ProviderResponse, StudentPayload,
};
use fanout_core::impls::InMemoryConfigStore;
use fanout_core::ports::{ProviderClient, ProviderError};
use fanout_core::{AppBuilder, Dispatch, DispatchMode, FanoutSettings};

/// Scores by matching word counts; always answers.
struct WordCountProvider;

#[async_trait]
impl ProviderClient for WordCountProvider {
    async fn call(
        &self,
        config: &ProviderConfig,
        payload: &StudentPayload,
    ) -> Result<ProviderResponse, ProviderError> {
        let started = Instant::now();
        sleep(Duration::from_millis(50)).await;

        let words = |v: &serde_json::Value| v.as_str().map_or(0, |s| s.split_whitespace().count());
        let expected = words(&payload.instructor).max(1);
        let got = words(&payload.student);
        let score = (got.min(expected) as f64) / (expected as f64);

        Ok(ProviderResponse {
            model_name: config.model.clone(),
            content: serde_json::json!({ "student_id": payload.student_id, "score": score }),
            processing_time_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Fails the first `failures` calls with a communication error.
struct FlakyProvider {
    remaining_failures: AtomicU32,
}

impl FlakyProvider {
    fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl ProviderClient for FlakyProvider {
    async fn call(
        &self,
        config: &ProviderConfig,
        payload: &StudentPayload,
    ) -> Result<ProviderResponse, ProviderError> {
        sleep(Duration::from_millis(20)).await;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(ProviderError::Communication(format!(
                "connection reset (left={left})"
            )));
        }
        Ok(ProviderResponse {
            model_name: config.model.clone(),
            content: serde_json::json!({ "student_id": payload.student_id, "verdict": "similar" }),
            processing_time_ms: 20,
        })
    }

    fn can_train(&self) -> bool {
        true
    }
}

const SAMPLE_REQUEST: &str = r#"{
    "instructor": "the mitochondria is the powerhouse of the cell",
    "students": {
        "alice": "mitochondria produce energy for the cell",
        "bob": "the cell has a nucleus",
        "carol": "the mitochondria is the powerhouse of the cell"
    }
}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let settings = FanoutSettings::from_env()?;
    let caller = CallerToken::new("demo-caller");
    let configs = InMemoryConfigStore::new()
        .with_provider(
            &caller,
            ProviderConfig::new("wordcount-basic", "wordcount", "wc-1").with_api_key("local"),
        )
        .with_provider(
            &caller,
            ProviderConfig::new("flaky-large", "flaky", "flaky-xl").with_api_key("local"),
        );

    let service = AppBuilder::new()
        .register_provider("wordcount", Arc::new(WordCountProvider))?
        .register_provider("flaky", Arc::new(FlakyProvider::new(2)))?
        .expect_providers(&["wordcount", "flaky"])
        .settings(settings)
        .config_store(Arc::new(configs))
        .build()?;

    let request: ComparisonRequest = serde_json::from_str(SAMPLE_REQUEST)?;
    let dispatch = service
        .compare(request, &caller, DispatchMode::Asynchronous)
        .await?;
    let operation_id = match dispatch {
        Dispatch::Accepted(id) => id,
        Dispatch::Completed(outcome) => outcome.operation_id,
    };
    info!(%operation_id, "comparison accepted");

    let summary = loop {
        let summary = service.get_operation(operation_id).await?;
        info!(
            status = %summary.status,
            progress = %format!("{:.0}%", summary.progress * 100.0),
            "polling"
        );
        if summary.is_done() {
            break summary;
        }
        sleep(Duration::from_millis(200)).await;
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    for service_name in service.breaker().services() {
        let metrics = service.breaker().snapshot(&service_name);
        info!(
            service = %service_name,
            state = %metrics.state,
            failures = metrics.total_failures,
            successes = metrics.total_successes,
            "circuit breaker"
        );
    }
    Ok(())
}
