//! End-to-end runs against the fake provider and the in-memory store
//!
//! These exercise the whole pipeline: plan compilation, distribution,
//! fleet lifecycle, aggregation, grading, and cleanup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use stampede_core::analyzer::Category;
use stampede_core::manager::WorkerState;
use stampede_core::orchestrator::OrchestratorBuilder;
use stampede_core::outcome::RunStatus;
use stampede_core::plan::{PlanConfig, TestKind};
use stampede_core::settings::RunSettings;
use stampede_core::traits::{BlobStore, ContainerProvider};
use stampede_providers::{FakeProvider, WorkerScript};
use stampede_storage::MemoryBlobStore;

const NAMESPACE: &str = "results";

fn fast_settings() -> RunSettings {
    RunSettings {
        provision_timeout: Duration::from_millis(500),
        completion_grace: Duration::from_millis(500),
        teardown_grace: Duration::from_millis(500),
        provider_call_timeout: Duration::from_millis(250),
        poll_initial: Duration::from_millis(5),
        poll_max: Duration::from_millis(10),
        retry_backoff: Duration::from_millis(5),
        ..RunSettings::default()
    }
}

fn plan_config(total_vus: u32, per_worker_vus: u32, duration: &str) -> PlanConfig {
    PlanConfig {
        target_url: "https://example.com".to_string(),
        test_kind: TestKind::Protocol,
        total_vus,
        duration: duration.to_string(),
        per_worker_vus,
        worker_resources: None,
        worker_image: "registry.example.com/k6-worker:latest".to_string(),
        blob_namespace: NAMESPACE.to_string(),
        env_overrides: HashMap::new(),
    }
}

fn duration_samples(count: usize, low: f64, high: f64) -> Vec<(String, f64)> {
    (0..count)
        .map(|i| {
            (
                "http_req_duration".to_string(),
                low + i as f64 * ((high - low) / (count as f64 - 1.0)),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_two_workers_full_run_is_ok() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let provider = Arc::new(
        FakeProvider::new(Arc::clone(&blobs) as Arc<dyn BlobStore>)
            .with_default_script(WorkerScript::succeeding(duration_samples(
                300, 100.0, 400.0,
            ))),
    );
    let (orchestrator, mut events_rx) = OrchestratorBuilder::new()
        .provider(Arc::clone(&provider) as Arc<dyn ContainerProvider>)
        .blobs(Arc::clone(&blobs) as Arc<dyn BlobStore>)
        .settings(fast_settings())
        .build()
        .expect("build orchestrator");
    tokio::spawn(async move { while events_rx.recv().await.is_some() {} });

    let outcome = orchestrator
        .run(&plan_config(10, 5, "1m"))
        .await
        .expect("run completes");

    assert_eq!(outcome.status, RunStatus::Ok);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.workers.len(), 2);
    assert!(outcome
        .workers
        .iter()
        .all(|w| w.state == WorkerState::Succeeded));

    let stats = outcome
        .report
        .summary
        .metric("http_req_duration")
        .expect("metric merged");
    assert_eq!(stats.count, 600);
    assert_eq!(stats.min, 100.0);
    assert_eq!(stats.max, 400.0);
    assert!((stats.mean - 250.0).abs() < 1.0);
    assert!((stats.percentiles.p95 - 385.0).abs() < 2.0);
    assert_eq!(format!("{:?}", outcome.report.grade), "A");
    assert!(!outcome
        .report
        .findings
        .iter()
        .any(|f| f.category == Category::ServerProcessing));

    // Orchestrator outputs all landed in the namespace.
    for blob in [
        "aggregated_summary.json",
        "manifest.json",
        "performance_report.json",
    ] {
        let name = format!("{}/{blob}", outcome.run_id);
        assert!(
            blobs.exists(NAMESPACE, &name).await.expect("exists"),
            "missing {name}"
        );
    }

    // No container group survives the run.
    assert!(provider.live_groups().is_empty());
}

#[tokio::test]
async fn test_one_worker_dropout_degrades_the_run() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let provider = Arc::new(
        FakeProvider::new(Arc::clone(&blobs) as Arc<dyn BlobStore>)
            .with_default_script(WorkerScript::succeeding(vec![
                ("http_req_duration".to_string(), 1500.0);
                150
            ]))
            .script_worker(2, WorkerScript::failing_to_start()),
    );
    let (orchestrator, mut events_rx) = OrchestratorBuilder::new()
        .provider(Arc::clone(&provider) as Arc<dyn ContainerProvider>)
        .blobs(Arc::clone(&blobs) as Arc<dyn BlobStore>)
        .settings(fast_settings())
        .build()
        .expect("build orchestrator");
    tokio::spawn(async move { while events_rx.recv().await.is_some() {} });

    let outcome = orchestrator
        .run(&plan_config(3, 1, "30s"))
        .await
        .expect("run completes");

    assert_eq!(outcome.status, RunStatus::Degraded);
    assert_eq!(outcome.exit_code(), 2);
    assert_eq!(outcome.workers[2].state, WorkerState::FailedToStart);
    assert_eq!(outcome.report.summary.manifest.successful_workers, 2);
    assert_eq!(outcome.report.summary.manifest.worker_count, 3);
    assert!(outcome.report.summary.manifest.partial);

    // The grade is computed on the samples the surviving workers produced.
    let stats = outcome
        .report
        .summary
        .metric("http_req_duration")
        .expect("metric merged");
    assert_eq!(stats.count, 300);

    let dropout = outcome
        .report
        .findings
        .iter()
        .find(|f| f.category == Category::WorkerDropout)
        .expect("dropout finding");
    assert_eq!(format!("{:?}", dropout.severity), "Medium");

    assert!(provider.live_groups().is_empty());
}

#[tokio::test]
async fn test_cancellation_ends_every_worker_cancelled() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let provider = Arc::new(
        FakeProvider::new(Arc::clone(&blobs) as Arc<dyn BlobStore>)
            .with_default_script(WorkerScript::default().with_slow_start(100_000)),
    );
    let (orchestrator, mut events_rx) = OrchestratorBuilder::new()
        .provider(Arc::clone(&provider) as Arc<dyn ContainerProvider>)
        .blobs(Arc::clone(&blobs) as Arc<dyn BlobStore>)
        .settings(fast_settings())
        .build()
        .expect("build orchestrator");
    tokio::spawn(async move { while events_rx.recv().await.is_some() {} });

    let cancel = orchestrator.cancellation_token();
    let canceller = tokio::spawn(async move {
        sleep(Duration::from_millis(40)).await;
        cancel.cancel();
    });

    let outcome = orchestrator
        .run(&plan_config(3, 1, "30s"))
        .await
        .expect("run completes");
    canceller.await.expect("canceller");

    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(outcome.exit_code(), 4);
    assert!(outcome
        .workers
        .iter()
        .all(|w| w.state == WorkerState::Cancelled));
    // The report is still produced, with cancellation as its only finding.
    assert_eq!(outcome.report.findings.len(), 1);
    assert_eq!(outcome.report.findings[0].category, Category::Cancelled);

    assert!(provider.live_groups().is_empty());
}

#[tokio::test]
async fn test_throttled_provider_recovers_to_ok() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let provider = Arc::new(
        FakeProvider::new(Arc::clone(&blobs) as Arc<dyn BlobStore>)
            .with_default_script(WorkerScript::succeeding(duration_samples(50, 80.0, 120.0)))
            .script_worker(
                1,
                WorkerScript::succeeding(duration_samples(50, 80.0, 120.0))
                    .with_throttled_creates(1),
            ),
    );
    let (orchestrator, mut events_rx) = OrchestratorBuilder::new()
        .provider(Arc::clone(&provider) as Arc<dyn ContainerProvider>)
        .blobs(Arc::clone(&blobs) as Arc<dyn BlobStore>)
        .settings(fast_settings())
        .build()
        .expect("build orchestrator");
    tokio::spawn(async move { while events_rx.recv().await.is_some() {} });

    let outcome = orchestrator
        .run(&plan_config(4, 2, "30s"))
        .await
        .expect("run completes");

    assert_eq!(outcome.status, RunStatus::Ok);
    assert_eq!(outcome.exit_code(), 0);
    // Worker 1 needed one extra create call; the retry is invisible in
    // the outcome.
    assert_eq!(provider.create_calls(), 3);
    assert!(outcome.orchestrator_error.is_none());
}

#[tokio::test]
async fn test_every_worker_failing_to_start_fails_the_run() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let provider = Arc::new(
        FakeProvider::new(Arc::clone(&blobs) as Arc<dyn BlobStore>)
            .with_default_script(WorkerScript::failing_to_start()),
    );
    let (orchestrator, mut events_rx) = OrchestratorBuilder::new()
        .provider(Arc::clone(&provider) as Arc<dyn ContainerProvider>)
        .blobs(Arc::clone(&blobs) as Arc<dyn BlobStore>)
        .settings(fast_settings())
        .build()
        .expect("build orchestrator");
    tokio::spawn(async move { while events_rx.recv().await.is_some() {} });

    let outcome = orchestrator
        .run(&plan_config(4, 2, "30s"))
        .await
        .expect("run completes");

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(outcome.report.summary.total_samples(), 0);
    assert_eq!(format!("{:?}", outcome.report.grade), "F");
    assert_eq!(outcome.report.findings.len(), 1);
    assert_eq!(
        outcome.report.findings[0].category,
        Category::NoSuccessfulWorkers
    );
}
