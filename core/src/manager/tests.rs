//! Tests for the container manager

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::distribute::distribute;
use crate::plan::{self, PlanConfig, RunPlan, TestKind};
use crate::settings::RunSettings;
use crate::testutil::{ScriptedProvider, TestBlobStore, WorkerScript};

use super::{ContainerManager, WorkerEvent, WorkerState};

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

fn test_plan(run_id: &str) -> RunPlan {
    let config = PlanConfig {
        target_url: "https://example.com".to_string(),
        test_kind: TestKind::Protocol,
        total_vus: 10,
        duration: "1s".to_string(),
        per_worker_vus: 5,
        worker_resources: None,
        worker_image: "registry.example.com/k6-worker:latest".to_string(),
        blob_namespace: NAMESPACE.to_string(),
        env_overrides: HashMap::new(),
    };
    plan::compile_with_run_id(&config, run_id.to_string()).expect("valid plan")
}

struct Harness {
    provider: Arc<ScriptedProvider>,
    blobs: Arc<TestBlobStore>,
    manager: ContainerManager,
    events_rx: mpsc::Receiver<WorkerEvent>,
}

fn harness(provider: ScriptedProvider) -> Harness {
    let provider = Arc::new(provider);
    let blobs = Arc::new(TestBlobStore::new());
    let (events_tx, events_rx) = mpsc::channel(64);
    let manager = ContainerManager::new(
        Arc::clone(&provider) as Arc<dyn crate::traits::ContainerProvider>,
        Arc::clone(&blobs) as Arc<dyn crate::traits::BlobStore>,
        fast_settings(),
        events_tx,
    );
    Harness {
        provider,
        blobs,
        manager,
        events_rx,
    }
}

fn seed_completion(blobs: &TestBlobStore, run_id: &str, index: u32) {
    blobs.seed(
        NAMESPACE,
        &format!("{run_id}/completion_{index}.txt"),
        b"completed",
    );
}

fn drain_events(rx: &mut mpsc::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_all_workers_succeed_and_are_cleaned_up() {
    let mut h = harness(ScriptedProvider::new());
    let plan = test_plan("run-mgr-ok");
    seed_completion(&h.blobs, &plan.run_id, 0);
    seed_completion(&h.blobs, &plan.run_id, 1);

    let assignments = distribute(10, 5).expect("valid split");
    let handles = h
        .manager
        .run(&plan, &assignments, CancellationToken::new())
        .await;

    assert_eq!(handles.len(), 2);
    for (index, handle) in handles.iter().enumerate() {
        assert_eq!(handle.worker_index, index as u32);
        assert_eq!(handle.state, WorkerState::Succeeded);
        assert_eq!(handle.exit_code, Some(0));
        assert!(handle.provider_id.is_some());
    }

    // Every created group must be gone before run returns.
    assert!(h.provider.live_groups().is_empty());
    assert_eq!(h.provider.deletes().len(), 2);

    let events = drain_events(&mut h.events_rx);
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.state == WorkerState::Succeeded));
}

#[tokio::test]
async fn test_clean_exit_without_marker_is_failure() {
    let mut h = harness(ScriptedProvider::new());
    let plan = test_plan("run-mgr-nomarker");

    let assignments = distribute(5, 5).expect("valid split");
    let handles = h
        .manager
        .run(&plan, &assignments, CancellationToken::new())
        .await;

    assert_eq!(handles[0].state, WorkerState::Failed);
    assert_eq!(drain_events(&mut h.events_rx).len(), 1);
}

#[tokio::test]
async fn test_nonzero_exit_is_failure() {
    let script = WorkerScript {
        exit_code: Some(17),
        ..WorkerScript::default()
    };
    let mut h = harness(ScriptedProvider::new().script_worker(0, script));
    let plan = test_plan("run-mgr-exit17");
    seed_completion(&h.blobs, &plan.run_id, 0);

    let assignments = distribute(5, 5).expect("valid split");
    let handles = h
        .manager
        .run(&plan, &assignments, CancellationToken::new())
        .await;

    assert_eq!(handles[0].state, WorkerState::Failed);
    assert_eq!(handles[0].exit_code, Some(17));
    assert!(h.provider.live_groups().is_empty());
    drop(drain_events(&mut h.events_rx));
}

#[tokio::test]
async fn test_create_rejection_is_failed_to_start() {
    let script = WorkerScript {
        fail_create: true,
        ..WorkerScript::default()
    };
    let h = harness(ScriptedProvider::new().script_worker(1, script));
    let plan = test_plan("run-mgr-badcreate");
    seed_completion(&h.blobs, &plan.run_id, 0);

    let assignments = distribute(10, 5).expect("valid split");
    let handles = h
        .manager
        .run(&plan, &assignments, CancellationToken::new())
        .await;

    assert_eq!(handles[0].state, WorkerState::Succeeded);
    assert_eq!(handles[1].state, WorkerState::FailedToStart);
    assert!(handles[1].provider_id.is_none());
}

#[tokio::test]
async fn test_throttled_create_is_retried_to_success() {
    let script = WorkerScript {
        throttled_creates: 2,
        ..WorkerScript::default()
    };
    let h = harness(ScriptedProvider::new().script_worker(0, script));
    let plan = test_plan("run-mgr-throttle");
    seed_completion(&h.blobs, &plan.run_id, 0);

    let assignments = distribute(5, 5).expect("valid split");
    let handles = h
        .manager
        .run(&plan, &assignments, CancellationToken::new())
        .await;

    assert_eq!(handles[0].state, WorkerState::Succeeded);
    // Two throttled attempts plus the accepted one.
    assert_eq!(h.provider.create_calls(), 3);
}

#[tokio::test]
async fn test_throttling_beyond_retry_budget_fails_start() {
    let script = WorkerScript {
        throttled_creates: 10,
        ..WorkerScript::default()
    };
    let h = harness(ScriptedProvider::new().script_worker(0, script));
    let plan = test_plan("run-mgr-throttle-hard");

    let assignments = distribute(5, 5).expect("valid split");
    let handles = h
        .manager
        .run(&plan, &assignments, CancellationToken::new())
        .await;

    assert_eq!(handles[0].state, WorkerState::FailedToStart);
    // Initial attempt plus three retries.
    assert_eq!(h.provider.create_calls(), 4);
}

#[tokio::test]
async fn test_provision_timeout_fails_start() {
    let script = WorkerScript {
        polls_to_running: 100_000,
        ..WorkerScript::default()
    };
    let h = harness(ScriptedProvider::new().script_worker(0, script));
    let plan = test_plan("run-mgr-stuck");

    let assignments = distribute(5, 5).expect("valid split");
    let handles = h
        .manager
        .run(&plan, &assignments, CancellationToken::new())
        .await;

    assert_eq!(handles[0].state, WorkerState::FailedToStart);
    // The stuck group was still created, so it must still be deleted.
    assert!(h.provider.live_groups().is_empty());
}

#[tokio::test]
async fn test_cancellation_tears_everything_down() {
    let script = WorkerScript {
        polls_to_running: 100_000,
        ..WorkerScript::default()
    };
    let h = harness(ScriptedProvider::new().with_default_script(script));
    let plan = test_plan("run-mgr-cancel");

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        })
    };

    let assignments = distribute(15, 5).expect("valid split");
    let handles = h.manager.run(&plan, &assignments, cancel).await;
    canceller.await.expect("canceller");

    assert_eq!(handles.len(), 3);
    assert!(handles.iter().all(|h| h.state == WorkerState::Cancelled));
    assert!(h.provider.live_groups().is_empty());
}

#[tokio::test]
async fn test_terminal_events_arrive_in_completion_order() {
    let slow = WorkerScript {
        polls_while_running: 12,
        ..WorkerScript::default()
    };
    let mut h = harness(ScriptedProvider::new().script_worker(0, slow));
    let plan = test_plan("run-mgr-order");
    seed_completion(&h.blobs, &plan.run_id, 0);
    seed_completion(&h.blobs, &plan.run_id, 1);

    let assignments = distribute(10, 5).expect("valid split");
    let handles = h
        .manager
        .run(&plan, &assignments, CancellationToken::new())
        .await;

    assert!(handles.iter().all(|h| h.state == WorkerState::Succeeded));
    let events = drain_events(&mut h.events_rx);
    assert_eq!(events.len(), 2);
    // Worker 1 finishes well before the slow worker 0.
    assert_eq!(events[0].worker_index, 1);
    assert_eq!(events[1].worker_index, 0);
}

#[tokio::test]
async fn test_worker_env_contract() {
    let h = harness(ScriptedProvider::new());
    let mut plan = test_plan("run-mgr-env");
    plan.env_overrides
        .insert("EXTRA_FLAG".to_string(), "on".to_string());
    seed_completion(&h.blobs, &plan.run_id, 0);
    seed_completion(&h.blobs, &plan.run_id, 1);
    seed_completion(&h.blobs, &plan.run_id, 2);

    let assignments = distribute(5, 2).expect("valid split");
    let handles = h
        .manager
        .run(&plan, &assignments, CancellationToken::new())
        .await;

    assert_eq!(handles.len(), 3);
    let group = handles[2].provider_id.as_deref().expect("provider id");
    assert_eq!(group, "run-mgr-env-worker-2");
    // The last worker absorbs the remainder slice.
    let env = h.provider.spec_env(group).expect("captured env");
    assert_eq!(env.get("WORKER_INDEX").map(String::as_str), Some("2"));
    assert_eq!(env.get("WORKER_COUNT").map(String::as_str), Some("3"));
    assert_eq!(env.get("TOTAL_VUS").map(String::as_str), Some("5"));
    assert_eq!(env.get("VUS").map(String::as_str), Some("1"));
    assert_eq!(env.get("DURATION").map(String::as_str), Some("1s"));
    assert_eq!(env.get("RUN_ID").map(String::as_str), Some("run-mgr-env"));
    assert_eq!(env.get("TEST_TYPE").map(String::as_str), Some("protocol"));
    assert_eq!(
        env.get("TARGET_URL").map(String::as_str),
        Some("https://example.com")
    );
    assert_eq!(
        env.get("BLOB_NAMESPACE").map(String::as_str),
        Some(NAMESPACE)
    );
    assert_eq!(env.get("EXTRA_FLAG").map(String::as_str), Some("on"));
}
