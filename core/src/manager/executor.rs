//! Worker lifecycle execution

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::distribute::WorkerAssignment;
use crate::plan::RunPlan;
use crate::settings::RunSettings;
use crate::traits::{
    BlobStore, ContainerProvider, ContainerSpec, ContainerState, ContainerStatus, ProviderError,
};

use super::handle::{WorkerEvent, WorkerHandle, WorkerState};

/// Drives every worker of a run through its lifecycle
///
/// Provisioning is issued for all workers concurrently behind a bounded
/// gate. Each worker is polled independently, preferring the completion
/// marker blob over provider state. Terminal events are emitted in
/// completion order, and every container group created here is deleted
/// (best effort) before `run` returns.
pub struct ContainerManager {
    provider: Arc<dyn ContainerProvider>,
    blobs: Arc<dyn BlobStore>,
    settings: RunSettings,
    events_tx: mpsc::Sender<WorkerEvent>,
    create_gate: Arc<Semaphore>,
}

impl ContainerManager {
    /// Create a new manager
    pub fn new(
        provider: Arc<dyn ContainerProvider>,
        blobs: Arc<dyn BlobStore>,
        settings: RunSettings,
        events_tx: mpsc::Sender<WorkerEvent>,
    ) -> Self {
        let create_gate = Arc::new(Semaphore::new(settings.create_concurrency));
        Self {
            provider,
            blobs,
            settings,
            events_tx,
            create_gate,
        }
    }

    /// Run all workers to a terminal state
    ///
    /// Returns one handle per assignment, ordered by worker index. Each
    /// handle is in exactly one terminal state when this returns.
    pub async fn run(
        &self,
        plan: &RunPlan,
        assignments: &[WorkerAssignment],
        cancel: CancellationToken,
    ) -> Vec<WorkerHandle> {
        tracing::info!(
            run_id = %plan.run_id,
            workers = assignments.len(),
            provider = self.provider.name(),
            "provisioning worker fleet"
        );

        let mut tasks = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let runner = WorkerRunner {
                provider: Arc::clone(&self.provider),
                blobs: Arc::clone(&self.blobs),
                settings: self.settings.clone(),
                plan: plan.clone(),
                assignment: *assignment,
                events_tx: self.events_tx.clone(),
                create_gate: Arc::clone(&self.create_gate),
                cancel: cancel.clone(),
            };
            tasks.push(tokio::spawn(runner.run()));
        }

        let mut handles = Vec::with_capacity(tasks.len());
        for (index, task) in tasks.into_iter().enumerate() {
            match task.await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    tracing::error!(worker_index = index, error = %e, "worker driver panicked");
                    let mut handle = WorkerHandle::new(index as u32);
                    handle.transition(WorkerState::Failed);
                    handles.push(handle);
                }
            }
        }
        handles.sort_by_key(|h| h.worker_index);

        let succeeded = handles
            .iter()
            .filter(|h| h.state == WorkerState::Succeeded)
            .count();
        tracing::info!(
            run_id = %plan.run_id,
            succeeded,
            total = handles.len(),
            "all workers terminal"
        );
        handles
    }
}

/// Outcome of the create phase
enum CreateOutcome {
    Created(String),
    Cancelled,
    Failed,
}

/// Outcome of waiting for the container to start
enum StartOutcome {
    Running,
    Terminated(Option<i32>),
    Cancelled,
    TimedOut,
    Failed,
}

/// Per-worker lifecycle driver; one tokio task each
struct WorkerRunner {
    provider: Arc<dyn ContainerProvider>,
    blobs: Arc<dyn BlobStore>,
    settings: RunSettings,
    plan: RunPlan,
    assignment: WorkerAssignment,
    events_tx: mpsc::Sender<WorkerEvent>,
    create_gate: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl WorkerRunner {
    async fn run(self) -> WorkerHandle {
        let mut handle = WorkerHandle::new(self.assignment.worker_index);
        let terminal = self.drive(&mut handle).await;
        handle.transition(terminal);

        if let Some(provider_id) = handle.provider_id.clone() {
            if timeout(self.settings.teardown_grace, self.teardown(&provider_id))
                .await
                .is_err()
            {
                tracing::warn!(
                    worker_index = self.assignment.worker_index,
                    "teardown did not finish within the grace period"
                );
            }
        }

        self.emit(&handle).await;
        handle
    }

    /// Walk the lifecycle state machine to a terminal state
    async fn drive(&self, handle: &mut WorkerHandle) -> WorkerState {
        let worker_index = self.assignment.worker_index;

        if self.cancel.is_cancelled() {
            return WorkerState::Cancelled;
        }

        // Queue FIFO behind the bounded create gate before touching the provider.
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return WorkerState::Cancelled,
            permit = self.create_gate.acquire() => permit,
        };
        let permit = match permit {
            Ok(permit) => permit,
            Err(_) => return WorkerState::Cancelled,
        };

        handle.transition(WorkerState::Provisioning);
        let provider_id = match self.create_with_retry().await {
            CreateOutcome::Created(id) => id,
            CreateOutcome::Cancelled => return WorkerState::Cancelled,
            CreateOutcome::Failed => return WorkerState::FailedToStart,
        };
        handle.provider_id = Some(provider_id.clone());
        drop(permit);

        match self.await_started(&provider_id).await {
            StartOutcome::Running => handle.transition(WorkerState::Running),
            StartOutcome::Terminated(exit_code) => {
                // Short tests can finish before the first poll ever sees running.
                handle.exit_code = exit_code;
                return self.classify_exit(&provider_id, exit_code).await;
            }
            StartOutcome::Cancelled => return WorkerState::Cancelled,
            StartOutcome::TimedOut => {
                tracing::error!(
                    worker_index,
                    "worker did not reach running within the provision timeout"
                );
                return WorkerState::FailedToStart;
            }
            StartOutcome::Failed => return WorkerState::FailedToStart,
        }

        self.await_completion(&provider_id, handle).await
    }

    /// Issue the create call, retrying retryable errors with 2/4/8s back-off
    async fn create_with_retry(&self) -> CreateOutcome {
        let worker_index = self.assignment.worker_index;
        let spec = self.container_spec();
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return CreateOutcome::Cancelled,
                result = self.call_create(&spec) => result,
            };
            match result {
                Ok(provider_id) => {
                    tracing::info!(
                        worker_index,
                        group = %spec.group_name,
                        vus = self.assignment.vus,
                        "worker container created"
                    );
                    return CreateOutcome::Created(provider_id);
                }
                Err(e) if e.is_retryable() && attempt < self.settings.create_retries => {
                    let delay = e
                        .retry_after()
                        .unwrap_or_else(|| self.settings.retry_delay(attempt));
                    tracing::warn!(
                        worker_index,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "create failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return CreateOutcome::Cancelled,
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(worker_index, error = %e, "worker failed to start");
                    return CreateOutcome::Failed;
                }
            }
        }
    }

    /// Poll until the provider reports running, with exponential back-off
    async fn await_started(&self, provider_id: &str) -> StartOutcome {
        let worker_index = self.assignment.worker_index;
        let deadline = Instant::now() + self.settings.provision_timeout;
        let mut delay = self.settings.poll_initial;
        loop {
            if self.cancel.is_cancelled() {
                return StartOutcome::Cancelled;
            }
            match self.call_status(provider_id).await {
                Ok(status) => match status.state {
                    ContainerState::Running => return StartOutcome::Running,
                    ContainerState::Terminated => return StartOutcome::Terminated(status.exit_code),
                    ContainerState::Unknown => {}
                },
                Err(e) if e.is_retryable() => {
                    tracing::debug!(worker_index, error = %e, "status poll failed, will retry");
                }
                Err(e) => {
                    tracing::error!(worker_index, error = %e, "provider rejected status poll");
                    return StartOutcome::Failed;
                }
            }
            if Instant::now() >= deadline {
                return StartOutcome::TimedOut;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StartOutcome::Cancelled,
                _ = sleep(delay) => {}
            }
            delay = (delay * 2).min(self.settings.poll_max);
        }
    }

    /// Wait for the worker to finish, preferring the completion marker blob
    async fn await_completion(
        &self,
        provider_id: &str,
        handle: &mut WorkerHandle,
    ) -> WorkerState {
        let worker_index = self.assignment.worker_index;
        let deadline = Instant::now() + self.settings.completion_timeout(self.plan.duration);
        let mut delay = self.settings.poll_initial;
        let mut marker_seen = false;
        loop {
            if self.cancel.is_cancelled() {
                return WorkerState::Cancelled;
            }

            if !marker_seen {
                marker_seen = self.completion_marker_present().await;
                if marker_seen {
                    tracing::debug!(worker_index, "completion marker observed");
                }
            }

            match self.call_status(provider_id).await {
                Ok(ContainerStatus {
                    state: ContainerState::Terminated,
                    exit_code,
                }) => {
                    handle.exit_code = exit_code;
                    return self.classify_exit(provider_id, exit_code).await;
                }
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    tracing::debug!(worker_index, error = %e, "status poll failed, will retry");
                }
                Err(e) => {
                    tracing::error!(worker_index, error = %e, "provider rejected status poll");
                    self.log_failure_tail(provider_id).await;
                    return WorkerState::Failed;
                }
            }

            if Instant::now() >= deadline {
                tracing::error!(
                    worker_index,
                    "worker did not complete within the completion timeout"
                );
                self.log_failure_tail(provider_id).await;
                return WorkerState::Failed;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return WorkerState::Cancelled,
                _ = sleep(delay) => {}
            }
            delay = (delay * 2).min(self.settings.poll_max);
        }
    }

    /// Terminal classification: success needs a clean exit and the marker
    async fn classify_exit(&self, provider_id: &str, exit_code: Option<i32>) -> WorkerState {
        if exit_code == Some(0) && self.completion_marker_present().await {
            tracing::info!(
                worker_index = self.assignment.worker_index,
                "worker completed successfully"
            );
            return WorkerState::Succeeded;
        }
        tracing::error!(
            worker_index = self.assignment.worker_index,
            exit_code,
            "worker failed"
        );
        self.log_failure_tail(provider_id).await;
        WorkerState::Failed
    }

    /// Whether the worker has published its completion marker (or, as a
    /// fallback, its summary stream)
    async fn completion_marker_present(&self) -> bool {
        let index = self.assignment.worker_index;
        let names = [
            format!("{}/completion_{}.txt", self.plan.run_id, index),
            format!("{}/summary_{}.json", self.plan.run_id, index),
        ];
        for name in names {
            match self.blobs.exists(&self.plan.blob_namespace, &name).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(worker_index = index, blob = %name, error = %e, "completion probe failed");
                }
            }
        }
        false
    }

    /// Best-effort deletion with 2/4/8s back-off; failures are logged only
    async fn teardown(&self, provider_id: &str) {
        let worker_index = self.assignment.worker_index;
        let mut attempt = 0u32;
        loop {
            match self.call_delete(provider_id).await {
                Ok(()) => {
                    tracing::info!(worker_index, "worker container deleted");
                    return;
                }
                Err(e) if e.is_retryable() && attempt < self.settings.delete_retries => {
                    tracing::warn!(worker_index, attempt, error = %e, "delete failed, retrying");
                    sleep(self.settings.retry_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(worker_index, error = %e, "giving up deleting worker container");
                    return;
                }
            }
        }
    }

    /// Pull the tail of the worker log after a failure, best effort
    async fn log_failure_tail(&self, provider_id: &str) {
        match self.call_logs(provider_id).await {
            Ok(bytes) if !bytes.is_empty() => {
                let text = String::from_utf8_lossy(&bytes);
                let mut tail: Vec<&str> = text.lines().rev().take(20).collect();
                tail.reverse();
                tracing::warn!(
                    worker_index = self.assignment.worker_index,
                    log_tail = %tail.join("\n"),
                    "worker log tail"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(
                    worker_index = self.assignment.worker_index,
                    error = %e,
                    "could not fetch worker logs"
                );
            }
        }
    }

    /// Emit the terminal event; the channel may already be closed on late
    /// arrivals, which is fine
    async fn emit(&self, handle: &WorkerHandle) {
        let event = WorkerEvent {
            worker_index: handle.worker_index,
            state: handle.state,
            exit_code: handle.exit_code,
            at: handle.last_observed_at,
        };
        if self.events_tx.send(event).await.is_err() {
            tracing::debug!(
                worker_index = handle.worker_index,
                "event channel closed before terminal event"
            );
        }
    }

    /// Build the container spec, including the worker environment contract
    fn container_spec(&self) -> ContainerSpec {
        let plan = &self.plan;
        let assignment = &self.assignment;

        let mut env = HashMap::new();
        env.insert("WORKER_INDEX".into(), assignment.worker_index.to_string());
        env.insert("WORKER_COUNT".into(), assignment.worker_count.to_string());
        env.insert("TOTAL_VUS".into(), plan.total_vus.to_string());
        env.insert("VUS".into(), assignment.vus.to_string());
        env.insert("DURATION".into(), plan.duration_label.clone());
        env.insert("RUN_ID".into(), plan.run_id.clone());
        env.insert("TEST_TYPE".into(), plan.test_kind.as_str().to_string());
        env.insert("TARGET_URL".into(), plan.target_url.clone());
        env.insert("BLOB_NAMESPACE".into(), plan.blob_namespace.clone());
        for (key, value) in &plan.env_overrides {
            env.insert(key.clone(), value.clone());
        }

        ContainerSpec {
            group_name: format!("{}-worker-{}", plan.run_id, assignment.worker_index),
            image: plan.worker_image.clone(),
            env,
            cpu_cores: plan.worker_resources.cpu_cores,
            memory_gib: plan.worker_resources.memory_gib,
        }
    }

    async fn call_create(&self, spec: &ContainerSpec) -> Result<String, ProviderError> {
        match timeout(self.settings.provider_call_timeout, self.provider.create(spec)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.settings.provider_call_timeout)),
        }
    }

    async fn call_status(&self, provider_id: &str) -> Result<ContainerStatus, ProviderError> {
        match timeout(
            self.settings.provider_call_timeout,
            self.provider.status(provider_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.settings.provider_call_timeout)),
        }
    }

    async fn call_delete(&self, provider_id: &str) -> Result<(), ProviderError> {
        match timeout(
            self.settings.provider_call_timeout,
            self.provider.delete(provider_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.settings.provider_call_timeout)),
        }
    }

    async fn call_logs(&self, provider_id: &str) -> Result<Vec<u8>, ProviderError> {
        match timeout(
            self.settings.provider_call_timeout,
            self.provider.logs(provider_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.settings.provider_call_timeout)),
        }
    }
}
