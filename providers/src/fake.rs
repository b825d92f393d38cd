//! Deterministic fake provider for tests and dry runs
//!
//! Advances one scripted state machine per container group on every
//! `status` call, entirely in process. On termination it plays the part
//! of the worker too, publishing the summary stream and completion
//! marker to the blob store so a full run can execute end to end with no
//! cloud at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use stampede_core::aggregator::{PointData, SummaryRecord};
use stampede_core::traits::{
    BlobStore, ContainerProvider, ContainerSpec, ContainerState, ContainerStatus, ProviderError,
};

/// Scripted behavior for one worker under the fake provider
#[derive(Debug, Clone)]
pub struct WorkerScript {
    /// Create calls rejected with `Throttled` before the first acceptance
    pub throttled_creates: u32,
    /// Reject every create outright
    pub fail_create: bool,
    /// Status polls before the container reports running
    pub polls_to_running: u32,
    /// Status polls, after running, before the container terminates
    pub polls_while_running: u32,
    /// Exit code reported on termination
    pub exit_code: i32,
    /// Samples the worker publishes on termination: (metric, value)
    pub samples: Vec<(String, f64)>,
}

impl Default for WorkerScript {
    fn default() -> Self {
        Self {
            throttled_creates: 0,
            fail_create: false,
            polls_to_running: 1,
            polls_while_running: 1,
            exit_code: 0,
            samples: Vec::new(),
        }
    }
}

impl WorkerScript {
    /// Script that starts, publishes `samples`, and exits cleanly
    pub fn succeeding(samples: Vec<(String, f64)>) -> Self {
        Self {
            samples,
            ..Self::default()
        }
    }

    /// Script that never gets a container created
    pub fn failing_to_start() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    /// Script that runs and exits with `exit_code`
    pub fn exiting(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }

    /// Keep the container in provisioning for `polls` status calls
    pub fn with_slow_start(mut self, polls: u32) -> Self {
        self.polls_to_running = polls;
        self
    }

    /// Throttle the first `count` create calls
    pub fn with_throttled_creates(mut self, count: u32) -> Self {
        self.throttled_creates = count;
        self
    }
}

struct Instance {
    script: WorkerScript,
    env: HashMap<String, String>,
    polls: u32,
    deleted: bool,
    output_published: bool,
}

#[derive(Default)]
struct FakeInner {
    instances: HashMap<String, Instance>,
    create_attempts: HashMap<u32, u32>,
    deletes: Vec<String>,
}

/// In-process provider that advances a deterministic state machine
pub struct FakeProvider {
    blobs: Arc<dyn BlobStore>,
    scripts: HashMap<u32, WorkerScript>,
    default_script: WorkerScript,
    inner: Mutex<FakeInner>,
    create_calls: AtomicUsize,
}

impl FakeProvider {
    /// Create a fake provider publishing worker output into `blobs`
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            scripts: HashMap::new(),
            default_script: WorkerScript::default(),
            inner: Mutex::new(FakeInner::default()),
            create_calls: AtomicUsize::new(0),
        }
    }

    /// Override the script for one worker index
    pub fn script_worker(mut self, index: u32, script: WorkerScript) -> Self {
        self.scripts.insert(index, script);
        self
    }

    /// Script applied to workers without an override
    pub fn with_default_script(mut self, script: WorkerScript) -> Self {
        self.default_script = script;
        self
    }

    /// Total create calls observed, including throttled ones
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Provider ids that received a delete
    pub fn deletes(&self) -> Vec<String> {
        self.inner.lock().expect("fake lock").deletes.clone()
    }

    /// Groups created and not yet deleted
    pub fn live_groups(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("fake lock")
            .instances
            .iter()
            .filter(|(_, instance)| !instance.deleted)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn script_for(&self, index: u32) -> WorkerScript {
        self.scripts
            .get(&index)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone())
    }

    /// Publish the blobs a real worker would have written on exit
    async fn publish_output(&self, env: &HashMap<String, String>, script: &WorkerScript) {
        let (Some(run_id), Some(namespace), Some(index)) = (
            env.get("RUN_ID"),
            env.get("BLOB_NAMESPACE"),
            env.get("WORKER_INDEX"),
        ) else {
            tracing::warn!("worker environment incomplete, skipping fake output");
            return;
        };
        let worker_index: u32 = index.parse().unwrap_or(0);
        let vus_used: u32 = env.get("VUS").and_then(|v| v.parse().ok()).unwrap_or(1);

        // Fixed epoch-based timestamps keep runs reproducible.
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).expect("valid epoch");
        let mut lines = Vec::with_capacity(script.samples.len() + 1);
        for (offset, (metric, value)) in script.samples.iter().enumerate() {
            let record = SummaryRecord::Point {
                metric: metric.clone(),
                data: PointData {
                    time: base + chrono::Duration::milliseconds(offset as i64 * 10),
                    value: *value,
                    tags: HashMap::new(),
                },
            };
            lines.push(serde_json::to_string(&record).expect("encode point"));
        }
        lines.push(
            serde_json::to_string(&SummaryRecord::Completion {
                worker_index,
                vus_used,
                iterations: script.samples.len() as u64,
                wall_clock_ms: 1_000,
                exit_code: script.exit_code,
            })
            .expect("encode completion"),
        );

        let summary_name = format!("{run_id}/summary_{worker_index}.json");
        if let Err(e) = self
            .blobs
            .put(namespace, &summary_name, lines.join("\n").as_bytes())
            .await
        {
            tracing::warn!(error = %e, blob = %summary_name, "fake worker could not publish summary");
        }

        if script.exit_code == 0 {
            let marker_name = format!("{run_id}/completion_{worker_index}.txt");
            if let Err(e) = self.blobs.put(namespace, &marker_name, b"completed").await {
                tracing::warn!(error = %e, blob = %marker_name, "fake worker could not publish marker");
            }
        }
    }
}

#[async_trait]
impl ContainerProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let index: u32 = spec
            .env
            .get("WORKER_INDEX")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ProviderError::Fatal("spec is missing WORKER_INDEX".into()))?;
        let script = self.script_for(index);

        let mut inner = self.inner.lock().expect("fake lock");
        let attempts = inner.create_attempts.entry(index).or_insert(0);
        *attempts += 1;
        if *attempts <= script.throttled_creates {
            return Err(ProviderError::Throttled { retry_after: None });
        }
        if script.fail_create {
            return Err(ProviderError::Fatal("scripted create rejection".into()));
        }

        inner.instances.insert(
            spec.group_name.clone(),
            Instance {
                script,
                env: spec.env.clone(),
                polls: 0,
                deleted: false,
                output_published: false,
            },
        );
        Ok(spec.group_name.clone())
    }

    async fn status(&self, provider_id: &str) -> Result<ContainerStatus, ProviderError> {
        // Decide the transition under the lock, publish outside it.
        let (status, publish) = {
            let mut inner = self.inner.lock().expect("fake lock");
            let Some(instance) = inner.instances.get_mut(provider_id) else {
                return Ok(ContainerStatus::unknown());
            };
            if instance.deleted {
                return Ok(ContainerStatus::unknown());
            }
            instance.polls += 1;
            let script = instance.script.clone();
            if instance.polls <= script.polls_to_running {
                (ContainerStatus::unknown(), None)
            } else if instance.polls <= script.polls_to_running + script.polls_while_running {
                (
                    ContainerStatus {
                        state: ContainerState::Running,
                        exit_code: None,
                    },
                    None,
                )
            } else {
                let publish = if instance.output_published {
                    None
                } else {
                    instance.output_published = true;
                    Some((instance.env.clone(), script.clone()))
                };
                (
                    ContainerStatus {
                        state: ContainerState::Terminated,
                        exit_code: Some(script.exit_code),
                    },
                    publish,
                )
            }
        };

        if let Some((env, script)) = publish {
            self.publish_output(&env, &script).await;
        }
        Ok(status)
    }

    async fn delete(&self, provider_id: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().expect("fake lock");
        inner.deletes.push(provider_id.to_string());
        if let Some(instance) = inner.instances.get_mut(provider_id) {
            instance.deleted = true;
        }
        Ok(())
    }

    async fn logs(&self, provider_id: &str) -> Result<Vec<u8>, ProviderError> {
        let inner = self.inner.lock().expect("fake lock");
        let Some(instance) = inner.instances.get(provider_id) else {
            return Ok(Vec::new());
        };
        Ok(format!(
            "fake worker {} finished with exit code {}\n",
            provider_id, instance.script.exit_code
        )
        .into_bytes())
    }
}
