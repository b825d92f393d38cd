//! Shared in-process doubles for the capability traits

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::traits::{
    BlobError, BlobStore, ContainerProvider, ContainerSpec, ContainerState, ContainerStatus,
    ProviderError,
};

// ============================================================================
// Blob store double
// ============================================================================

/// In-memory blob store with a switchable outage mode
#[derive(Default)]
pub(crate) struct TestBlobStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
    fail_puts: AtomicBool,
}

impl TestBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(namespace: &str, name: &str) -> String {
        format!("{namespace}/{name}")
    }

    /// Pre-load an object
    pub fn seed(&self, namespace: &str, name: &str, bytes: &[u8]) {
        self.objects
            .lock()
            .expect("blob lock")
            .insert(Self::key(namespace, name), bytes.to_vec());
    }

    /// Flip every operation into `Unavailable` failures
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Reject writes only; reads keep working
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Peek at stored bytes
    pub fn contents(&self, namespace: &str, name: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .expect("blob lock")
            .get(&Self::key(namespace, name))
            .cloned()
    }

    fn check_available(&self) -> Result<(), BlobError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(BlobError::Unavailable("simulated outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BlobStore for TestBlobStore {
    async fn put(&self, namespace: &str, name: &str, bytes: &[u8]) -> Result<(), BlobError> {
        self.check_available()?;
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BlobError::Unavailable("simulated write outage".into()));
        }
        self.seed(namespace, name, bytes);
        Ok(())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Vec<u8>, BlobError> {
        self.check_available()?;
        self.contents(namespace, name)
            .ok_or_else(|| BlobError::NotFound(Self::key(namespace, name)))
    }

    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<String>, BlobError> {
        self.check_available()?;
        let full_prefix = Self::key(namespace, prefix);
        let scope = format!("{namespace}/");
        Ok(self
            .objects
            .lock()
            .expect("blob lock")
            .keys()
            .filter(|k| k.starts_with(&full_prefix))
            .map(|k| k[scope.len()..].to_string())
            .collect())
    }

    async fn exists(&self, namespace: &str, name: &str) -> Result<bool, BlobError> {
        self.check_available()?;
        Ok(self.contents(namespace, name).is_some())
    }
}

// ============================================================================
// Container provider double
// ============================================================================

/// Scripted behavior for one worker under the provider double
#[derive(Debug, Clone)]
pub(crate) struct WorkerScript {
    /// Create calls rejected with `Throttled` before the first acceptance
    pub throttled_creates: u32,
    /// Reject every create outright
    pub fail_create: bool,
    /// Status polls before the container reports running
    pub polls_to_running: u32,
    /// Status polls, after running, before the container terminates
    pub polls_while_running: u32,
    /// Exit code reported on termination
    pub exit_code: Option<i32>,
}

impl Default for WorkerScript {
    fn default() -> Self {
        Self {
            throttled_creates: 0,
            fail_create: false,
            polls_to_running: 1,
            polls_while_running: 1,
            exit_code: Some(0),
        }
    }
}

struct Instance {
    script: WorkerScript,
    env: HashMap<String, String>,
    polls: u32,
    deleted: bool,
}

#[derive(Default)]
struct ProviderInner {
    instances: HashMap<String, Instance>,
    create_attempts: HashMap<u32, u32>,
    deletes: Vec<String>,
}

/// Deterministic provider that advances one state per status poll
#[derive(Default)]
pub(crate) struct ScriptedProvider {
    scripts: HashMap<u32, WorkerScript>,
    default_script: WorkerScript,
    inner: Mutex<ProviderInner>,
    create_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
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

    /// Total create calls, including throttled ones
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Provider ids that received a delete
    pub fn deletes(&self) -> Vec<String> {
        self.inner.lock().expect("provider lock").deletes.clone()
    }

    /// Groups created and not yet deleted
    pub fn live_groups(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("provider lock")
            .instances
            .iter()
            .filter(|(_, instance)| !instance.deleted)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Environment captured from the create call for a group
    pub fn spec_env(&self, provider_id: &str) -> Option<HashMap<String, String>> {
        self.inner
            .lock()
            .expect("provider lock")
            .instances
            .get(provider_id)
            .map(|instance| instance.env.clone())
    }

    fn script_for(&self, index: u32) -> WorkerScript {
        self.scripts
            .get(&index)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone())
    }

    fn worker_index(spec: &ContainerSpec) -> u32 {
        spec.env
            .get("WORKER_INDEX")
            .and_then(|v| v.parse().ok())
            .expect("container spec carries WORKER_INDEX")
    }
}

#[async_trait]
impl ContainerProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let index = Self::worker_index(spec);
        let script = self.script_for(index);

        let mut inner = self.inner.lock().expect("provider lock");
        let attempts = inner.create_attempts.entry(index).or_insert(0);
        *attempts += 1;
        if *attempts <= script.throttled_creates {
            return Err(ProviderError::Throttled { retry_after: None });
        }
        if script.fail_create {
            return Err(ProviderError::Fatal("scripted create failure".into()));
        }

        inner.instances.insert(
            spec.group_name.clone(),
            Instance {
                script,
                env: spec.env.clone(),
                polls: 0,
                deleted: false,
            },
        );
        Ok(spec.group_name.clone())
    }

    async fn status(&self, provider_id: &str) -> Result<ContainerStatus, ProviderError> {
        let mut inner = self.inner.lock().expect("provider lock");
        let Some(instance) = inner.instances.get_mut(provider_id) else {
            return Ok(ContainerStatus::unknown());
        };
        if instance.deleted {
            return Ok(ContainerStatus::unknown());
        }
        instance.polls += 1;
        let script = &instance.script;
        let status = if instance.polls <= script.polls_to_running {
            ContainerStatus::unknown()
        } else if instance.polls <= script.polls_to_running + script.polls_while_running {
            ContainerStatus {
                state: ContainerState::Running,
                exit_code: None,
            }
        } else {
            ContainerStatus {
                state: ContainerState::Terminated,
                exit_code: script.exit_code,
            }
        };
        Ok(status)
    }

    async fn delete(&self, provider_id: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().expect("provider lock");
        inner.deletes.push(provider_id.to_string());
        if let Some(instance) = inner.instances.get_mut(provider_id) {
            instance.deleted = true;
        }
        Ok(())
    }

    async fn logs(&self, provider_id: &str) -> Result<Vec<u8>, ProviderError> {
        Ok(format!("scripted log for {provider_id}\n").into_bytes())
    }
}
