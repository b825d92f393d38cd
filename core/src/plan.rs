//! Test plan compilation and validation

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// Kind of load test the workers run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    /// HTTP-level test producing request/timing samples
    Protocol,
    /// Real-browser test emitting page and interaction timings as well
    Browser,
}

impl TestKind {
    /// Stable tag used in worker environment and blob payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            TestKind::Protocol => "protocol",
            TestKind::Browser => "browser",
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU and memory shape requested for each worker container
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerResources {
    /// CPU cores per worker
    pub cpu_cores: f64,
    /// Memory per worker, GiB
    pub memory_gib: f64,
}

impl WorkerResources {
    /// Default shape for a test kind (browser workers need headroom for
    /// the browser engine)
    pub fn defaults_for(kind: TestKind) -> Self {
        match kind {
            TestKind::Protocol => Self {
                cpu_cores: 1.0,
                memory_gib: 2.0,
            },
            TestKind::Browser => Self {
                cpu_cores: 2.0,
                memory_gib: 4.0,
            },
        }
    }
}

fn default_test_kind() -> TestKind {
    TestKind::Protocol
}

/// Parsed, not-yet-validated test plan as read from the plan file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    /// URL the workers load-test
    pub target_url: String,

    /// Protocol or browser test
    #[serde(default = "default_test_kind")]
    pub test_kind: TestKind,

    /// Total virtual users across the whole fleet
    pub total_vus: u32,

    /// Test duration, e.g. "2m" (digits plus one of s/m/h/d)
    pub duration: String,

    /// Virtual users one worker carries; only used to derive the fleet size
    pub per_worker_vus: u32,

    /// Per-worker resource shape; defaults by test kind when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_resources: Option<WorkerResources>,

    /// Full image reference, or a bare registry host to combine with the
    /// per-kind default worker image
    pub worker_image: String,

    /// Logical bucket/container all run blobs live in
    pub blob_namespace: String,

    /// Extra environment injected into every worker
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env_overrides: HashMap<String, String>,
}

/// Compiled, validated test plan. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPlan {
    /// Short URL-safe identifier, unique within the blob namespace
    pub run_id: String,
    /// URL the workers load-test
    pub target_url: String,
    /// Protocol or browser test
    pub test_kind: TestKind,
    /// Total virtual users across the whole fleet
    pub total_vus: u32,
    /// Parsed test duration
    pub duration: Duration,
    /// Duration exactly as the plan spelled it; passed through to workers
    pub duration_label: String,
    /// Virtual users one worker carries
    pub per_worker_vus: u32,
    /// Per-worker resource shape
    pub worker_resources: WorkerResources,
    /// Registry-qualified worker image reference
    pub worker_image: String,
    /// Logical bucket/container all run blobs live in
    pub blob_namespace: String,
    /// Extra environment injected into every worker
    pub env_overrides: HashMap<String, String>,
}

/// Compile a plan, generating a fresh run id
///
/// Pure except for the clock and randomness behind the run id; performs
/// no I/O. Fails with every violated constraint listed, not just the
/// first.
pub fn compile(config: &PlanConfig) -> Result<RunPlan, Error> {
    compile_with_run_id(config, generate_run_id())
}

/// Compile a plan under a caller-chosen run id
pub fn compile_with_run_id(config: &PlanConfig, run_id: String) -> Result<RunPlan, Error> {
    let mut violations = Vec::new();

    match Url::parse(&config.target_url) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
        Ok(url) => violations.push(format!(
            "target_url must be http(s), got scheme '{}'",
            url.scheme()
        )),
        Err(e) => violations.push(format!("target_url is not a valid URL: {e}")),
    }

    if config.total_vus < 1 {
        violations.push("total_vus must be at least 1".to_string());
    }
    if config.per_worker_vus < 1 {
        violations.push("per_worker_vus must be at least 1".to_string());
    }

    let duration = match parse_duration(&config.duration) {
        Some(d) if d > Duration::ZERO => Some(d),
        Some(_) => {
            violations.push("duration must be greater than zero".to_string());
            None
        }
        None => {
            violations.push(format!(
                "duration '{}' must be digits followed by one of s/m/h/d",
                config.duration
            ));
            None
        }
    };

    if config.worker_image.trim().is_empty() {
        violations.push("worker_image must not be empty".to_string());
    }
    if config.blob_namespace.trim().is_empty() {
        violations.push("blob_namespace must not be empty".to_string());
    }
    if let Some(resources) = &config.worker_resources {
        if resources.cpu_cores <= 0.0 {
            violations.push("worker_resources.cpu_cores must be positive".to_string());
        }
        if resources.memory_gib <= 0.0 {
            violations.push("worker_resources.memory_gib must be positive".to_string());
        }
    }

    if !violations.is_empty() {
        return Err(Error::invalid_plan(violations));
    }

    Ok(RunPlan {
        run_id,
        target_url: config.target_url.clone(),
        test_kind: config.test_kind,
        total_vus: config.total_vus,
        duration: duration.expect("validated above"),
        duration_label: config.duration.clone(),
        per_worker_vus: config.per_worker_vus,
        worker_resources: config
            .worker_resources
            .unwrap_or_else(|| WorkerResources::defaults_for(config.test_kind)),
        worker_image: resolve_image(&config.worker_image, config.test_kind),
        blob_namespace: config.blob_namespace.clone(),
        env_overrides: config.env_overrides.clone(),
    })
}

/// Generate a run identifier: UTC timestamp plus a short random suffix
///
/// Lowercase alphanumeric and dashes only, so the id is safe in URLs and
/// as a container group name prefix.
pub fn generate_run_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("run-{}-{}", Utc::now().format("%Y%m%d%H%M%S"), suffix)
}

/// Parse a duration of the form `<digits><unit>` with unit s/m/h/d
fn parse_duration(label: &str) -> Option<Duration> {
    let unit = label.chars().last()?;
    let digits = &label[..label.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u64 = digits.parse().ok()?;
    let secs = match unit {
        's' => n,
        'm' => n * 60,
        'h' => n * 3600,
        'd' => n * 86_400,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

/// Expand a bare registry host into the default worker image for the kind
fn resolve_image(image: &str, kind: TestKind) -> String {
    if image.contains('/') {
        return image.to_string();
    }
    let registry = image.trim_end_matches('/');
    match kind {
        TestKind::Protocol => format!("{registry}/k6-worker:latest"),
        TestKind::Browser => format!("{registry}/k6-playwright-worker:latest"),
    }
}
