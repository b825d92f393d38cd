//! Finding model and the static recommendation catalogue

use serde::{Deserialize, Serialize};

/// How much a finding should worry the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Needs attention before the next release
    High,
    /// Worth scheduling
    Medium,
    /// Nice to fix
    Low,
}

impl Severity {
    /// Severity implied by a score deduction
    pub fn for_deduction(deduction: u32) -> Self {
        if deduction >= 20 {
            Severity::High
        } else if deduction >= 10 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// What part of the system a finding concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Time-to-first-byte dominated by the server
    ServerProcessing,
    /// Failed requests
    ErrorRate,
    /// Delivered requests per second
    Throughput,
    /// Browser user-experience metrics
    CoreWebVitals,
    /// Response body sizes
    PayloadSize,
    /// End-to-end request latency
    Latency,
    /// Part of the fleet never contributed results
    WorkerDropout,
    /// The run produced no samples at all
    NoSamples,
    /// No worker completed
    NoSuccessfulWorkers,
    /// The run was cancelled mid-flight
    Cancelled,
    /// The run was stopped at its hard deadline
    DeadlineExceeded,
}

impl Category {
    /// Stable tag used at the blob boundary
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::ServerProcessing => "server_processing",
            Category::ErrorRate => "error_rate",
            Category::Throughput => "throughput",
            Category::CoreWebVitals => "core_web_vitals",
            Category::PayloadSize => "payload_size",
            Category::Latency => "latency",
            Category::WorkerDropout => "worker_dropout",
            Category::NoSamples => "no_samples",
            Category::NoSuccessfulWorkers => "no_successful_workers",
            Category::Cancelled => "cancelled",
            Category::DeadlineExceeded => "deadline_exceeded",
        }
    }

    /// Static recommended action for the category
    pub fn recommended_action(&self) -> &'static str {
        match self {
            Category::ServerProcessing => {
                "Optimize server processing: add caching (Redis, Memcached), index slow \
                 database queries, pool database connections, and cache hot API responses"
            }
            Category::ErrorRate => {
                "Investigate server errors, network issues, or application bugs behind the \
                 failed requests"
            }
            Category::Throughput => {
                "Profile the request path for contention; the system is not keeping up with \
                 the offered load"
            }
            Category::CoreWebVitals => {
                "Optimize the critical rendering path: compress and lazy-load images, trim \
                 render-blocking resources, and reserve layout space for late content"
            }
            Category::PayloadSize => {
                "Enable gzip/brotli compression, paginate large datasets, and trim \
                 over-fetching in API responses"
            }
            Category::Latency => {
                "Break requests down by phase (connect, TLS, server, transfer) and target \
                 the slowest segment; consider a CDN for static assets"
            }
            Category::WorkerDropout => {
                "Check provider capacity, quotas, and image pull health; part of the fleet \
                 never contributed results"
            }
            Category::NoSamples => {
                "Verify the target URL is reachable from the workers and the test duration \
                 is long enough to produce samples"
            }
            Category::NoSuccessfulWorkers => {
                "Inspect worker logs and provider quotas before rerunning; no worker \
                 completed"
            }
            Category::Cancelled => {
                "The run was cancelled before completion; results cover only the portion \
                 that ran"
            }
            Category::DeadlineExceeded => {
                "The run overshot its hard deadline and was stopped; use a shorter duration \
                 or fewer virtual users"
            }
        }
    }
}

/// The statistic that triggered a finding, as a literal value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportingMetric {
    /// Metric name
    pub metric: String,
    /// Which statistic of the metric (mean, p95, ...)
    pub statistic: String,
    /// The literal observed value
    pub value: f64,
}

/// One observation derived deterministically from the canonical summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Severity bucket
    pub severity: Severity,
    /// Category tag
    pub category: Category,
    /// One-line headline
    pub title: String,
    /// Longer explanation with the observed numbers spelled out
    pub detail: String,
    /// Statistics backing the finding
    pub supporting_metrics: Vec<SupportingMetric>,
    /// Action drawn from the static per-category catalogue
    pub recommended_action: String,
}

impl Finding {
    /// Build a finding with the category's catalogued recommendation
    pub fn new(
        severity: Severity,
        category: Category,
        title: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            title: title.into(),
            detail: detail.into(),
            supporting_metrics: Vec::new(),
            recommended_action: category.recommended_action().to_string(),
        }
    }

    /// Attach a supporting statistic
    pub fn with_metric(mut self, metric: &str, statistic: &str, value: f64) -> Self {
        self.supporting_metrics.push(SupportingMetric {
            metric: metric.to_string(),
            statistic: statistic.to_string(),
            value,
        });
        self
    }
}
