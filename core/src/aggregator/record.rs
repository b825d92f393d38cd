//! Wire records emitted by workers into their summary streams

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metric family declared by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Monotonic count of occurrences
    Counter,
    /// Distribution of observed values
    Trend,
    /// Fraction of non-zero observations
    Rate,
    /// Last-observed value
    Gauge,
}

/// Payload of a `Point` record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointData {
    /// When the worker took the sample
    pub time: DateTime<Utc>,
    /// Observed value
    pub value: f64,
    /// Free-form labels; may include `type`, `status`, `url`
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

/// One line of a worker summary stream
///
/// Streams are newline-delimited JSON; the `Completion` record must be
/// the last line of a well-formed stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SummaryRecord {
    /// A single timing/size sample
    Point {
        /// Metric name the sample belongs to
        metric: String,
        /// Sample payload
        data: PointData,
    },
    /// Declaration of a metric family
    Metric {
        /// Metric name being declared
        metric: String,
        /// Family kind
        #[serde(rename = "type")]
        metric_type: MetricType,
        /// Threshold expressions attached by the worker
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        thresholds: Vec<String>,
    },
    /// Trailing completion record
    Completion {
        /// Worker that produced the stream
        worker_index: u32,
        /// Virtual users the worker actually ran
        vus_used: u32,
        /// Completed VU iterations
        iterations: u64,
        /// Wall-clock runtime of the worker, milliseconds
        wall_clock_ms: u64,
        /// Worker process exit code
        exit_code: i32,
    },
}
