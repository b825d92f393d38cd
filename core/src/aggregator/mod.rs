//! Cross-worker result aggregation
//!
//! Pulls each worker's summary stream from the blob store, merges every
//! sample into per-metric streaming accumulators, and produces the
//! canonical summary plus a manifest describing where each number came
//! from. Accumulators are strictly additive, so the merge is commutative
//! across workers.

mod accumulator;
mod record;

pub use accumulator::{MetricAccumulator, Percentiles, SeriesStats};
pub use record::{MetricType, PointData, SummaryRecord};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manager::{WorkerHandle, WorkerState};
use crate::plan::RunPlan;
use crate::settings::RunSettings;
use crate::traits::{BlobError, BlobStore};

/// Where the data for one worker ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// The summary stream was fetched and merged
    Merged,
    /// The worker should have produced a summary but none was found
    Missing,
    /// The worker's terminal state ruled its data out up front
    Skipped,
}

/// Manifest entry for one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSource {
    /// Worker index
    pub index: u32,
    /// Terminal worker state
    pub state: WorkerState,
    /// What happened to this worker's data
    pub source: SourceStatus,
    /// Blob the summary was (or would have been) read from
    pub summary_blob: String,
    /// Size of the fetched stream in bytes
    pub size_bytes: u64,
    /// Samples merged from this worker
    pub sample_count: u64,
    /// Lines that failed to parse and were skipped
    pub malformed_lines: u64,
    /// When the manager took charge of the worker
    pub started_at: DateTime<Utc>,
    /// When the worker reached its terminal state
    pub ended_at: DateTime<Utc>,
}

/// Per-run record of which workers contributed data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Run this manifest belongs to
    pub run_id: String,
    /// One entry per worker, ascending index
    pub workers: Vec<WorkerSource>,
    /// Whether any worker's data is absent from the merge
    pub partial: bool,
    /// Workers that reached `succeeded`
    pub successful_workers: u32,
    /// Total workers in the run
    pub worker_count: u32,
}

impl RunManifest {
    /// Manifest skeleton built from terminal handles alone, with no
    /// source data attached
    pub fn from_handles(run_id: &str, handles: &[WorkerHandle]) -> Self {
        let mut workers: Vec<WorkerSource> = handles
            .iter()
            .map(|handle| WorkerSource {
                index: handle.worker_index,
                state: handle.state,
                source: SourceStatus::Skipped,
                summary_blob: format!("{run_id}/summary_{}.json", handle.worker_index),
                size_bytes: 0,
                sample_count: 0,
                malformed_lines: 0,
                started_at: handle.created_at,
                ended_at: handle.last_observed_at,
            })
            .collect();
        workers.sort_by_key(|w| w.index);

        let successful_workers = handles
            .iter()
            .filter(|h| h.state == WorkerState::Succeeded)
            .count() as u32;
        let worker_count = handles.len() as u32;
        Self {
            run_id: run_id.to_string(),
            workers,
            partial: successful_workers < worker_count,
            successful_workers,
            worker_count,
        }
    }
}

/// Canonical post-merge metric snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalSummary {
    /// Run the summary belongs to
    pub run_id: String,
    /// Per-metric statistics, sorted by metric name
    pub metrics: BTreeMap<String, SeriesStats>,
    /// Provenance of the merged data
    pub manifest: RunManifest,
}

impl CanonicalSummary {
    /// Summary with no samples, for runs where nothing could be merged
    pub fn empty(run_id: &str, handles: &[WorkerHandle]) -> Self {
        Self {
            run_id: run_id.to_string(),
            metrics: BTreeMap::new(),
            manifest: RunManifest::from_handles(run_id, handles),
        }
    }

    /// Statistics for one metric, if any samples were seen
    pub fn metric(&self, name: &str) -> Option<&SeriesStats> {
        self.metrics.get(name)
    }

    /// Total samples across every metric
    pub fn total_samples(&self) -> u64 {
        self.metrics.values().map(|s| s.count).sum()
    }
}

/// Aggregation failures that abort the merge entirely
#[derive(Debug, Error)]
pub enum AggregatorError {
    /// The blob store failed every single fetch
    #[error("blob store unreachable while aggregating: {0}")]
    Unavailable(String),

    /// An upload was rejected by the blob store
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// The merged summary could not be serialized
    #[error("failed to encode aggregated output: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Merges per-worker summary streams into one canonical summary
pub struct ResultAggregator {
    blobs: Arc<dyn BlobStore>,
    reservoir_capacity: usize,
}

impl ResultAggregator {
    /// Create a new aggregator
    pub fn new(blobs: Arc<dyn BlobStore>, settings: &RunSettings) -> Self {
        Self {
            blobs,
            reservoir_capacity: settings.reservoir_capacity,
        }
    }

    /// Merge all retrievable worker summaries, ascending worker index
    ///
    /// Missing blobs and malformed lines are tolerated and recorded in
    /// the manifest; only a store that fails every fetch aborts the
    /// merge. Failed workers are still read, since they may have
    /// published partial data before dying.
    pub async fn aggregate(
        &self,
        plan: &RunPlan,
        handles: &[WorkerHandle],
    ) -> Result<CanonicalSummary, AggregatorError> {
        let mut accumulators: BTreeMap<String, MetricAccumulator> = BTreeMap::new();
        let mut manifest = RunManifest::from_handles(&plan.run_id, handles);
        let mut fetch_attempts = 0u32;
        let mut fetch_outages = 0u32;

        for source in &mut manifest.workers {
            if !matches!(source.state, WorkerState::Succeeded | WorkerState::Failed) {
                continue;
            }
            fetch_attempts += 1;
            match self.blobs.get(&plan.blob_namespace, &source.summary_blob).await {
                Ok(bytes) => {
                    source.source = SourceStatus::Merged;
                    source.size_bytes = bytes.len() as u64;
                    merge_stream(&bytes, self.reservoir_capacity, &mut accumulators, source);
                }
                Err(e) if e.is_not_found() => {
                    tracing::warn!(worker_index = source.index, "worker summary missing");
                    source.source = SourceStatus::Missing;
                }
                Err(e) => {
                    tracing::warn!(
                        worker_index = source.index,
                        error = %e,
                        "failed to fetch worker summary"
                    );
                    source.source = SourceStatus::Missing;
                    fetch_outages += 1;
                }
            }
        }

        if fetch_attempts > 0 && fetch_outages == fetch_attempts {
            return Err(AggregatorError::Unavailable(
                "every summary fetch failed".into(),
            ));
        }

        manifest.partial = manifest
            .workers
            .iter()
            .any(|w| w.source != SourceStatus::Merged)
            || manifest.successful_workers < manifest.worker_count;

        let metrics: BTreeMap<String, SeriesStats> = accumulators
            .iter()
            .map(|(name, acc)| (name.clone(), acc.finish()))
            .collect();

        let merged: u64 = manifest.workers.iter().map(|w| w.sample_count).sum();
        tracing::info!(
            run_id = %plan.run_id,
            metrics = metrics.len(),
            samples = merged,
            partial = manifest.partial,
            "aggregation complete"
        );

        Ok(CanonicalSummary {
            run_id: plan.run_id.clone(),
            metrics,
            manifest,
        })
    }

    /// Upload the canonical summary and its manifest; returns the summary
    /// blob name
    pub async fn upload(
        &self,
        plan: &RunPlan,
        summary: &CanonicalSummary,
    ) -> Result<String, AggregatorError> {
        let summary_name = format!("{}/aggregated_summary.json", plan.run_id);
        let summary_bytes = serde_json::to_vec_pretty(summary)?;
        self.blobs
            .put(&plan.blob_namespace, &summary_name, &summary_bytes)
            .await?;

        let manifest_name = format!("{}/manifest.json", plan.run_id);
        let manifest_bytes = serde_json::to_vec_pretty(&summary.manifest)?;
        self.blobs
            .put(&plan.blob_namespace, &manifest_name, &manifest_bytes)
            .await?;

        tracing::info!(run_id = %plan.run_id, blob = %summary_name, "uploaded aggregated summary");
        Ok(summary_name)
    }
}

/// Feed one worker's newline-delimited stream into the accumulators
fn merge_stream(
    bytes: &[u8],
    reservoir_capacity: usize,
    accumulators: &mut BTreeMap<String, MetricAccumulator>,
    source: &mut WorkerSource,
) {
    for raw_line in bytes.split(|b| *b == b'\n') {
        let line = trim_ascii(raw_line);
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<SummaryRecord>(line) {
            Ok(SummaryRecord::Point { metric, data }) => {
                source.sample_count += 1;
                accumulators
                    .entry(metric.clone())
                    .or_insert_with(|| MetricAccumulator::new(&metric, reservoir_capacity))
                    .observe(data.value);
            }
            Ok(SummaryRecord::Metric { .. }) => {
                // Declarations carry no values.
            }
            Ok(SummaryRecord::Completion {
                vus_used,
                iterations,
                wall_clock_ms,
                exit_code,
                ..
            }) => {
                tracing::debug!(
                    worker_index = source.index,
                    vus_used,
                    iterations,
                    wall_clock_ms,
                    exit_code,
                    "worker completion record"
                );
            }
            Err(e) => {
                source.malformed_lines += 1;
                tracing::debug!(
                    worker_index = source.index,
                    error = %e,
                    "skipping malformed summary line"
                );
            }
        }
    }
    if source.malformed_lines > 0 {
        tracing::warn!(
            worker_index = source.index,
            malformed = source.malformed_lines,
            "worker summary contained malformed lines"
        );
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
