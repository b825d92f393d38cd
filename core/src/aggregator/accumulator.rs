//! Streaming per-metric statistics
//!
//! Raw samples are never materialized in full: each metric keeps running
//! aggregates plus a bounded uniform reservoir for percentile estimation,
//! so memory stays O(metrics x reservoir capacity) regardless of run
//! length.

use std::hash::{Hash, Hasher};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Fixed base seed; combined with the metric name so merging is a pure
/// function of the input streams
const RESERVOIR_SEED: u64 = 0x9c1d_52ab_03f6_e784;

/// Percentile estimates from the preserved sample reservoir
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    /// 50th percentile (median)
    pub p50: f64,
    /// 75th percentile
    pub p75: f64,
    /// 90th percentile
    pub p90: f64,
    /// 95th percentile
    pub p95: f64,
    /// 99th percentile
    pub p99: f64,
}

/// Summary statistics for one metric across all workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesStats {
    /// Number of samples observed
    pub count: u64,
    /// Sum of all observed values
    pub sum: f64,
    /// Smallest observed value
    pub min: f64,
    /// Largest observed value
    pub max: f64,
    /// Running mean (Welford)
    pub mean: f64,
    /// Percentile estimates
    pub percentiles: Percentiles,
    /// Samples retained in the reservoir the percentiles were computed from
    pub samples_preserved: u64,
}

impl SeriesStats {
    fn empty() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            percentiles: Percentiles::default(),
            samples_preserved: 0,
        }
    }
}

/// Streaming accumulator: running aggregates plus a bounded reservoir
///
/// The reservoir uses Algorithm R: once full, the n-th sample replaces a
/// random slot with probability capacity/n, which keeps the retained set
/// a uniform sample of the whole stream.
#[derive(Debug)]
pub struct MetricAccumulator {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    mean: f64,
    reservoir: Vec<f64>,
    capacity: usize,
    rng: StdRng,
}

impl MetricAccumulator {
    /// New accumulator for `metric` with the given reservoir capacity
    pub fn new(metric: &str, capacity: usize) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        metric.hash(&mut hasher);
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: 0.0,
            reservoir: Vec::new(),
            capacity: capacity.max(1),
            rng: StdRng::seed_from_u64(RESERVOIR_SEED ^ hasher.finish()),
        }
    }

    /// Record one sample
    pub fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.mean += (value - self.mean) / self.count as f64;

        if self.reservoir.len() < self.capacity {
            self.reservoir.push(value);
        } else {
            let slot = self.rng.gen_range(0..self.count);
            if (slot as usize) < self.capacity {
                self.reservoir[slot as usize] = value;
            }
        }
    }

    /// Number of samples observed so far
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Snapshot the final statistics; sorts a copy of the reservoir
    pub fn finish(&self) -> SeriesStats {
        if self.count == 0 {
            return SeriesStats::empty();
        }
        let mut sorted = self.reservoir.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        SeriesStats {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            mean: self.mean,
            percentiles: Percentiles {
                p50: percentile(&sorted, 0.50),
                p75: percentile(&sorted, 0.75),
                p90: percentile(&sorted, 0.90),
                p95: percentile(&sorted, 0.95),
                p99: percentile(&sorted, 0.99),
            },
            samples_preserved: sorted.len() as u64,
        }
    }
}

/// Calculate a percentile from sorted values using linear interpolation
pub(crate) fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }

    let idx = p * (sorted.len() - 1) as f64;
    let lower = idx.floor() as usize;
    let upper = idx.ceil() as usize;
    let frac = idx - lower as f64;

    if upper >= sorted.len() {
        sorted[sorted.len() - 1]
    } else {
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}
