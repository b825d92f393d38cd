//! Workload partitioning across workers

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One worker's slice of the total virtual-user load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAssignment {
    /// Zero-based index of the worker
    pub worker_index: u32,
    /// Total number of workers in the run
    pub worker_count: u32,
    /// Virtual users this worker simulates
    pub vus: u32,
}

/// Errors from workload partitioning
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DistributionError {
    /// The plan asked for no virtual users at all
    #[error("total_vus must be at least 1")]
    ZeroTotalVus,

    /// Workers cannot carry zero virtual users
    #[error("per_worker_vus must be at least 1")]
    ZeroPerWorkerVus,
}

/// Split `total_vus` across the smallest fleet of workers carrying at most
/// `per_worker_vus` each.
///
/// Every worker except the last gets a full slice; the last worker takes
/// the remainder. The slices always sum to `total_vus` and no worker is
/// ever assigned zero virtual users.
pub fn distribute(
    total_vus: u32,
    per_worker_vus: u32,
) -> Result<Vec<WorkerAssignment>, DistributionError> {
    if total_vus == 0 {
        return Err(DistributionError::ZeroTotalVus);
    }
    if per_worker_vus == 0 {
        return Err(DistributionError::ZeroPerWorkerVus);
    }

    let worker_count = total_vus.div_ceil(per_worker_vus);
    let mut assignments = Vec::with_capacity(worker_count as usize);
    for worker_index in 0..worker_count {
        let vus = if worker_index + 1 == worker_count {
            total_vus - (worker_count - 1) * per_worker_vus
        } else {
            per_worker_vus
        };
        assignments.push(WorkerAssignment {
            worker_index,
            worker_count,
            vus,
        });
    }

    Ok(assignments)
}
