//! Run outcome and process exit codes

use serde::{Deserialize, Serialize};

use crate::analyzer::PerformanceReport;
use crate::manager::WorkerHandle;

/// Exit code for a plan that never became a run
pub const EXIT_INVALID_PLAN: i32 = 5;

/// Exit code for infrastructure failures outside any single worker
pub const EXIT_INFRA_ERROR: i32 = 6;

/// Overall disposition of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every worker succeeded
    Ok,
    /// Some workers failed but at least one succeeded
    Degraded,
    /// No worker succeeded
    Failed,
    /// The run was cancelled (or hit its hard deadline)
    Cancelled,
}

impl RunStatus {
    /// Process exit code for the status
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Ok => 0,
            RunStatus::Degraded => 2,
            RunStatus::Failed => 3,
            RunStatus::Cancelled => 4,
        }
    }
}

/// Orchestrator-level failures that do not belong to any single worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrchestratorError {
    /// The blob store rejected the final uploads; the report was still
    /// returned in memory
    BlobUnavailable {
        /// What the store said
        detail: String,
    },
    /// Aggregation could not run at all
    AggregatorFailed {
        /// What went wrong
        detail: String,
    },
}

/// Everything a run hands back to the caller
///
/// Always produced once a plan has compiled, even for cancelled and
/// failed runs; the terminal worker states and the manifest inside the
/// report explain any non-ok exit code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Run identifier
    pub run_id: String,
    /// Overall disposition
    pub status: RunStatus,
    /// Terminal state of every worker, ascending index
    pub workers: Vec<WorkerHandle>,
    /// Blob the canonical summary was uploaded to, when the upload worked
    pub canonical_summary_location: Option<String>,
    /// The graded report, always present in memory
    pub report: PerformanceReport,
    /// Orchestrator-level failure, if any
    pub orchestrator_error: Option<OrchestratorError>,
}

impl RunOutcome {
    /// Exit code combining run status and orchestrator-level failures
    pub fn exit_code(&self) -> i32 {
        if self.orchestrator_error.is_some() && self.status != RunStatus::Cancelled {
            EXIT_INFRA_ERROR
        } else {
            self.status.exit_code()
        }
    }
}
