//! Worker lifecycle states, handles, and terminal events

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one worker container group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Known to the manager, no provider call issued yet
    Pending,
    /// Create accepted, waiting for the container to start
    Provisioning,
    /// The provider reports the container started
    Running,
    /// Completion marker observed and the container exited cleanly
    Succeeded,
    /// The container exited non-zero or hung past its completion timeout
    Failed,
    /// The container never reached running
    FailedToStart,
    /// The run was cancelled while this worker was still in flight
    Cancelled,
}

impl WorkerState {
    /// Whether no further transitions can occur from this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerState::Succeeded
                | WorkerState::Failed
                | WorkerState::FailedToStart
                | WorkerState::Cancelled
        )
    }

    /// Stable tag used at the blob boundary
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Pending => "pending",
            WorkerState::Provisioning => "provisioning",
            WorkerState::Running => "running",
            WorkerState::Succeeded => "succeeded",
            WorkerState::Failed => "failed",
            WorkerState::FailedToStart => "failed_to_start",
            WorkerState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to one provisioned (or attempted) worker
///
/// Owned and mutated exclusively by the container manager; read-only for
/// everyone else once the manager reports all workers terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHandle {
    /// Zero-based worker index
    pub worker_index: u32,
    /// Provider-assigned identifier, set once create is accepted
    pub provider_id: Option<String>,
    /// Current lifecycle state
    pub state: WorkerState,
    /// When the manager first took charge of the worker
    pub created_at: DateTime<Utc>,
    /// Last time the state was updated from an observation
    pub last_observed_at: DateTime<Utc>,
    /// Container exit code, set on terminal provider reports
    pub exit_code: Option<i32>,
}

impl WorkerHandle {
    /// Fresh handle in `Pending`
    pub fn new(worker_index: u32) -> Self {
        let now = Utc::now();
        Self {
            worker_index,
            provider_id: None,
            state: WorkerState::Pending,
            created_at: now,
            last_observed_at: now,
            exit_code: None,
        }
    }

    /// Move to `state`, stamping the observation time
    pub(crate) fn transition(&mut self, state: WorkerState) {
        self.state = state;
        self.last_observed_at = Utc::now();
    }
}

/// Terminal event emitted by the manager, in completion order
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    /// Worker that reached a terminal state
    pub worker_index: u32,
    /// The terminal state
    pub state: WorkerState,
    /// Exit code if the container terminated
    pub exit_code: Option<i32>,
    /// When the terminal state was recorded
    pub at: DateTime<Utc>,
}
