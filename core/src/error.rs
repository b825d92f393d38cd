//! Error types for stampede-core

use thiserror::Error;

/// Top-level error type for a run
#[derive(Debug, Error)]
pub enum Error {
    /// The submitted plan failed validation
    #[error("invalid plan: {}", violations.join("; "))]
    InvalidPlan {
        /// Every constraint the plan violated
        violations: Vec<String>,
    },

    /// The workload could not be partitioned
    #[error(transparent)]
    InvalidDistribution(#[from] crate::distribute::DistributionError),

    /// Orchestrator configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The blob store rejected or lost an operation
    #[error(transparent)]
    Blob(#[from] crate::traits::BlobError),

    /// The container provider failed fatally
    #[error(transparent)]
    Provider(#[from] crate::traits::ProviderError),

    /// Aggregation could not proceed at all
    #[error(transparent)]
    Aggregator(#[from] crate::aggregator::AggregatorError),

    /// The run was cancelled before it could finish
    #[error("run cancelled")]
    Cancelled,

    /// The run overshot its hard deadline
    #[error("hard deadline exceeded")]
    DeadlineExceeded,
}

impl Error {
    /// Build an `InvalidPlan` from collected violations
    pub fn invalid_plan(violations: Vec<String>) -> Self {
        Error::InvalidPlan { violations }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
