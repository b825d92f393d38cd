//! Capability traits for the blob store and the container provider
//!
//! These traits are defined in core to avoid circular dependencies.
//! Implementations live in their respective crates (storage/, providers/).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Blob Store Trait
// ============================================================================

/// Flat named-byte-stream storage, scoped by namespace
///
/// `put` must be durable before it returns. Overwrites are
/// last-writer-wins at the object level, with no ordering guarantee
/// between concurrent writers. Implementations must be safe for
/// concurrent use from multiple tasks.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `name`, overwriting any existing object
    async fn put(&self, namespace: &str, name: &str, bytes: &[u8]) -> Result<(), BlobError>;

    /// Fetch the object named `name`
    async fn get(&self, namespace: &str, name: &str) -> Result<Vec<u8>, BlobError>;

    /// List object names starting with `prefix`, in lexicographic order
    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<String>, BlobError>;

    /// Whether an object named `name` exists
    async fn exists(&self, namespace: &str, name: &str) -> Result<bool, BlobError>;
}

/// Blob store errors
#[derive(Debug, Error)]
pub enum BlobError {
    /// The requested object does not exist
    #[error("blob not found: {0}")]
    NotFound(String),

    /// The store could not be reached or rejected the operation
    #[error("blob store unavailable: {0}")]
    Unavailable(String),

    /// Local I/O failure
    #[error("blob I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BlobError {
    /// Whether this error means the object simply is not there
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound(_))
    }
}

// ============================================================================
// Container Provider Trait
// ============================================================================

/// Everything the provider needs to start one worker container group
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Provider-visible name of the container group
    pub group_name: String,
    /// Registry-qualified image reference
    pub image: String,
    /// Environment injected into the container
    pub env: HashMap<String, String>,
    /// Requested CPU cores
    pub cpu_cores: f64,
    /// Requested memory in GiB
    pub memory_gib: f64,
}

/// Provider-side container state
///
/// Anything the provider reports before the container starts (pending,
/// creating, pulling the image) maps to `Unknown`, as does a group the
/// provider no longer knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// The container is running
    Running,
    /// The container has stopped
    Terminated,
    /// Not started yet, or not found
    Unknown,
}

/// A point-in-time provider status report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerStatus {
    /// Observed state
    pub state: ContainerState,
    /// Exit code, set once the container has terminated
    pub exit_code: Option<i32>,
}

impl ContainerStatus {
    /// Status for a group the provider does not know
    pub fn unknown() -> Self {
        Self {
            state: ContainerState::Unknown,
            exit_code: None,
        }
    }
}

/// Provider capability for one-container worker groups
///
/// Implementations handle provider-specific API details while presenting
/// a uniform create/status/delete/logs surface to the container manager.
#[async_trait]
pub trait ContainerProvider: Send + Sync {
    /// Short provider identifier used in logs
    fn name(&self) -> &str;

    /// Create a container group; returns the provider-assigned identifier
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ProviderError>;

    /// Report the current state of a group
    async fn status(&self, provider_id: &str) -> Result<ContainerStatus, ProviderError>;

    /// Delete a group. Deleting a group the provider no longer knows is
    /// not an error.
    async fn delete(&self, provider_id: &str) -> Result<(), ProviderError>;

    /// Fetch container logs, best effort
    async fn logs(&self, provider_id: &str) -> Result<Vec<u8>, ProviderError>;
}

/// Container provider errors
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider asked us to back off
    #[error("provider throttled the request")]
    Throttled {
        /// Back-off hint from the provider, if it sent one
        retry_after: Option<Duration>,
    },

    /// Transient provider failure (5xx, connection reset)
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete in time
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    /// Non-retryable provider failure
    #[error("provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Check if this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Throttled { .. }
                | ProviderError::Unavailable(_)
                | ProviderError::Timeout(_)
        )
    }

    /// Back-off the provider asked for, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_retryable() {
        assert!(ProviderError::Throttled { retry_after: None }.is_retryable());
        assert!(ProviderError::Unavailable("503".into()).is_retryable());
        assert!(ProviderError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!ProviderError::Fatal("bad image ref".into()).is_retryable());
    }

    #[test]
    fn test_provider_error_retry_after() {
        let throttled = ProviderError::Throttled {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(ProviderError::Unavailable("x".into()).retry_after(), None);
    }

    #[test]
    fn test_blob_error_not_found() {
        assert!(BlobError::NotFound("a/b".into()).is_not_found());
        assert!(!BlobError::Unavailable("down".into()).is_not_found());
    }

    #[test]
    fn test_container_state_tags() {
        let tag = serde_json::to_string(&ContainerState::Terminated).expect("serialize");
        assert_eq!(tag, "\"terminated\"");
    }
}
