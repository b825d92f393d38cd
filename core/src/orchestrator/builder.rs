//! Builder pattern for Orchestrator construction

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::manager::WorkerEvent;
use crate::settings::RunSettings;
use crate::traits::{BlobStore, ContainerProvider};

use super::executor::Orchestrator;

/// Builder for creating an Orchestrator with proper configuration
///
/// # Example
///
/// ```ignore
/// let (orchestrator, events_rx) = OrchestratorBuilder::new()
///     .provider(provider)
///     .blobs(blobs)
///     .settings(RunSettings::default())
///     .build()?;
///
/// let outcome = orchestrator.run(&plan_config).await?;
/// ```
pub struct OrchestratorBuilder {
    provider: Option<Arc<dyn ContainerProvider>>,
    blobs: Option<Arc<dyn BlobStore>>,
    settings: RunSettings,
}

impl OrchestratorBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            provider: None,
            blobs: None,
            settings: RunSettings::default(),
        }
    }

    /// Set the container provider
    pub fn provider(mut self, provider: Arc<dyn ContainerProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the blob store
    pub fn blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Override the run settings
    pub fn settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Build the orchestrator and return it along with the receiver for
    /// terminal worker events
    ///
    /// # Errors
    ///
    /// Returns an error if the provider or blob store is not set, or if
    /// the settings fail validation.
    pub fn build(self) -> Result<(Orchestrator, mpsc::Receiver<WorkerEvent>)> {
        let provider = self
            .provider
            .ok_or_else(|| Error::Config("provider is required".into()))?;
        let blobs = self
            .blobs
            .ok_or_else(|| Error::Config("blob store is required".into()))?;
        self.settings.validate()?;

        let (events_tx, events_rx) = mpsc::channel(self.settings.event_buffer);
        let orchestrator = Orchestrator::new(
            provider,
            blobs,
            self.settings,
            events_tx,
            CancellationToken::new(),
        );
        Ok((orchestrator, events_rx))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
