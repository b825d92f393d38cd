//! Container provider and cloud blob store implementations for stampede
//!
//! This crate provides implementations of the core capability traits:
//!
//! - Azure Container Instances (`ContainerProvider` over the ARM REST API)
//! - Azure Blob Storage (`BlobStore` over the Blob REST API)
//! - A deterministic in-process fake provider for tests and dry runs

#![warn(missing_docs)]
#![warn(clippy::all)]

mod azure;
mod azure_blob;
mod fake;

pub use azure::{AzureContainerProvider, AzureSettings};
pub use azure_blob::AzureBlobStore;
pub use fake::{FakeProvider, WorkerScript};
