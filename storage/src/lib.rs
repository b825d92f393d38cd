//! Blob store implementations for stampede
//!
//! This crate provides implementations of the `BlobStore` trait for:
//!
//! - In-memory storage (tests and dry runs)
//! - Local filesystem storage
//!
//! The cloud-hosted store ships with its provider in `stampede-providers`.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod fs;
mod memory;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;
