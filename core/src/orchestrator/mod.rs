//! Orchestrator for run lifecycle management
//!
//! The Orchestrator coordinates a complete distributed run:
//! - Compiling and partitioning the plan
//! - Driving the worker fleet through the container manager
//! - Enforcing cancellation and the overall hard deadline
//! - Aggregating worker results and grading them
//!
//! # Example
//!
//! ```ignore
//! use stampede_core::orchestrator::OrchestratorBuilder;
//!
//! let (orchestrator, events_rx) = OrchestratorBuilder::new()
//!     .provider(provider)
//!     .blobs(blobs)
//!     .build()?;
//!
//! let outcome = orchestrator.run_with_signal(&plan_config).await?;
//! std::process::exit(outcome.exit_code());
//! ```

mod builder;
mod executor;

pub use builder::OrchestratorBuilder;
pub use executor::Orchestrator;
