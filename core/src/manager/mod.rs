//! Worker lifecycle management
//!
//! The container manager drives every worker of a run through the
//! pending → provisioning → running → terminal state machine, in
//! parallel, and guarantees the provider is left clean afterwards.

mod executor;
mod handle;

pub use executor::ContainerManager;
pub use handle::{WorkerEvent, WorkerHandle, WorkerState};

#[cfg(test)]
mod tests;
