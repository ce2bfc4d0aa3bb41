//! Engine: registry, executor, and the per-operation engines

pub mod executor;
pub mod registry;

pub(crate) mod messaging;
mod recovery;
pub(crate) mod step;
pub(crate) mod transaction;

pub use executor::{EngineConfig, StartOptions, WorkflowEngine};
pub use registry::{InstanceHandle, Registry, TEMP_SEND_WORKFLOW};
pub use step::StepContext;
