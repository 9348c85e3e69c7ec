//! Step execution engine
//!
//! The engine module provides the handler registry that maps step names to
//! code, and the `WorkflowEngine` that runs a pool of workers over it.

mod executor;
mod registry;

pub use executor::{EngineConfig, EngineError, EngineHandle, WorkflowEngine};
pub use registry::{NamedStepHandler, StepContext, StepHandler, StepHandlerRegistry};
