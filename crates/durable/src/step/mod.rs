//! Step data model
//!
//! This module provides:
//! - [`Step`] - the persisted unit of work
//! - [`SearchModel`] / [`FetchLevels`] - read-side criteria and partition selection
//! - [`ExecutionResult`] / [`StepError`] - what a handler hands back to the worker

mod model;
mod result;
mod search;

pub use model::{truncate_to_seconds, Step, StepId, StepStatus};
pub use result::{ExecutionResult, StepError};
pub use search::{FetchLevels, SearchModel, StepCounts};
