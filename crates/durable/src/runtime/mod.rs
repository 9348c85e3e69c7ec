//! Orchestration operations on persisted steps
//!
//! [`WorkflowRuntimeData`] is the application-facing API: add, activate,
//! search, re-execute and fail steps. Every operation takes an optional
//! caller-owned transaction so several calls can commit as one unit.

mod data;

pub use data::{RuntimeError, WorkflowRuntimeData};
