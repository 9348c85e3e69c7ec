//! # Durable Step Engine
//!
//! A PostgreSQL-backed engine that persists units of work ("steps"), hands them
//! to a pool of polling workers and moves them between status partitions under
//! transactional guarantees.
//!
//! ## Features
//!
//! - **Status partitions**: every step lives in exactly one of `ready`, `done` or `failed`
//! - **Atomic transitions**: the move of a step and the insert of the steps it spawns commit together
//! - **Exclusive claiming**: `SELECT ... FOR UPDATE SKIP LOCKED` keeps two workers off the same step
//! - **Rerun scheduling**: handlers reschedule themselves, which also drives retries and fork/join
//! - **Singleton steps**: at most one ready step per singleton name
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    WorkflowRuntimeData                       │
//! │  (add / activate / re-execute / fail / search steps)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      StepPersister                           │
//! │  (PostgreSQL: steps_ready, steps_done, steps_failed)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 WorkflowEngine / Worker                      │
//! │  (claims due steps, runs handlers, applies transitions)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use stepworks_durable::prelude::*;
//!
//! let mut registry = StepHandlerRegistry::new();
//! registry.register_fn("send-invoice", |ctx| async move {
//!     let invoice: Invoice = ctx.state()?;
//!     send(invoice).await?;
//!     Ok(ExecutionResult::done())
//! });
//!
//! let engine = WorkflowEngine::new(Arc::new(persister), Arc::new(JsonStateFormatter), registry);
//! engine.data().add_step(Step::new("send-invoice").try_with_state(&invoice)?, None).await?;
//! engine.run(&EngineConfig::default()).await?;
//! ```

pub mod engine;
pub mod formatter;
pub mod persistence;
pub mod runtime;
pub mod step;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{
        EngineConfig, EngineError, EngineHandle, NamedStepHandler, StepContext, StepHandler,
        StepHandlerRegistry, WorkflowEngine,
    };
    pub use crate::formatter::{FormatterError, JsonStateFormatter, StateFormatter};
    pub use crate::persistence::{
        InMemoryStepPersister, PostgresStepPersister, StepPersister, StoreError,
    };
    pub use crate::runtime::{RuntimeError, WorkflowRuntimeData};
    pub use crate::step::{
        ExecutionResult, FetchLevels, SearchModel, Step, StepCounts, StepError, StepId,
        StepStatus,
    };
    pub use crate::worker::{PollOutcome, Worker, WorkerConfig, WorkerError};
}

// Re-export key types at crate root
pub use engine::{
    EngineConfig, EngineError, EngineHandle, StepContext, StepHandler, StepHandlerRegistry,
    WorkflowEngine,
};
pub use formatter::{JsonStateFormatter, StateFormatter};
pub use persistence::{InMemoryStepPersister, PostgresStepPersister, StepPersister, StoreError};
pub use runtime::{RuntimeError, WorkflowRuntimeData};
pub use step::{ExecutionResult, FetchLevels, SearchModel, Step, StepError, StepId, StepStatus};
pub use worker::{Worker, WorkerConfig};
