//! Persistence layer for durable steps
//!
//! This module provides:
//! - [`StepPersister`] trait for status-partitioned step storage
//! - [`InMemoryStepPersister`] for testing
//! - [`PostgresStepPersister`] for production

mod memory;
mod postgres;
mod store;

pub use memory::{InMemoryStepPersister, MemoryTransaction};
pub use postgres::PostgresStepPersister;
pub use store::{StepPersister, StoreError};
pub use crate::step::StepCounts;
