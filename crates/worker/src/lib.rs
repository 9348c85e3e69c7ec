//! Standalone step worker host
//!
//! Connects a [`PostgresStepPersister`](stepworks_durable::PostgresStepPersister),
//! registers the built-in handlers and runs a pool of workers until shutdown.

pub mod config;
pub mod heartbeat;
pub mod host;

pub use config::{HostConfig, HostConfigError};
pub use heartbeat::{Heartbeat, HeartbeatState};
pub use host::{build_registry, seed_heartbeat, WorkerHost};
