//! Polling workers
//!
//! This module provides:
//! - [`Worker`] - claims one due step at a time and commits its transition
//! - [`WorkerConfig`] - poll interval and stop-on-idle behavior
//!
//! # Poll cycle
//!
//! ```text
//! begin tx ─► claim due step ─► resolve handler ─► execute
//!                  │                                  │
//!                  ▼ (none)                           ▼
//!             idle: sleep / stop          Done ─► ready → done   ┐
//!                                         Fail ─► ready → failed ├─ + spawned steps, commit
//!                                         Rerun ─► update ready  ┘
//! ```

mod poller;
mod runner;

pub use poller::WorkerConfig;
pub use runner::{PollOutcome, Worker, WorkerError};
