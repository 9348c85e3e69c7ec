//! Heartbeat singleton
//!
//! A self-rescheduling step that logs a beat per interval. Being a singleton,
//! every host can seed it on startup and only one copy is ever ready.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use stepworks_durable::engine::NamedStepHandler;
use stepworks_durable::{ExecutionResult, StepContext, StepError, StepHandler};
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatState {
    pub beats: u64,
}

/// Reruns itself every `interval`
#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl NamedStepHandler for Heartbeat {
    const NAME: &'static str = "stepworks.heartbeat";
}

#[async_trait]
impl StepHandler for Heartbeat {
    async fn execute(&self, ctx: StepContext) -> Result<ExecutionResult, StepError> {
        let previous = match ctx.step().state {
            Some(_) => ctx.state::<HeartbeatState>()?,
            None => HeartbeatState::default(),
        };
        let next = HeartbeatState {
            beats: previous.beats + 1,
        };

        info!(
            beats = next.beats,
            worker_id = %ctx.worker_id(),
            "heartbeat"
        );

        let delay = chrono::Duration::from_std(self.interval)
            .map_err(|e| StepError::fault(format!("invalid heartbeat interval: {e}")))?;

        Ok(ExecutionResult::rerun()
            .try_with_state(&next)?
            .at(Utc::now() + delay))
    }
}
