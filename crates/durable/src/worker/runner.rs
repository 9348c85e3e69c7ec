//! Worker loop: claim a due step, execute its handler, commit the transition

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::poller::{Poller, WorkerConfig};
use crate::engine::{StepContext, StepHandlerRegistry};
use crate::persistence::{StepPersister, StoreError};
use crate::runtime::{RuntimeError, WorkflowRuntimeData};
use crate::step::{truncate_to_seconds, ExecutionResult, Step, StepError, StepStatus};

/// Worker errors
///
/// Handler failures never surface here; they end up in the step itself.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result of a single poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A step was executed and left in this partition
    Executed(StepStatus),

    /// Nothing was due
    Idle,
}

/// What to do with an executed step
#[derive(Debug)]
enum Transition {
    Done {
        new_steps: Vec<Step>,
    },
    Rerun {
        new_steps: Vec<Step>,
        state: Option<serde_json::Value>,
        schedule_time: Option<DateTime<Utc>>,
        description: Option<String>,
    },
    Fail {
        new_steps: Vec<Step>,
        description: Option<String>,
    },
}

impl Transition {
    fn from_handler(
        outcome: Result<Result<ExecutionResult, StepError>, Box<dyn Any + Send>>,
    ) -> Self {
        match outcome {
            Ok(Ok(ExecutionResult::Done { new_steps })) => Self::Done { new_steps },
            Ok(Ok(ExecutionResult::Rerun {
                new_steps,
                state,
                schedule_time,
            })) => Self::Rerun {
                new_steps,
                state,
                schedule_time,
                description: None,
            },
            Ok(Ok(ExecutionResult::Fail {
                new_steps,
                description,
            })) => Self::Fail {
                new_steps,
                description,
            },
            Ok(Err(StepError::FailCurrentStep {
                description,
                new_steps,
            })) => {
                info!(%description, "step failed by handler");
                Self::Fail {
                    new_steps,
                    description: Some(description),
                }
            }
            Ok(Err(StepError::Fault(message))) => {
                warn!(error = %message, "step handler fault, step will be rerun");
                Self::retry(message)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(error = %message, "step handler panicked, step will be rerun");
                Self::retry(message)
            }
        }
    }

    /// Rerun with state and schedule untouched
    fn retry(description: String) -> Self {
        Self::Rerun {
            new_steps: vec![],
            state: None,
            schedule_time: None,
            description: Some(description),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("step handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("step handler panicked: {s}")
    } else {
        "step handler panicked".to_string()
    }
}

/// A single polling worker
///
/// Each poll claims one due step inside its own transaction, runs the handler
/// while holding the claim, and commits the resulting transition together
/// with any steps the handler spawned.
pub struct Worker<P: StepPersister> {
    id: String,
    data: WorkflowRuntimeData<P>,
    registry: Arc<StepHandlerRegistry>,
    config: WorkerConfig,
    poller: Poller,
}

impl<P: StepPersister> Worker<P> {
    pub fn new(
        id: impl Into<String>,
        data: WorkflowRuntimeData<P>,
        registry: Arc<StepHandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let poller = Poller::new(config.poll_interval, None);
        Self {
            id: id.into(),
            data,
            registry,
            config,
            poller,
        }
    }

    /// Stop the worker loop when `true` is sent on this channel
    pub fn with_shutdown(mut self, shutdown_rx: watch::Receiver<bool>) -> Self {
        self.poller = Poller::new(self.config.poll_interval, Some(shutdown_rx));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Poll until shutdown, or until idle when configured to stop on idle
    ///
    /// Returns an error only for storage failures.
    pub async fn run(&self) -> Result<(), WorkerError> {
        info!(worker_id = %self.id, "worker started");

        loop {
            if self.poller.is_shutdown() {
                debug!(worker_id = %self.id, "shutdown requested");
                break;
            }

            match self.run_once().await {
                Ok(PollOutcome::Executed(_)) => {}
                Ok(PollOutcome::Idle) => {
                    if self.config.stop_when_no_immediate_work {
                        debug!(worker_id = %self.id, "no immediate work, stopping");
                        break;
                    }
                    if self.poller.wait().await {
                        break;
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "worker stopped on storage error");
                    return Err(e);
                }
            }
        }

        info!(worker_id = %self.id, "worker stopped");
        Ok(())
    }

    /// Claim and execute at most one due step
    pub async fn run_once(&self) -> Result<PollOutcome, WorkerError> {
        let persister = self.data.persister();
        let mut tx = persister.begin().await?;

        let claimed = persister
            .claim_ready(&mut tx, &self.id, Utc::now(), 1)
            .await?;
        let Some(step) = claimed.into_iter().next() else {
            return Ok(PollOutcome::Idle);
        };

        let span = info_span!(
            "step",
            step_id = step.id,
            step_name = %step.name,
            flow_id = step.flow_id.as_deref().unwrap_or_default(),
            worker_id = %self.id,
        );
        let status = self.execute(tx, step).instrument(span).await?;
        Ok(PollOutcome::Executed(status))
    }

    async fn execute(&self, tx: P::Transaction, mut step: Step) -> Result<StepStatus, WorkerError> {
        let timer = Instant::now();

        step.execution_start_time = Some(Utc::now());
        step.execution_count += 1;
        step.executed_by = Some(self.id.clone());

        let transition = match self.registry.resolve(&step.name) {
            Some(handler) => {
                let ctx = StepContext::new(
                    step.clone(),
                    Arc::clone(self.data.formatter()),
                    self.id.clone(),
                );
                let outcome = AssertUnwindSafe(handler.execute(ctx)).catch_unwind().await;
                Transition::from_handler(outcome)
            }
            None => {
                warn!("no handler registered for step");
                Transition::Fail {
                    new_steps: vec![],
                    description: Some(format!(
                        "missing step-implementation for step '{}'",
                        step.name
                    )),
                }
            }
        };

        step.execution_duration_millis = Some(timer.elapsed().as_millis() as i64);

        match self.commit_transition(tx, &mut step, transition).await {
            Ok(status) => {
                debug!(
                    %status,
                    execution_count = step.execution_count,
                    duration_ms = step.execution_duration_millis,
                    "step executed"
                );
                Ok(status)
            }
            Err(StoreError::SingletonViolation { name }) => {
                self.record_singleton_violation(step, &name).await?;
                Ok(StepStatus::Ready)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply the transition and commit it with the spawned steps
    async fn commit_transition(
        &self,
        mut tx: P::Transaction,
        step: &mut Step,
        transition: Transition,
    ) -> Result<StepStatus, StoreError> {
        let persister = self.data.persister();

        let (status, spawned) = match self.prepare(step, transition) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(error = %e, "step produced invalid output, failing it");
                step.description = Some(format!("invalid step output: {e}"));
                (StepStatus::Failed, vec![])
            }
        };

        match status {
            StepStatus::Ready => {
                persister.update(&mut tx, StepStatus::Ready, step).await?;
            }
            StepStatus::Done | StepStatus::Failed => {
                persister.delete(&mut tx, StepStatus::Ready, step.id).await?;
                persister
                    .insert(&mut tx, status, std::slice::from_ref(step))
                    .await?;
            }
        }

        if !spawned.is_empty() {
            let ids = persister.insert(&mut tx, StepStatus::Ready, &spawned).await?;
            debug!(spawned = ?ids, "inserted spawned steps");
        }

        persister.commit(tx).await?;
        Ok(status)
    }

    /// Fold the transition into the step and fix up the spawned steps
    fn prepare(
        &self,
        step: &mut Step,
        transition: Transition,
    ) -> Result<(StepStatus, Vec<Step>), RuntimeError> {
        let now = Utc::now();
        let (status, new_steps) = match transition {
            Transition::Done { new_steps } => (StepStatus::Done, new_steps),
            Transition::Fail {
                new_steps,
                description,
            } => {
                if description.is_some() {
                    step.description = description;
                }
                (StepStatus::Failed, new_steps)
            }
            Transition::Rerun {
                new_steps,
                state,
                schedule_time,
                description,
            } => {
                if let Some(state) = state {
                    let formatter = self.data.formatter();
                    step.state = Some(formatter.serialize_value(&state)?);
                    step.state_format = Some(formatter.name().to_string());
                }
                // Whole seconds, so a short delay is due by the next idle check
                if let Some(at) = schedule_time {
                    step.schedule_time = Some(truncate_to_seconds(at));
                }
                if description.is_some() {
                    step.description = description;
                }
                (StepStatus::Ready, new_steps)
            }
        };

        let origin: &Step = step;
        let spawned = new_steps
            .into_iter()
            .map(|s| self.data.fixup_new_step(Some(origin), s, now))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((status, spawned))
    }

    /// Keep the step ready after its transition hit a singleton conflict
    async fn record_singleton_violation(&self, mut step: Step, name: &str) -> Result<(), WorkerError> {
        warn!(singleton = %name, "transition rolled back on singleton violation, step will be rerun");

        let persister = self.data.persister();
        let mut tx = persister.begin().await?;

        let current = match persister.lock_step(&mut tx, StepStatus::Ready, step.id).await {
            Ok(current) => current,
            Err(StoreError::Locked(id)) => {
                debug!(step_id = id, "step claimed again, skipping record");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        // Gone, or another worker executed it since the rollback
        let Some(current) = current.filter(|c| c.execution_count + 1 == step.execution_count) else {
            return Ok(());
        };

        // Everything but the execution record stays as it was before this run
        step.state = current.state;
        step.state_format = current.state_format;
        step.schedule_time = current.schedule_time;
        step.description = Some(StoreError::SingletonViolation {
            name: name.to_string(),
        }
        .to_string());

        persister.update(&mut tx, StepStatus::Ready, &step).await?;
        persister.commit(tx).await?;
        Ok(())
    }
}
