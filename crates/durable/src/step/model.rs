//! Step and step status

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use super::result::{ExecutionResult, StepError};

/// Identity of a persisted step
///
/// `0` means "not assigned yet". It is also the `created_by_step_id` of a step
/// that was not spawned by another step.
pub type StepId = i64;

/// Status partition a step lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting to be executed once its schedule time has arrived
    Ready,

    /// Executed to completion
    Done,

    /// Failed, either by its handler or administratively
    Failed,
}

impl StepStatus {
    /// All partitions in storage order
    pub const ALL: [StepStatus; 3] = [StepStatus::Ready, StepStatus::Done, StepStatus::Failed];
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted unit of work
///
/// A step carries no behavior. Its `name` selects the handler that executes it
/// and its `state` is the serialized form of `initial_state`, written by the
/// active [`StateFormatter`](crate::formatter::StateFormatter) when the step is
/// added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Assigned by the store on insert
    pub id: StepId,

    /// Selects the handler, never empty once persisted
    pub name: String,

    /// At most one ready step with this name may exist
    pub singleton: bool,

    /// Groups the steps of one logical execution
    pub flow_id: Option<String>,

    /// Free-form indexable tag
    pub search_key: Option<String>,

    /// Caller supplied state, serialized into `state` on insert (not persisted)
    #[serde(skip)]
    pub initial_state: Option<serde_json::Value>,

    /// Serialized state
    pub state: Option<String>,

    /// Name of the formatter that produced `state`
    pub state_format: Option<String>,

    /// Serialized payload attached by an activation
    pub activation_args: Option<String>,

    /// Number of execution attempts, reruns included
    pub execution_count: i32,

    pub execution_duration_millis: Option<i64>,

    pub execution_start_time: Option<DateTime<Utc>>,

    /// Identity of the worker that executed the step last
    pub executed_by: Option<String>,

    pub created_time: Option<DateTime<Utc>>,

    /// Step that spawned this one, `0` when none did
    pub created_by_step_id: StepId,

    /// Earliest time the step may execute, whole seconds
    pub schedule_time: Option<DateTime<Utc>>,

    pub correlation_id: Option<String>,

    /// Human readable outcome or failure text
    pub description: Option<String>,
}

impl Default for Step {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            singleton: false,
            flow_id: None,
            search_key: None,
            initial_state: None,
            state: None,
            state_format: None,
            activation_args: None,
            execution_count: 0,
            execution_duration_millis: None,
            execution_start_time: None,
            executed_by: None,
            created_time: None,
            created_by_step_id: 0,
            schedule_time: None,
            correlation_id: None,
            description: None,
        }
    }
}

impl Step {
    /// Create a step for the handler registered under `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the initial state from a JSON value
    pub fn with_state(mut self, state: impl Into<serde_json::Value>) -> Self {
        self.initial_state = Some(state.into());
        self
    }

    /// Set the initial state from any serializable value
    pub fn try_with_state<T: Serialize + ?Sized>(
        mut self,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        self.initial_state = Some(serde_json::to_value(state)?);
        Ok(self)
    }

    pub fn with_flow_id(mut self, flow_id: impl Into<String>) -> Self {
        self.flow_id = Some(flow_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_search_key(mut self, search_key: impl Into<String>) -> Self {
        self.search_key = Some(search_key.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark the step as a singleton
    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    /// Schedule the step for a specific time
    pub fn scheduled_at(mut self, time: DateTime<Utc>) -> Self {
        self.schedule_time = Some(time);
        self
    }

    /// Whether the step may be picked up at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.schedule_time.map_or(true, |t| t <= now)
    }

    /// Complete this step
    pub fn done(&self) -> ExecutionResult {
        ExecutionResult::done()
    }

    /// Complete this step and spawn `steps`
    pub fn done_with(&self, steps: impl IntoIterator<Item = Step>) -> ExecutionResult {
        ExecutionResult::done().with_steps(steps)
    }

    /// Fail this step with a description
    pub fn fail(&self, description: impl Into<String>) -> ExecutionResult {
        ExecutionResult::fail(description)
    }

    /// Run this step again with unchanged state and schedule time
    pub fn rerun(&self) -> ExecutionResult {
        ExecutionResult::rerun()
    }

    /// Signal that fails this step from anywhere inside a handler
    pub fn fail_as_error(&self, description: impl Into<String>) -> StepError {
        StepError::fail_current_step(description)
    }

    /// Signal that fails this step and spawns `steps` in the same transition
    pub fn fail_as_error_with(
        &self,
        description: impl Into<String>,
        steps: impl IntoIterator<Item = Step>,
    ) -> StepError {
        StepError::FailCurrentStep {
            description: description.into(),
            new_steps: steps.into_iter().collect(),
        }
    }
}

/// Drop sub-second precision
///
/// Workers compare schedule times at whole seconds, so a step scheduled for
/// "now" must not land a fraction of a second in the future.
pub fn truncate_to_seconds(time: DateTime<Utc>) -> DateTime<Utc> {
    time.trunc_subsecs(0)
}
