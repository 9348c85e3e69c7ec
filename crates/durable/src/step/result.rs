//! Handler outcomes

use chrono::{DateTime, Utc};

use super::Step;
use crate::formatter::FormatterError;

/// Outcome of executing a step
///
/// Every variant may carry newly spawned steps. They are inserted into the
/// ready partition in the same transaction as the transition of the current
/// step.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// Move the step to the done partition
    Done {
        new_steps: Vec<Step>,
    },

    /// Keep the step in the ready partition and execute it again
    Rerun {
        new_steps: Vec<Step>,

        /// Replacement state, serialized by the active formatter
        state: Option<serde_json::Value>,

        /// Replacement schedule time
        schedule_time: Option<DateTime<Utc>>,
    },

    /// Move the step to the failed partition
    Fail {
        new_steps: Vec<Step>,
        description: Option<String>,
    },
}

impl ExecutionResult {
    /// Complete the step
    pub fn done() -> Self {
        Self::Done { new_steps: vec![] }
    }

    /// Execute the step again, keeping state and schedule time
    pub fn rerun() -> Self {
        Self::Rerun {
            new_steps: vec![],
            state: None,
            schedule_time: None,
        }
    }

    /// Fail the step with a description
    pub fn fail(description: impl Into<String>) -> Self {
        Self::Fail {
            new_steps: vec![],
            description: Some(description.into()),
        }
    }

    /// Replace the state carried into the next execution
    ///
    /// Only meaningful for [`ExecutionResult::Rerun`]; other variants are returned unchanged.
    pub fn with_state(mut self, new_state: impl Into<serde_json::Value>) -> Self {
        if let Self::Rerun { state, .. } = &mut self {
            *state = Some(new_state.into());
        }
        self
    }

    /// Replace the state from any serializable value
    pub fn try_with_state<T: serde::Serialize + ?Sized>(
        self,
        new_state: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(self.with_state(serde_json::to_value(new_state)?))
    }

    /// Reschedule the next execution
    ///
    /// Only meaningful for [`ExecutionResult::Rerun`]; other variants are returned unchanged.
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        if let Self::Rerun { schedule_time, .. } = &mut self {
            *schedule_time = Some(time);
        }
        self
    }

    /// Spawn one more step
    pub fn with(mut self, step: Step) -> Self {
        self.new_steps_mut().push(step);
        self
    }

    /// Spawn several steps
    pub fn with_steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.new_steps_mut().extend(steps);
        self
    }

    /// Steps spawned by this result
    pub fn new_steps(&self) -> &[Step] {
        match self {
            Self::Done { new_steps }
            | Self::Rerun { new_steps, .. }
            | Self::Fail { new_steps, .. } => new_steps,
        }
    }

    fn new_steps_mut(&mut self) -> &mut Vec<Step> {
        match self {
            Self::Done { new_steps }
            | Self::Rerun { new_steps, .. }
            | Self::Fail { new_steps, .. } => new_steps,
        }
    }

    /// Take the spawned steps out of the result
    pub fn take_new_steps(&mut self) -> Vec<Step> {
        std::mem::take(self.new_steps_mut())
    }
}

/// Error raised by handler code
///
/// `FailCurrentStep` is an intentional business failure and moves the step to
/// the failed partition. Any other error is an unexpected fault: the step is
/// rerun with its state untouched.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Fail the executing step now
    #[error("{description}")]
    FailCurrentStep {
        description: String,
        new_steps: Vec<Step>,
    },

    /// Unexpected fault, the step will be retried
    #[error("{0}")]
    Fault(String),
}

impl StepError {
    pub fn fail_current_step(description: impl Into<String>) -> Self {
        Self::FailCurrentStep {
            description: description.into(),
            new_steps: vec![],
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self::Fault(message.into())
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::Fault(err.to_string())
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        Self::Fault(err.to_string())
    }
}

impl From<FormatterError> for StepError {
    fn from(err: FormatterError) -> Self {
        Self::Fault(err.to_string())
    }
}
