//! Search criteria and partition selection

use serde::{Deserialize, Serialize};

use super::{Step, StepId, StepStatus};

/// Criteria for reading steps
///
/// Unset fields match everything; set fields must all match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchModel {
    pub id: Option<StepId>,
    pub name: Option<String>,
    pub flow_id: Option<String>,
    pub correlation_id: Option<String>,
    pub search_key: Option<String>,
    pub created_by_step_id: Option<StepId>,
}

impl SearchModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: StepId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn by_flow_id(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: Some(flow_id.into()),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
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

    pub fn with_created_by(mut self, step_id: StepId) -> Self {
        self.created_by_step_id = Some(step_id);
        self
    }

    /// Whether `step` satisfies every set criterion
    pub fn matches(&self, step: &Step) -> bool {
        fn eq(criterion: &Option<String>, value: &Option<String>) -> bool {
            match criterion {
                Some(c) => value.as_deref() == Some(c.as_str()),
                None => true,
            }
        }

        self.id.map_or(true, |id| step.id == id)
            && self.name.as_ref().map_or(true, |n| &step.name == n)
            && eq(&self.flow_id, &step.flow_id)
            && eq(&self.correlation_id, &step.correlation_id)
            && eq(&self.search_key, &step.search_key)
            && self
                .created_by_step_id
                .map_or(true, |id| step.created_by_step_id == id)
    }
}

/// Which partitions a search reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchLevels {
    pub ready: bool,
    pub done: bool,
    pub failed: bool,
}

impl FetchLevels {
    pub const ALL: FetchLevels = FetchLevels {
        ready: true,
        done: true,
        failed: true,
    };

    /// Done and failed, the partitions that can be re-executed
    pub const NON_READY: FetchLevels = FetchLevels {
        ready: false,
        done: true,
        failed: true,
    };

    pub const READY: FetchLevels = FetchLevels::only(StepStatus::Ready);
    pub const DONE: FetchLevels = FetchLevels::only(StepStatus::Done);
    pub const FAILED: FetchLevels = FetchLevels::only(StepStatus::Failed);

    /// Select a single partition
    pub const fn only(status: StepStatus) -> Self {
        Self {
            ready: matches!(status, StepStatus::Ready),
            done: matches!(status, StepStatus::Done),
            failed: matches!(status, StepStatus::Failed),
        }
    }

    pub fn includes(&self, status: StepStatus) -> bool {
        match status {
            StepStatus::Ready => self.ready,
            StepStatus::Done => self.done,
            StepStatus::Failed => self.failed,
        }
    }

    /// Selected partitions in storage order
    pub fn statuses(&self) -> impl Iterator<Item = StepStatus> + '_ {
        StepStatus::ALL.into_iter().filter(|s| self.includes(*s))
    }
}

impl From<StepStatus> for FetchLevels {
    fn from(status: StepStatus) -> Self {
        Self::only(status)
    }
}

/// Number of steps per partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounts {
    pub ready: usize,
    pub done: usize,
    pub failed: usize,
}

impl StepCounts {
    pub fn new(ready: usize, done: usize, failed: usize) -> Self {
        Self {
            ready,
            done,
            failed,
        }
    }

    pub fn get(&self, status: StepStatus) -> usize {
        match status {
            StepStatus::Ready => self.ready,
            StepStatus::Done => self.done,
            StepStatus::Failed => self.failed,
        }
    }

    pub(crate) fn set(&mut self, status: StepStatus, count: usize) {
        match status {
            StepStatus::Ready => self.ready = count,
            StepStatus::Done => self.done = count,
            StepStatus::Failed => self.failed = count,
        }
    }

    pub fn total(&self) -> usize {
        self.ready + self.done + self.failed
    }
}
