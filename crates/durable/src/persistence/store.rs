//! StepPersister trait definition

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::step::{FetchLevels, SearchModel, Step, StepCounts, StepId, StepStatus};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A second ready step with a singleton name
    #[error("singleton step '{name}' is already ready")]
    SingletonViolation { name: String },

    /// Step not found in the expected partition
    #[error("step not found: {0}")]
    StepNotFound(StepId),

    /// Step stayed locked by another transaction past the lock timeout
    #[error("step {0} is locked by another transaction")]
    Locked(StepId),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the error is a constraint violation rather than a storage fault
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::SingletonViolation { .. })
    }
}

/// Status-partitioned step storage
///
/// Every operation runs inside a transaction obtained from [`begin`](Self::begin).
/// Nothing becomes visible to other transactions before [`commit`](Self::commit);
/// dropping a transaction without committing rolls it back. Implementations
/// must provide at least read-committed isolation and must be safe to share
/// between workers.
#[async_trait]
pub trait StepPersister: Send + Sync + 'static {
    /// Open transaction handle
    type Transaction: Send;

    /// Open a new transaction
    async fn begin(&self) -> Result<Self::Transaction, StoreError>;

    /// Commit a transaction, making all its changes visible at once
    async fn commit(&self, tx: Self::Transaction) -> Result<(), StoreError>;

    /// Insert steps into a partition
    ///
    /// Steps with `id == 0` get a fresh id; others keep theirs (moves between
    /// partitions preserve identity). Returns the ids in input order. Fails
    /// as a whole on a singleton violation.
    async fn insert(
        &self,
        tx: &mut Self::Transaction,
        status: StepStatus,
        steps: &[Step],
    ) -> Result<Vec<StepId>, StoreError>;

    /// Overwrite a step in place, returning the number of rows affected
    ///
    /// Waits for any other transaction holding the row.
    async fn update(
        &self,
        tx: &mut Self::Transaction,
        status: StepStatus,
        step: &Step,
    ) -> Result<u64, StoreError>;

    /// Remove a step from a partition, returning the number of rows affected
    ///
    /// Waits for any other transaction holding the row. A step that was moved
    /// out meanwhile is not an error: it simply affects no rows.
    async fn delete(
        &self,
        tx: &mut Self::Transaction,
        status: StepStatus,
        id: StepId,
    ) -> Result<u64, StoreError>;

    /// Lock one step for the rest of the transaction and read it
    ///
    /// Waits while another transaction (typically a worker executing the
    /// step) holds it, then returns the step as that transaction left it, or
    /// `None` when it is no longer in `status`. Claims from other
    /// transactions skip the step until this transaction ends.
    async fn lock_step(
        &self,
        tx: &mut Self::Transaction,
        status: StepStatus,
        id: StepId,
    ) -> Result<Option<Step>, StoreError>;

    /// Read the steps of one partition matching `criteria`, ordered by id
    async fn search_steps(
        &self,
        tx: &mut Self::Transaction,
        criteria: &SearchModel,
        status: StepStatus,
    ) -> Result<Vec<Step>, StoreError>;

    /// Read several partitions at once
    async fn search_steps_by_levels(
        &self,
        tx: &mut Self::Transaction,
        criteria: &SearchModel,
        levels: FetchLevels,
    ) -> Result<BTreeMap<StepStatus, Vec<Step>>, StoreError> {
        let mut result = BTreeMap::new();
        for status in levels.statuses() {
            let steps = self.search_steps(tx, criteria, status).await?;
            result.insert(status, steps);
        }
        Ok(result)
    }

    /// Count matching steps per partition
    async fn count_steps(
        &self,
        tx: &mut Self::Transaction,
        criteria: &SearchModel,
    ) -> Result<StepCounts, StoreError> {
        let mut counts = StepCounts::default();
        for status in StepStatus::ALL {
            let steps = self.search_steps(tx, criteria, status).await?;
            counts.set(status, steps.len());
        }
        Ok(counts)
    }

    /// Claim ready steps that are due at `now`
    ///
    /// Oldest schedule time first, ties broken by id. A claimed step is
    /// invisible to claims from other transactions until this transaction
    /// ends, so no two workers can execute the same step.
    async fn claim_ready(
        &self,
        tx: &mut Self::Transaction,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Step>, StoreError>;
}
