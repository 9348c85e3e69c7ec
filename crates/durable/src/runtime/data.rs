//! WorkflowRuntimeData implementation

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, Level};
use uuid::Uuid;

use crate::formatter::{FormatterError, StateFormatter};
use crate::persistence::{StepPersister, StoreError};
use crate::step::{
    truncate_to_seconds, FetchLevels, SearchModel, Step, StepCounts, StepId, StepStatus,
};

/// Errors from runtime operations
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The step cannot be persisted as given
    #[error("invalid step: {0}")]
    Validation(String),

    #[error("no formatter registered for format name '{found}' (active formatter is '{expected}')")]
    StateFormatMismatch { expected: String, found: String },

    #[error(transparent)]
    Formatter(#[from] FormatterError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RuntimeError {
    pub fn is_singleton_violation(&self) -> bool {
        matches!(self, Self::Store(StoreError::SingletonViolation { .. }))
    }
}

/// A caller's transaction, or one opened for a single operation
enum TxScope<'a, T> {
    Joined(&'a mut T),
    Own(T),
}

impl<T> TxScope<'_, T> {
    fn tx(&mut self) -> &mut T {
        match self {
            TxScope::Joined(tx) => &mut **tx,
            TxScope::Own(tx) => tx,
        }
    }
}

/// Orchestration API over a [`StepPersister`]
///
/// Operations given `None` open and commit their own transaction. Given a
/// caller transaction they join it and leave committing to the caller; an
/// error then leaves the transaction for the caller to drop.
pub struct WorkflowRuntimeData<P: StepPersister> {
    persister: Arc<P>,
    formatter: Arc<dyn StateFormatter>,
}

impl<P: StepPersister> Clone for WorkflowRuntimeData<P> {
    fn clone(&self) -> Self {
        Self {
            persister: Arc::clone(&self.persister),
            formatter: Arc::clone(&self.formatter),
        }
    }
}

impl<P: StepPersister> WorkflowRuntimeData<P> {
    pub fn new(persister: Arc<P>, formatter: Arc<dyn StateFormatter>) -> Self {
        Self {
            persister,
            formatter,
        }
    }

    pub fn persister(&self) -> &Arc<P> {
        &self.persister
    }

    pub fn formatter(&self) -> &Arc<dyn StateFormatter> {
        &self.formatter
    }

    /// Open a transaction to pass to several operations
    pub async fn begin(&self) -> Result<P::Transaction, RuntimeError> {
        Ok(self.persister.begin().await?)
    }

    pub async fn commit(&self, tx: P::Transaction) -> Result<(), RuntimeError> {
        Ok(self.persister.commit(tx).await?)
    }

    async fn scope<'a>(
        &self,
        tx: Option<&'a mut P::Transaction>,
    ) -> Result<TxScope<'a, P::Transaction>, StoreError> {
        Ok(match tx {
            Some(tx) => TxScope::Joined(tx),
            None => TxScope::Own(self.persister.begin().await?),
        })
    }

    async fn finish(&self, scope: TxScope<'_, P::Transaction>) -> Result<(), StoreError> {
        if let TxScope::Own(tx) = scope {
            self.persister.commit(tx).await?;
        }
        Ok(())
    }

    /// Prepare a new step for insertion
    ///
    /// Fills in provenance, inherits flow and correlation ids from `origin`,
    /// defaults the schedule time to `now` and serializes the initial state.
    pub fn fixup_new_step(
        &self,
        origin: Option<&Step>,
        mut step: Step,
        now: DateTime<Utc>,
    ) -> Result<Step, RuntimeError> {
        if step.name.is_empty() {
            return Err(RuntimeError::Validation(
                "step name cannot be empty".to_string(),
            ));
        }

        step.created_time = Some(now);
        step.created_by_step_id = origin.map_or(0, |o| o.id);

        if step.flow_id.is_none() {
            step.flow_id = Some(
                origin
                    .and_then(|o| o.flow_id.clone())
                    .unwrap_or_else(|| Uuid::now_v7().to_string()),
            );
        }
        if step.correlation_id.is_none() {
            step.correlation_id = origin.and_then(|o| o.correlation_id.clone());
        }
        if step.schedule_time.is_none() {
            step.schedule_time = Some(truncate_to_seconds(now));
        }

        self.format_state(&mut step)?;
        Ok(step)
    }

    fn format_state(&self, step: &mut Step) -> Result<(), RuntimeError> {
        let Some(initial) = step.initial_state.as_ref() else {
            step.state = None;
            return Ok(());
        };

        let active = self.formatter.name();
        match step.state_format.as_deref() {
            Some(found) if found != active => {
                return Err(RuntimeError::StateFormatMismatch {
                    expected: active.to_string(),
                    found: found.to_string(),
                });
            }
            _ => {}
        }

        step.state = Some(self.formatter.serialize_value(initial)?);
        step.state_format = Some(active.to_string());
        Ok(())
    }

    /// Add a step to the ready partition, returning its id
    pub async fn add_step(
        &self,
        step: Step,
        tx: Option<&mut P::Transaction>,
    ) -> Result<StepId, RuntimeError> {
        let ids = self.add_steps(vec![step], tx).await?;
        ids.into_iter().next().ok_or_else(|| {
            RuntimeError::Store(StoreError::Database("insert returned no id".to_string()))
        })
    }

    /// Add steps to the ready partition in one insert
    ///
    /// Every step is validated before anything is written. A singleton
    /// violation fails the whole batch.
    #[instrument(skip_all)]
    pub async fn add_steps(
        &self,
        steps: impl IntoIterator<Item = Step>,
        tx: Option<&mut P::Transaction>,
    ) -> Result<Vec<StepId>, RuntimeError> {
        let now = Utc::now();
        let steps = steps
            .into_iter()
            .map(|s| self.fixup_new_step(None, s, now))
            .collect::<Result<Vec<_>, _>>()?;

        let mut scope = self.scope(tx).await?;
        let ids = self
            .persister
            .insert(scope.tx(), StepStatus::Ready, &steps)
            .await?;
        self.finish(scope).await?;

        debug!(?ids, "added steps");
        Ok(ids)
    }

    /// Make a ready step due now and attach activation arguments
    ///
    /// Returns the number of steps updated, `0` when no ready step has this id.
    /// A step that is executing right now is activated once its worker commits.
    #[instrument(skip(self, args, tx))]
    pub async fn activate_step<T: Serialize + ?Sized>(
        &self,
        id: StepId,
        args: &T,
        tx: Option<&mut P::Transaction>,
    ) -> Result<u64, RuntimeError> {
        let args = self.formatter.encode(args)?;

        let mut scope = self.scope(tx).await?;
        let found = self
            .persister
            .lock_step(scope.tx(), StepStatus::Ready, id)
            .await?;

        let Some(mut step) = found else {
            self.finish(scope).await?;
            debug!(step_id = id, "no ready step to activate");
            return Ok(0);
        };

        step.schedule_time = Some(truncate_to_seconds(Utc::now()));
        step.activation_args = Some(args);
        let rows = self
            .persister
            .update(scope.tx(), StepStatus::Ready, &step)
            .await?;
        self.finish(scope).await?;

        debug!(step_id = id, step_name = %step.name, "activated step");
        Ok(rows)
    }

    /// Steps of one partition matching `criteria`
    pub async fn search_steps(
        &self,
        criteria: &SearchModel,
        status: StepStatus,
        tx: Option<&mut P::Transaction>,
    ) -> Result<Vec<Step>, RuntimeError> {
        let mut scope = self.scope(tx).await?;
        let steps = self
            .persister
            .search_steps(scope.tx(), criteria, status)
            .await?;
        self.finish(scope).await?;
        Ok(steps)
    }

    /// Steps of several partitions matching `criteria`, keyed by partition
    pub async fn search_steps_by_levels(
        &self,
        criteria: &SearchModel,
        levels: FetchLevels,
        tx: Option<&mut P::Transaction>,
    ) -> Result<BTreeMap<StepStatus, Vec<Step>>, RuntimeError> {
        let mut scope = self.scope(tx).await?;
        let steps = self
            .persister
            .search_steps_by_levels(scope.tx(), criteria, levels)
            .await?;
        self.finish(scope).await?;
        Ok(steps)
    }

    pub async fn count_steps(
        &self,
        criteria: &SearchModel,
        tx: Option<&mut P::Transaction>,
    ) -> Result<StepCounts, RuntimeError> {
        let mut scope = self.scope(tx).await?;
        let counts = self.persister.count_steps(scope.tx(), criteria).await?;
        self.finish(scope).await?;
        Ok(counts)
    }

    /// Run done or failed steps again
    ///
    /// Inserts a fresh ready clone of every matching done or failed step and
    /// returns the new ids. The originals stay where they are.
    #[instrument(skip(self, tx))]
    pub async fn re_execute_steps(
        &self,
        criteria: &SearchModel,
        tx: Option<&mut P::Transaction>,
    ) -> Result<Vec<StepId>, RuntimeError> {
        let now = Utc::now();

        let mut scope = self.scope(tx).await?;
        let originals = self
            .persister
            .search_steps_by_levels(scope.tx(), criteria, FetchLevels::NON_READY)
            .await?;

        let clones: Vec<Step> = originals
            .values()
            .flatten()
            .map(|original| Step {
                name: original.name.clone(),
                singleton: original.singleton,
                flow_id: original.flow_id.clone(),
                search_key: original.search_key.clone(),
                state: original.state.clone(),
                state_format: original.state_format.clone(),
                activation_args: original.activation_args.clone(),
                created_time: Some(now),
                created_by_step_id: original.id,
                schedule_time: Some(truncate_to_seconds(now)),
                correlation_id: original.correlation_id.clone(),
                description: Some(format!("Re-execution of step id: {}", original.id)),
                ..Default::default()
            })
            .collect();

        if tracing::enabled!(Level::INFO) {
            let original_ids: Vec<StepId> = clones.iter().map(|s| s.created_by_step_id).collect();
            info!(?original_ids, "re-executing steps");
        }

        let ids = self
            .persister
            .insert(scope.tx(), StepStatus::Ready, &clones)
            .await?;
        self.finish(scope).await?;
        Ok(ids)
    }

    /// Move a ready step to failed without executing it
    ///
    /// Returns `false` when no ready step has this id.
    #[instrument(skip(self, tx))]
    pub async fn fail_step(
        &self,
        id: StepId,
        tx: Option<&mut P::Transaction>,
    ) -> Result<bool, RuntimeError> {
        let mut scope = self.scope(tx).await?;
        // Waits out a worker executing the step; it may have moved it already
        let found = self
            .persister
            .lock_step(scope.tx(), StepStatus::Ready, id)
            .await?;

        let Some(step) = found else {
            self.finish(scope).await?;
            return Ok(false);
        };

        self.persister
            .delete(scope.tx(), StepStatus::Ready, id)
            .await?;
        self.persister
            .insert(scope.tx(), StepStatus::Failed, std::slice::from_ref(&step))
            .await?;
        self.finish(scope).await?;

        info!(step_id = id, step_name = %step.name, "step failed administratively");
        Ok(true)
    }
}
