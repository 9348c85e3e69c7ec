//! In-memory implementation of StepPersister for testing

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::trace;

use super::store::*;
use crate::step::{SearchModel, Step, StepId, StepStatus};

type Partition = BTreeMap<StepId, Step>;

/// How long `update`, `delete` and `lock_step` wait for a row held by
/// another transaction
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Committed state shared by all transactions
#[derive(Default)]
struct MemState {
    partitions: HashMap<StepStatus, Partition>,
    /// Row locks: step id -> owning transaction, from claims and writes alike
    claims: HashMap<StepId, u64>,
}

impl MemState {
    fn partition(&self, status: StepStatus) -> Option<&Partition> {
        self.partitions.get(&status)
    }
}

/// Change recorded by an open transaction
#[derive(Debug, Clone)]
enum PendingOp {
    Insert(StepStatus, Step),
    Update(StepStatus, Step),
    Delete(StepStatus, StepId),
}

impl PendingOp {
    fn status(&self) -> StepStatus {
        match self {
            Self::Insert(s, _) | Self::Update(s, _) | Self::Delete(s, _) => *s,
        }
    }
}

/// Apply one change; updates and deletes must hit an existing row
fn apply(partitions: &mut HashMap<StepStatus, Partition>, op: &PendingOp) -> Result<(), StepId> {
    match op {
        PendingOp::Insert(status, step) => {
            partitions
                .entry(*status)
                .or_default()
                .insert(step.id, step.clone());
        }
        PendingOp::Update(status, step) => {
            let existing = partitions
                .get_mut(status)
                .and_then(|p| p.get_mut(&step.id))
                .ok_or(step.id)?;
            *existing = step.clone();
        }
        PendingOp::Delete(status, id) => {
            partitions
                .get_mut(status)
                .and_then(|p| p.remove(id))
                .ok_or(*id)?;
        }
    }
    Ok(())
}

fn singleton_conflict<'a>(
    ready: impl IntoIterator<Item = &'a Step>,
    name: &str,
    own_id: StepId,
) -> bool {
    ready
        .into_iter()
        .any(|s| s.singleton && s.name == name && s.id != own_id)
}

/// Transaction of the [`InMemoryStepPersister`]
///
/// Changes are buffered and applied at commit. Dropping the transaction
/// discards them and releases its claims.
pub struct MemoryTransaction {
    id: u64,
    ops: Vec<PendingOp>,
    state: Arc<RwLock<MemState>>,
    released: Arc<Notify>,
}

impl MemoryTransaction {
    /// Committed partition overlaid with this transaction's own changes
    fn view(&self, status: StepStatus) -> Partition {
        let state = self.state.read();
        let mut partitions = HashMap::new();
        if let Some(p) = state.partition(status) {
            partitions.insert(status, p.clone());
        }
        drop(state);

        for op in self.ops.iter().filter(|op| op.status() == status) {
            // Own ops only touch rows this transaction holds, so they apply
            let _ = apply(&mut partitions, op);
        }

        partitions.remove(&status).unwrap_or_default()
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        let tx_id = self.id;
        self.state.write().claims.retain(|_, owner| *owner != tx_id);
        self.released.notify_waiters();
    }
}

/// In-memory implementation of StepPersister
///
/// This is primarily for testing. It provides the same semantics as the
/// PostgreSQL implementation: atomic commits, read-committed isolation,
/// exclusive claims and singleton uniqueness in the ready partition.
///
/// Writes take row locks the way PostgreSQL does: `update`, `delete` and
/// `lock_step` wait for a row another transaction holds, and claims skip rows
/// any other transaction holds.
///
/// # Example
///
/// ```
/// use stepworks_durable::InMemoryStepPersister;
///
/// let persister = InMemoryStepPersister::new();
/// ```
pub struct InMemoryStepPersister {
    state: Arc<RwLock<MemState>>,
    released: Arc<Notify>,
    lock_timeout: Duration,
    next_step_id: AtomicI64,
    next_tx_id: AtomicU64,
}

impl InMemoryStepPersister {
    /// Create a new in-memory persister
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemState::default())),
            released: Arc::new(Notify::new()),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            next_step_id: AtomicI64::new(1),
            next_tx_id: AtomicU64::new(1),
        }
    }

    /// Give up with [`StoreError::Locked`] after waiting this long for a row
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Take the row lock on `id` for `tx`, waiting while another transaction
    /// holds it
    async fn lock_row(&self, tx: &MemoryTransaction, id: StepId) -> Result<(), StoreError> {
        let deadline = tokio::time::Instant::now() + self.lock_timeout;
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // Register before checking so a release in between is not missed
            released.as_mut().enable();

            {
                let mut state = self.state.write();
                match state.claims.get(&id) {
                    Some(owner) if *owner != tx.id => {}
                    _ => {
                        state.claims.insert(id, tx.id);
                        return Ok(());
                    }
                }
            }

            trace!(step_id = id, tx_id = tx.id, "waiting for row lock");
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(StoreError::Locked(id));
            }
        }
    }

    /// Number of committed steps in a partition
    pub fn step_count(&self, status: StepStatus) -> usize {
        self.state.read().partition(status).map_or(0, |p| p.len())
    }

    /// Committed steps of a partition, ordered by id
    pub fn snapshot(&self, status: StepStatus) -> Vec<Step> {
        self.state
            .read()
            .partition(status)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.partitions.clear();
        state.claims.clear();
    }
}

impl Default for InMemoryStepPersister {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepPersister for InMemoryStepPersister {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        Ok(MemoryTransaction {
            id: self.next_tx_id.fetch_add(1, Ordering::Relaxed),
            ops: vec![],
            state: Arc::clone(&self.state),
            released: Arc::clone(&self.released),
        })
    }

    async fn commit(&self, mut tx: MemoryTransaction) -> Result<(), StoreError> {
        let ops = std::mem::take(&mut tx.ops);
        let mut state = self.state.write();

        let mut partitions = state.partitions.clone();
        for op in &ops {
            apply(&mut partitions, op).map_err(StoreError::StepNotFound)?;
        }

        // Another transaction may have committed the same singleton meanwhile
        if let Some(ready) = partitions.get(&StepStatus::Ready) {
            for op in &ops {
                if let PendingOp::Insert(StepStatus::Ready, step) = op {
                    if step.singleton && singleton_conflict(ready.values(), &step.name, step.id) {
                        return Err(StoreError::SingletonViolation {
                            name: step.name.clone(),
                        });
                    }
                }
            }
        }

        state.partitions = partitions;
        trace!(tx_id = tx.id, ops = ops.len(), "committed transaction");
        Ok(())
    }

    async fn insert(
        &self,
        tx: &mut MemoryTransaction,
        status: StepStatus,
        steps: &[Step],
    ) -> Result<Vec<StepId>, StoreError> {
        let mut staged = Vec::with_capacity(steps.len());

        if status == StepStatus::Ready {
            let ready = tx.view(StepStatus::Ready);
            for (i, step) in steps.iter().enumerate() {
                if !step.singleton {
                    continue;
                }
                let in_batch = steps[..i]
                    .iter()
                    .any(|s| s.singleton && s.name == step.name);
                if in_batch || singleton_conflict(ready.values(), &step.name, step.id) {
                    return Err(StoreError::SingletonViolation {
                        name: step.name.clone(),
                    });
                }
            }
        }

        for step in steps {
            let mut step = step.clone();
            if step.id == 0 {
                step.id = self.next_step_id.fetch_add(1, Ordering::Relaxed);
            }
            staged.push(step);
        }

        let ids = staged.iter().map(|s| s.id).collect();
        tx.ops
            .extend(staged.into_iter().map(|s| PendingOp::Insert(status, s)));
        Ok(ids)
    }

    async fn update(
        &self,
        tx: &mut MemoryTransaction,
        status: StepStatus,
        step: &Step,
    ) -> Result<u64, StoreError> {
        self.lock_row(tx, step.id).await?;

        if !tx.view(status).contains_key(&step.id) {
            return Ok(0);
        }

        tx.ops.push(PendingOp::Update(status, step.clone()));
        Ok(1)
    }

    async fn delete(
        &self,
        tx: &mut MemoryTransaction,
        status: StepStatus,
        id: StepId,
    ) -> Result<u64, StoreError> {
        self.lock_row(tx, id).await?;

        if !tx.view(status).contains_key(&id) {
            return Ok(0);
        }

        tx.ops.push(PendingOp::Delete(status, id));
        Ok(1)
    }

    async fn lock_step(
        &self,
        tx: &mut MemoryTransaction,
        status: StepStatus,
        id: StepId,
    ) -> Result<Option<Step>, StoreError> {
        self.lock_row(tx, id).await?;
        Ok(tx.view(status).remove(&id))
    }

    async fn search_steps(
        &self,
        tx: &mut MemoryTransaction,
        criteria: &SearchModel,
        status: StepStatus,
    ) -> Result<Vec<Step>, StoreError> {
        Ok(tx
            .view(status)
            .into_values()
            .filter(|s| criteria.matches(s))
            .collect())
    }

    async fn claim_ready(
        &self,
        tx: &mut MemoryTransaction,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Step>, StoreError> {
        let ready = tx.view(StepStatus::Ready);
        let mut state = self.state.write();

        let mut due: Vec<Step> = ready
            .into_values()
            .filter(|s| s.is_due(now) && !state.claims.contains_key(&s.id))
            .collect();
        due.sort_by(|a, b| {
            a.schedule_time
                .cmp(&b.schedule_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        due.truncate(limit);

        for step in &due {
            state.claims.insert(step.id, tx.id);
        }

        if !due.is_empty() {
            trace!(worker_id, count = due.len(), "claimed steps");
        }
        Ok(due)
    }
}
