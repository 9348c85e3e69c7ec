//! PostgreSQL implementation of StepPersister
//!
//! Production persistence using PostgreSQL with:
//! - One table per status partition sharing an id sequence
//! - Exclusive claiming with `FOR UPDATE SKIP LOCKED`
//! - Singleton uniqueness enforced by a partial unique index

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, error, instrument};

use super::store::*;
use crate::step::{SearchModel, Step, StepCounts, StepId, StepStatus};

const COLUMNS: &str = "id, name, singleton, flow_id, search_key, state, state_format, \
    activation_args, execution_count, execution_duration_millis, execution_start_time, \
    executed_by, created_time, created_by_step_id, schedule_time, correlation_id, description";

/// Postgres error code for unique violations
const UNIQUE_VIOLATION: &str = "23505";

/// Partial unique index guarding singleton names in `steps_ready`
const SINGLETON_INDEX: &str = "idx_steps_ready_singleton";

fn table(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Ready => "steps_ready",
        StepStatus::Done => "steps_done",
        StepStatus::Failed => "steps_failed",
    }
}

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Whether an insert failed on the singleton index, as opposed to any other
/// unique constraint such as a primary key
fn is_singleton_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some(UNIQUE_VIOLATION)
                && db.constraint() == Some(SINGLETON_INDEX)
        }
        _ => false,
    }
}

fn step_from_row(row: &PgRow) -> Step {
    Step {
        id: row.get("id"),
        name: row.get("name"),
        singleton: row.get("singleton"),
        flow_id: row.get("flow_id"),
        search_key: row.get("search_key"),
        initial_state: None,
        state: row.get("state"),
        state_format: row.get("state_format"),
        activation_args: row.get("activation_args"),
        execution_count: row.get("execution_count"),
        execution_duration_millis: row.get("execution_duration_millis"),
        execution_start_time: row.get("execution_start_time"),
        executed_by: row.get("executed_by"),
        created_time: row.get("created_time"),
        created_by_step_id: row.get("created_by_step_id"),
        schedule_time: row.get("schedule_time"),
        correlation_id: row.get("correlation_id"),
        description: row.get("description"),
    }
}

fn push_criteria(qb: &mut QueryBuilder<'_, Postgres>, criteria: &SearchModel) {
    qb.push(" WHERE TRUE");
    if let Some(id) = criteria.id {
        qb.push(" AND id = ").push_bind(id);
    }
    if let Some(name) = &criteria.name {
        qb.push(" AND name = ").push_bind(name.clone());
    }
    if let Some(flow_id) = &criteria.flow_id {
        qb.push(" AND flow_id = ").push_bind(flow_id.clone());
    }
    if let Some(correlation_id) = &criteria.correlation_id {
        qb.push(" AND correlation_id = ").push_bind(correlation_id.clone());
    }
    if let Some(search_key) = &criteria.search_key {
        qb.push(" AND search_key = ").push_bind(search_key.clone());
    }
    if let Some(created_by) = criteria.created_by_step_id {
        qb.push(" AND created_by_step_id = ").push_bind(created_by);
    }
}

/// PostgreSQL implementation of StepPersister
///
/// Uses a connection pool; every transaction holds one connection until it is
/// committed or dropped.
///
/// # Example
///
/// ```ignore
/// use stepworks_durable::PostgresStepPersister;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let persister = PostgresStepPersister::new(pool);
/// persister.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStepPersister {
    pool: PgPool,
}

impl PostgresStepPersister {
    /// Create a new persister with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a pool of at most `max_connections`
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {}", e);
                db_error(e)
            })?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the step tables if they do not exist
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

#[async_trait]
impl StepPersister for PostgresStepPersister {
    type Transaction = sqlx::Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        self.pool.begin().await.map_err(db_error)
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), StoreError> {
        tx.commit().await.map_err(db_error)
    }

    #[instrument(skip(self, tx, steps), fields(count = steps.len()))]
    async fn insert(
        &self,
        tx: &mut Self::Transaction,
        status: StepStatus,
        steps: &[Step],
    ) -> Result<Vec<StepId>, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {} ({COLUMNS})
            VALUES (COALESCE($1, nextval('step_id_seq')), $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, COALESCE($13, NOW()), $14, COALESCE($15, NOW()), $16, $17)
            RETURNING id
            "#,
            table(status)
        );

        let mut ids = Vec::with_capacity(steps.len());
        for step in steps {
            let row = sqlx::query(&sql)
                .bind((step.id != 0).then_some(step.id))
                .bind(&step.name)
                .bind(step.singleton)
                .bind(&step.flow_id)
                .bind(&step.search_key)
                .bind(&step.state)
                .bind(&step.state_format)
                .bind(&step.activation_args)
                .bind(step.execution_count)
                .bind(step.execution_duration_millis)
                .bind(step.execution_start_time)
                .bind(&step.executed_by)
                .bind(step.created_time)
                .bind(step.created_by_step_id)
                .bind(step.schedule_time)
                .bind(&step.correlation_id)
                .bind(&step.description)
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| {
                    if is_singleton_violation(&e) {
                        StoreError::SingletonViolation {
                            name: step.name.clone(),
                        }
                    } else {
                        error!("Failed to insert step: {}", e);
                        db_error(e)
                    }
                })?;
            ids.push(row.get::<i64, _>("id"));
        }

        debug!(%status, ?ids, "inserted steps");
        Ok(ids)
    }

    #[instrument(skip(self, tx, step), fields(step_id = step.id))]
    async fn update(
        &self,
        tx: &mut Self::Transaction,
        status: StepStatus,
        step: &Step,
    ) -> Result<u64, StoreError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET name = $2, singleton = $3, flow_id = $4, search_key = $5, state = $6,
                state_format = $7, activation_args = $8, execution_count = $9,
                execution_duration_millis = $10, execution_start_time = $11, executed_by = $12,
                created_time = COALESCE($13, created_time), created_by_step_id = $14,
                schedule_time = COALESCE($15, schedule_time), correlation_id = $16,
                description = $17
            WHERE id = $1
            "#,
            table(status)
        );

        let result = sqlx::query(&sql)
            .bind(step.id)
            .bind(&step.name)
            .bind(step.singleton)
            .bind(&step.flow_id)
            .bind(&step.search_key)
            .bind(&step.state)
            .bind(&step.state_format)
            .bind(&step.activation_args)
            .bind(step.execution_count)
            .bind(step.execution_duration_millis)
            .bind(step.execution_start_time)
            .bind(&step.executed_by)
            .bind(step.created_time)
            .bind(step.created_by_step_id)
            .bind(step.schedule_time)
            .bind(&step.correlation_id)
            .bind(&step.description)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                error!("Failed to update step: {}", e);
                db_error(e)
            })?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, tx))]
    async fn delete(
        &self,
        tx: &mut Self::Transaction,
        status: StepStatus,
        id: StepId,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", table(status)))
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                error!("Failed to delete step: {}", e);
                db_error(e)
            })?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, tx))]
    async fn lock_step(
        &self,
        tx: &mut Self::Transaction,
        status: StepStatus,
        id: StepId,
    ) -> Result<Option<Step>, StoreError> {
        // Waits for a worker holding the row; reads the row as committed by it
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE id = $1 FOR UPDATE",
            table(status)
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| {
            error!("Failed to lock step: {}", e);
            db_error(e)
        })?;

        Ok(row.as_ref().map(step_from_row))
    }

    #[instrument(skip(self, tx))]
    async fn search_steps(
        &self,
        tx: &mut Self::Transaction,
        criteria: &SearchModel,
        status: StepStatus,
    ) -> Result<Vec<Step>, StoreError> {
        let mut qb = QueryBuilder::new(format!("SELECT {COLUMNS} FROM {}", table(status)));
        push_criteria(&mut qb, criteria);
        qb.push(" ORDER BY id");

        let rows = qb.build().fetch_all(&mut **tx).await.map_err(|e| {
            error!("Failed to search steps: {}", e);
            db_error(e)
        })?;

        Ok(rows.iter().map(step_from_row).collect())
    }

    #[instrument(skip(self, tx))]
    async fn count_steps(
        &self,
        tx: &mut Self::Transaction,
        criteria: &SearchModel,
    ) -> Result<StepCounts, StoreError> {
        let mut counts = StepCounts::default();
        for status in StepStatus::ALL {
            let mut qb = QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", table(status)));
            push_criteria(&mut qb, criteria);

            let count: i64 = qb
                .build_query_scalar()
                .fetch_one(&mut **tx)
                .await
                .map_err(db_error)?;
            counts.set(status, count as usize);
        }
        Ok(counts)
    }

    #[instrument(skip(self, tx))]
    async fn claim_ready(
        &self,
        tx: &mut Self::Transaction,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Step>, StoreError> {
        // Rows stay locked until the transaction ends; other claimers skip them
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM steps_ready
            WHERE schedule_time <= $1
            ORDER BY schedule_time, id
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| {
            error!("Failed to claim steps: {}", e);
            db_error(e)
        })?;

        let claimed: Vec<Step> = rows.iter().map(step_from_row).collect();
        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed steps");
        }
        Ok(claimed)
    }
}
