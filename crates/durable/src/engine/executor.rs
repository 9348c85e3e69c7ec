//! Workflow engine: a pool of workers over one persister
//!
//! The `WorkflowEngine` is responsible for:
//! - Owning the persister, formatter and handler registry shared by all workers
//! - Exposing the orchestration API through [`WorkflowRuntimeData`]
//! - Starting workers and stopping them cooperatively

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::registry::StepHandlerRegistry;
use crate::formatter::StateFormatter;
use crate::persistence::StepPersister;
use crate::runtime::WorkflowRuntimeData;
use crate::worker::{Worker, WorkerConfig, WorkerError};

/// Configuration for the workflow engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Number of concurrent workers, at least 1
    pub worker_count: usize,

    /// Worker ids are `<prefix>-<n>`
    pub worker_id_prefix: String,

    pub worker: WorkerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            worker_id_prefix: "worker".to_string(),
            worker: WorkerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new engine configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Read configuration from `STEPWORKS_*` environment variables
    ///
    /// Unset or unparsable variables fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let worker_count = std::env::var("STEPWORKS_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.worker_count);

        let poll_interval = std::env::var("STEPWORKS_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.worker.poll_interval);

        let stop_when_idle = std::env::var("STEPWORKS_STOP_WHEN_IDLE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.worker.stop_when_no_immediate_work);

        let worker_id_prefix = std::env::var("STEPWORKS_WORKER_ID_PREFIX")
            .unwrap_or(defaults.worker_id_prefix);

        Self::new()
            .with_worker_count(worker_count)
            .with_worker_id_prefix(worker_id_prefix)
            .with_worker(
                WorkerConfig::new()
                    .with_poll_interval(poll_interval)
                    .stop_when_no_immediate_work(stop_when_idle),
            )
    }

    /// Set worker count
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_worker_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_id_prefix = prefix.into();
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }
}

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A worker stopped on a fatal error
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    /// A worker task panicked or was aborted
    #[error("worker task failed: {0}")]
    WorkerTask(String),
}

/// Handle to running workers
///
/// Dropping the handle does not stop the workers; call [`stop`](Self::stop).
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    workers: JoinSet<Result<(), WorkerError>>,
}

impl EngineHandle {
    /// Ask every worker to finish its current step and exit
    pub fn stop(&self) {
        info!("stopping workers");
        // Err only means every worker already exited
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for every worker to exit
    ///
    /// The first worker error stops the remaining workers and is returned
    /// once all of them have exited. Cancel safe: a dropped `join` can be
    /// called again.
    pub async fn join(&mut self) -> Result<(), EngineError> {
        let mut first_error = None;

        while let Some(joined) = self.workers.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => EngineError::Worker(e),
                Err(e) => EngineError::WorkerTask(e.to_string()),
            };

            if first_error.is_none() {
                error!(error = %failure, "worker failed, stopping the others");
                let _ = self.shutdown_tx.send(true);
                first_error = Some(failure);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop the workers and wait for them
    pub async fn shutdown(mut self) -> Result<(), EngineError> {
        self.stop();
        self.join().await
    }
}

/// Step engine over a [`StepPersister`]
///
/// # Example
///
/// ```ignore
/// let engine = WorkflowEngine::new(Arc::new(persister), Arc::new(JsonStateFormatter), registry);
/// engine.data().add_step(Step::new("OneStep").with_state(1234), None).await?;
///
/// // Drain everything that is due, then return
/// let config = EngineConfig::new()
///     .with_worker(WorkerConfig::new().stop_when_no_immediate_work(true));
/// engine.run(&config).await?;
/// ```
pub struct WorkflowEngine<P: StepPersister> {
    data: WorkflowRuntimeData<P>,
    registry: Arc<StepHandlerRegistry>,
}

impl<P: StepPersister> Clone for WorkflowEngine<P> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<P: StepPersister> WorkflowEngine<P> {
    pub fn new(
        persister: Arc<P>,
        formatter: Arc<dyn StateFormatter>,
        registry: StepHandlerRegistry,
    ) -> Self {
        Self {
            data: WorkflowRuntimeData::new(persister, formatter),
            registry: Arc::new(registry),
        }
    }

    /// Orchestration API over the same persister and formatter
    pub fn data(&self) -> &WorkflowRuntimeData<P> {
        &self.data
    }

    pub fn registry(&self) -> &StepHandlerRegistry {
        &self.registry
    }

    /// Build a standalone worker, e.g. to drive single polls from tests
    pub fn worker(&self, id: impl Into<String>, config: WorkerConfig) -> Worker<P> {
        Worker::new(id, self.data.clone(), Arc::clone(&self.registry), config)
    }

    /// Spawn the configured workers on the current tokio runtime
    pub fn start(&self, config: &EngineConfig) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = JoinSet::new();

        let count = config.worker_count.max(1);
        for n in 1..=count {
            let id = format!("{}-{}", config.worker_id_prefix, n);
            let worker = self
                .worker(id, config.worker.clone())
                .with_shutdown(shutdown_rx.clone());
            workers.spawn(async move { worker.run().await });
        }

        info!(
            workers = count,
            handlers = self.registry.len(),
            stop_when_idle = config.worker.stop_when_no_immediate_work,
            "engine started"
        );

        EngineHandle {
            shutdown_tx,
            workers,
        }
    }

    /// Run the workers until they all exit
    pub async fn run(&self, config: &EngineConfig) -> Result<(), EngineError> {
        self.start(config).join().await
    }
}
