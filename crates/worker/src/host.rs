// Decision: Each host seeds the heartbeat; the singleton constraint keeps one copy

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use stepworks_durable::engine::NamedStepHandler;
use stepworks_durable::{
    EngineHandle, JsonStateFormatter, PostgresStepPersister, RuntimeError, Step,
    StepHandlerRegistry, StepId, StepPersister, WorkflowEngine, WorkflowRuntimeData,
};
use tracing::{error, info};

use crate::config::HostConfig;
use crate::heartbeat::Heartbeat;

/// Handlers served by this host
pub fn build_registry(config: &HostConfig) -> StepHandlerRegistry {
    let mut registry = StepHandlerRegistry::new();
    registry.register_named(Heartbeat::new(config.heartbeat_interval));
    registry
}

/// Add the heartbeat step unless a ready copy already exists
///
/// Returns `None` when another host seeded it first.
pub async fn seed_heartbeat<P: StepPersister>(
    data: &WorkflowRuntimeData<P>,
) -> Result<Option<StepId>, RuntimeError> {
    let step = Step::new(Heartbeat::NAME)
        .singleton()
        .with_description("periodic liveness beat");

    match data.add_step(step, None).await {
        Ok(id) => {
            info!(step_id = id, "heartbeat seeded");
            Ok(Some(id))
        }
        Err(e) if e.is_singleton_violation() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Engine plus host configuration
pub struct WorkerHost<P: StepPersister> {
    engine: WorkflowEngine<P>,
    config: HostConfig,
}

impl WorkerHost<PostgresStepPersister> {
    /// Connect to PostgreSQL and prepare the schema
    pub async fn connect(config: HostConfig) -> Result<Self> {
        info!(max_connections = config.max_connections, "connecting to database");

        let persister =
            PostgresStepPersister::connect(&config.database_url, config.max_connections)
                .await
                .context("Failed to connect to database")?;

        if config.run_migrations {
            persister
                .migrate()
                .await
                .context("Failed to run migrations")?;
            info!("migrations applied");
        }

        Ok(Self::with_persister(Arc::new(persister), config))
    }
}

impl<P: StepPersister> WorkerHost<P> {
    pub fn with_persister(persister: Arc<P>, config: HostConfig) -> Self {
        let registry = build_registry(&config);
        let engine = WorkflowEngine::new(persister, Arc::new(JsonStateFormatter), registry);
        Self { engine, config }
    }

    pub fn engine(&self) -> &WorkflowEngine<P> {
        &self.engine
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Seed built-in steps and spawn the workers
    pub async fn start(&self) -> Result<EngineHandle> {
        if self.config.seed_heartbeat {
            seed_heartbeat(self.engine.data())
                .await
                .context("Failed to seed heartbeat")?;
        }

        Ok(self.engine.start(&self.config.engine))
    }

    /// Run until the workers exit on their own or `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut handle = self.start().await?;

        let finished = tokio::select! {
            result = handle.join() => Some(result),
            _ = shutdown => None,
        };

        match finished {
            Some(result) => {
                if let Err(e) = &result {
                    error!(error = %e, "workers stopped on error");
                }
                result.context("Worker pool failed")
            }
            None => {
                info!("received shutdown signal");
                handle.shutdown().await.context("Worker pool failed")
            }
        }
    }
}
