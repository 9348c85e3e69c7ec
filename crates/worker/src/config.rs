// Decision: Host settings come from the environment; only DATABASE_URL is mandatory

use std::time::Duration;

use stepworks_durable::EngineConfig;
use uuid::Uuid;

/// Errors from reading host configuration
#[derive(Debug, thiserror::Error)]
pub enum HostConfigError {
    #[error("DATABASE_URL is not set")]
    MissingDatabaseUrl,
}

/// Configuration for the worker host
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// PostgreSQL connection string
    pub database_url: String,
    /// Connection pool size
    pub max_connections: u32,
    /// Run migrations on startup
    pub run_migrations: bool,
    /// Seed the heartbeat singleton on startup
    pub seed_heartbeat: bool,
    /// Delay between heartbeat executions
    pub heartbeat_interval: Duration,
    pub engine: EngineConfig,
}

impl HostConfig {
    /// Default settings around a connection string
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            run_migrations: true,
            seed_heartbeat: true,
            heartbeat_interval: Duration::from_secs(60),
            engine: EngineConfig::default().with_worker_id_prefix(default_worker_prefix()),
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, HostConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| HostConfigError::MissingDatabaseUrl)?;
        let defaults = Self::new(database_url);

        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_connections);

        let run_migrations = std::env::var("STEPWORKS_RUN_MIGRATIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.run_migrations);

        let seed_heartbeat = std::env::var("STEPWORKS_HEARTBEAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.seed_heartbeat);

        let heartbeat_interval = std::env::var("STEPWORKS_HEARTBEAT_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_interval);

        let mut engine = EngineConfig::from_env();
        if std::env::var("STEPWORKS_WORKER_ID_PREFIX").is_err() {
            engine.worker_id_prefix = defaults.engine.worker_id_prefix.clone();
        }

        Ok(Self {
            max_connections,
            run_migrations,
            seed_heartbeat,
            heartbeat_interval,
            engine,
            ..defaults
        })
    }
}

/// Unique per process so that `executed_by` tells hosts apart
fn default_worker_prefix() -> String {
    format!("worker-{}", Uuid::now_v7())
}
