//! Poll pacing and worker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Sleep between polls that found no due step
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Exit as soon as a poll finds no due step
    pub stop_when_no_immediate_work: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            stop_when_no_immediate_work: false,
        }
    }
}

impl WorkerConfig {
    /// Create a new worker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Stop once there is nothing due, for batch runs and tests
    pub fn stop_when_no_immediate_work(mut self, stop: bool) -> Self {
        self.stop_when_no_immediate_work = stop;
        self
    }
}

/// Sleeps between idle polls, waking early on shutdown
pub(crate) struct Poller {
    interval: Duration,
    shutdown_rx: Option<watch::Receiver<bool>>,
}

impl Poller {
    pub(crate) fn new(interval: Duration, shutdown_rx: Option<watch::Receiver<bool>>) -> Self {
        Self {
            interval,
            shutdown_rx,
        }
    }

    /// Check if shutdown has been requested
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown_rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Wait for the poll interval
    ///
    /// Returns `true` if shutdown was signaled while waiting.
    pub(crate) async fn wait(&self) -> bool {
        let Some(rx) = &self.shutdown_rx else {
            tokio::time::sleep(self.interval).await;
            return false;
        };

        let mut shutdown_rx = rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.interval) => false,
            _ = shutdown_rx.wait_for(|stop| *stop) => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
