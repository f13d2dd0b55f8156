//! Worker and store configuration
//!
//! Supplied once at startup (flags or `OVERSEER_*` environment variables) and
//! immutable for the worker's lifetime.

use std::time::Duration;

use clap::Args;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Args)]
pub struct WorkerConfig {
    /// Worker identity recorded on claims (default: worker-<uuid>)
    #[arg(long, env = "OVERSEER_WORKER_ID")]
    pub worker_id: Option<String>,

    /// Ownership domain this worker serves; unset disables contract checks
    #[arg(long, env = "OVERSEER_SPECIALTY")]
    pub specialty: Option<String>,

    /// Upper bound on tasks examined per tick
    #[arg(long, env = "OVERSEER_MAX_TASKS_PER_TICK", default_value_t = 25)]
    pub max_tasks_per_tick: usize,

    /// Retries before a failing task is marked failed
    #[arg(long, env = "OVERSEER_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// First retry delay in seconds; doubles per retry
    #[arg(long, env = "OVERSEER_BACKOFF_BASE_SECS", default_value_t = 5)]
    pub backoff_base_secs: u64,

    /// Ceiling on the retry delay in seconds
    #[arg(long, env = "OVERSEER_BACKOFF_MAX_SECS", default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// Delay between ticks in milliseconds
    #[arg(long, env = "OVERSEER_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            specialty: None,
            max_tasks_per_tick: 25,
            max_retries: 3,
            backoff_base_secs: 5,
            backoff_max_secs: 300,
            poll_interval_ms: 1000,
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = Some(id.into());
        self
    }

    pub fn with_specialty(mut self, specialty: impl Into<String>) -> Self {
        self.specialty = Some(specialty.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, base_secs: u64, max_secs: u64) -> Self {
        self.backoff_base_secs = base_secs;
        self.backoff_max_secs = max_secs;
        self
    }

    /// The configured id, or a fresh random one
    pub fn resolve_worker_id(&self) -> String {
        self.worker_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tasks_per_tick == 0 {
            return Err(OrchestratorError::Config(
                "max_tasks_per_tick must be at least 1".to_string(),
            ));
        }
        if self.backoff_base_secs > self.backoff_max_secs {
            return Err(OrchestratorError::Config(format!(
                "backoff_base_secs ({}) exceeds backoff_max_secs ({})",
                self.backoff_base_secs, self.backoff_max_secs
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(OrchestratorError::Config(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Connection parameters for the SQLite store
#[derive(Debug, Clone, Args)]
pub struct StoreConfig {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:overseer.db?mode=rwc")]
    pub database_url: String,

    #[arg(long, env = "OVERSEER_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:overseer.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        worker: WorkerConfig,
        #[command(flatten)]
        store: StoreConfig,
    }

    #[test]
    fn test_defaults_match_cli_defaults() {
        let cli = TestCli::try_parse_from(["overseer"]).unwrap();
        let default = WorkerConfig::default();
        assert_eq!(cli.worker.max_tasks_per_tick, default.max_tasks_per_tick);
        assert_eq!(cli.worker.max_retries, default.max_retries);
        assert_eq!(cli.worker.backoff_base_secs, default.backoff_base_secs);
        assert_eq!(cli.worker.backoff_max_secs, default.backoff_max_secs);
        assert_eq!(cli.store.max_connections, StoreConfig::default().max_connections);
    }

    #[test]
    fn test_parse_flags() {
        let cli = TestCli::try_parse_from([
            "overseer",
            "--worker-id",
            "w-7",
            "--specialty",
            "infra",
            "--max-retries",
            "5",
        ])
        .unwrap();
        assert_eq!(cli.worker.worker_id.as_deref(), Some("w-7"));
        assert_eq!(cli.worker.specialty.as_deref(), Some("infra"));
        assert_eq!(cli.worker.max_retries, 5);
    }

    #[test]
    fn test_resolve_worker_id() {
        let config = WorkerConfig::default().with_worker_id("w-1");
        assert_eq!(config.resolve_worker_id(), "w-1");

        let generated = WorkerConfig::default().resolve_worker_id();
        assert!(generated.starts_with("worker-"));

        let empty = WorkerConfig::default().with_worker_id("");
        assert!(empty.resolve_worker_id().starts_with("worker-"));
    }

    #[test]
    fn test_validate() {
        assert!(WorkerConfig::default().validate().is_ok());

        let mut config = WorkerConfig::default();
        config.max_tasks_per_tick = 0;
        assert!(config.validate().is_err());

        let config = WorkerConfig::default().with_backoff(10, 5);
        assert!(matches!(config.validate(), Err(OrchestratorError::Config(_))));
    }
}
