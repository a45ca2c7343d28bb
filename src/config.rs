//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::{AppError, Result};

/// Upper bound on a single lease (one day).
const MAX_LEASE_SECONDS: u64 = 86_400;

/// Job lease and reclamation settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct JobsConfig {
    /// Lease duration granted on acquire and on every renewal.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    /// Requeue budget for jobs whose lease expired.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Interval between stale-lease sweeps in `serve` mode.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            lease_seconds: default_lease_seconds(),
            max_retries: default_max_retries(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

/// State runner settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RunnerConfig {
    /// Timeout applied to steps that do not declare their own.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_ms: default_step_timeout_ms(),
        }
    }
}

fn default_lease_seconds() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_cleanup_interval() -> u64 {
    30
}

fn default_step_timeout_ms() -> u64 {
    10_000
}

fn default_retention_days() -> u32 {
    30
}

fn default_worker_id() -> String {
    format!("worker-{}", Uuid::new_v4())
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// `SQLite` database file, or `:memory:`.
    pub db_path: PathBuf,
    /// Identity used as lock holder by workers built with
    /// [`JobWorker::from_config`](crate::orchestrator::worker::JobWorker::from_config).
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
    /// Days after a job or session ends before its data is purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Lease and requeue behavior.
    #[serde(default)]
    pub jobs: JobsConfig,
    /// Step execution behavior.
    #[serde(default)]
    pub runner: RunnerConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Whether the configured database lives in memory only.
    #[must_use]
    pub fn is_memory_db(&self) -> bool {
        self.db_path.as_os_str() == ":memory:"
    }

    /// Lease duration as a `chrono` duration, taken by configured workers.
    #[must_use]
    pub fn lease_duration(&self) -> chrono::Duration {
        let seconds = self.jobs.lease_seconds.min(MAX_LEASE_SECONDS);
        chrono::Duration::seconds(i64::try_from(seconds).unwrap_or(0))
    }

    /// Interval between stale-lease sweeps.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.jobs.cleanup_interval_seconds)
    }

    /// Fallback step timeout for configured workers' state runners.
    #[must_use]
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.runner.default_step_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(AppError::Config("db_path must not be empty".into()));
        }

        if self.worker_id.trim().is_empty() {
            return Err(AppError::Config("worker_id must not be empty".into()));
        }

        if self.jobs.lease_seconds == 0 || self.jobs.lease_seconds > MAX_LEASE_SECONDS {
            return Err(AppError::Config(format!(
                "jobs.lease_seconds must be between 1 and {MAX_LEASE_SECONDS}"
            )));
        }

        if self.jobs.cleanup_interval_seconds == 0 {
            return Err(AppError::Config(
                "jobs.cleanup_interval_seconds must be greater than zero".into(),
            ));
        }

        if self.runner.default_step_timeout_ms == 0 {
            return Err(AppError::Config(
                "runner.default_step_timeout_ms must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
