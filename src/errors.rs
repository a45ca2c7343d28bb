//! Error types shared across the orchestration core.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// A cancellation request is not an error; holders observe it through
/// `JobManager::poll_cancellation`.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The job or session store is unavailable or returned an error.
    Storage(String),
    /// Malformed job or script specification; never persisted.
    Validation(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// A compare-and-set kept losing against concurrent writers.
    LockContention(String),
    /// Caller attempted a holder-only mutation without owning the lease.
    NotLockHolder(String),
    /// The caller's lease ran out before it was renewed.
    LeaseExpired(String),
    /// A script step did not finish within its timeout.
    StepTimeout(String),
    /// A script step was rejected by the step backend.
    StepExecution(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Storage(msg) => write!(f, "storage: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::LockContention(msg) => write!(f, "lock contention: {msg}"),
            Self::NotLockHolder(msg) => write!(f, "not lock holder: {msg}"),
            Self::LeaseExpired(msg) => write!(f, "lease expired: {msg}"),
            Self::StepTimeout(msg) => write!(f, "step timeout: {msg}"),
            Self::StepExecution(msg) => write!(f, "step execution: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Whether the caller may retry the operation later without changes.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::LockContention(_))
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("document encoding: {err}"))
    }
}
