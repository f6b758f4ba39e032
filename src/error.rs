//! Error types for mastery-engine.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient history: need at least {required} snapshots, have {available}")]
    InsufficientHistory { required: usize, available: usize },

    /// Circuit is open; the caller should come back after `retry_after`.
    #[error("{dependency} unavailable, retry after {retry_after:?}")]
    DependencyUnavailable {
        dependency: String,
        retry_after: Duration,
    },

    /// A dependency call failed. `retryable` is set by whoever classified the
    /// failure and is the only thing the retry loop looks at.
    #[error("dependency call failed: {message}")]
    Dependency { message: String, retryable: bool },

    #[error("dependency call timed out after {0:?}")]
    Timeout(Duration),

    #[error("concurrent modification of {key}")]
    ConcurrentModification { key: String },

    #[error("event {event_id} dead-lettered after {attempts} attempt(s): {reason}")]
    DeadLettered {
        event_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("event {event_id} failed permanently after {attempts} attempt(s): {reason}")]
    PermanentFailure {
        event_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a dependency failure worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Error::Dependency {
            message: message.into(),
            retryable: true,
        }
    }

    /// Shorthand for a dependency failure that retrying won't fix.
    pub fn fatal(message: impl Into<String>) -> Self {
        Error::Dependency {
            message: message.into(),
            retryable: false,
        }
    }

    /// Should the retry loop try this call again?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Dependency { retryable, .. } => *retryable,
            Error::Timeout(_) => true,
            _ => false,
        }
    }

    /// Does this outcome mean the dependency itself misbehaved?
    ///
    /// A CAS conflict or a validation error is a well-formed answer from the
    /// dependency, so it does not count against the breaker.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(
            self,
            Error::Dependency { .. } | Error::Timeout(_) | Error::Io(_)
        )
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::InsufficientHistory { .. } => "INSUFFICIENT_HISTORY",
            Error::DependencyUnavailable { .. } => "DEPENDENCY_UNAVAILABLE",
            Error::Dependency { .. } | Error::Timeout(_) | Error::Io(_) => {
                "TRANSIENT_DEPENDENCY_FAILURE"
            }
            Error::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            Error::DeadLettered { .. } => "DEAD_LETTERED",
            Error::PermanentFailure { .. } => "PERMANENT_PROCESSING_FAILURE",
            Error::Serialization(_) | Error::Config(_) | Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        let retryable = matches!(
            e,
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
        );
        Error::Dependency {
            message: format!("database: {e}"),
            retryable,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
