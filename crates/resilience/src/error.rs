// crates/resilience/src/error.rs
//! Error types for resilience operations

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Boxed error carried as the cause of a wrapped failure
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for resilience operations
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Errors that can occur in resilience operations
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// Deadline elapsed before the operation produced a result
    #[error("Operation timed out after {timeout:?} ({attempts} failed attempts)")]
    Timeout {
        timeout: Duration,
        attempts: usize,
        #[source]
        last_error: Option<BoxError>,
    },

    /// All retry attempts exhausted
    #[error("All {attempts} retry attempts exhausted: {last_error}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last_error: BoxError,
    },

    /// Operation failed with an error that is not retried
    #[error("Operation failed: {0}")]
    Failed(#[source] BoxError),

    /// Invalid argument passed to a resilience primitive
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Worker thread could not be started
    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    /// Worker running the operation panicked before producing a result
    #[error("Worker panicked before producing a result")]
    WorkerLost,
}

impl ResilienceError {
    /// Returns true if the error is a deadline timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, ResilienceError::Timeout { .. })
    }

    /// Returns the last attempt's error, if one was recorded
    pub fn last_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            ResilienceError::Timeout { last_error, .. } => last_error.as_deref(),
            ResilienceError::RetriesExhausted { last_error, .. } => Some(last_error.as_ref()),
            ResilienceError::Failed(source) => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Marker cause reported when a readiness check never returned true
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Condition not yet satisfied")]
pub struct NotReady;

/// Errors from waiting for a sampled value to stabilize
#[derive(Debug, Error)]
pub enum ConsistencyError<T: fmt::Debug> {
    /// No two consecutive samples were ever equal
    #[error("After {elapsed:?}, results never became consistent")]
    NeverConsistent { elapsed: Duration },

    /// Some value repeated, but never for long enough
    #[error(
        "After {elapsed:?}, results have not become consistent; most consistent value was {value:?}, seen for {stable_for:?}"
    )]
    Inconsistent {
        elapsed: Duration,
        value: T,
        stable_for: Duration,
    },

    /// The underlying retry engine rejected the call
    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}
