// crates/resilience/src/timeout.rs
//! Timeout handling utilities
//!
//! Operations run on a [`WorkerPool`] thread while the caller waits on a
//! channel. When the deadline passes the caller gets
//! [`ResilienceError::Timeout`]; the operation itself cannot be interrupted
//! and runs to completion in the background.

use crate::error::{BoxError, ResilienceError, ResilienceResult};
use crate::pool::WorkerPool;
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::time::Duration;

/// Executes an operation on the shared pool with a timeout
pub fn with_timeout<F, T>(duration: Duration, operation: F) -> ResilienceResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Timeout::new(duration).execute(operation)
}

/// Timeout wrapper for operations
#[derive(Debug, Clone)]
pub struct Timeout {
    duration: Duration,
    pool: WorkerPool,
}

impl Timeout {
    /// Creates a new timeout running on the shared pool
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            pool: WorkerPool::shared(),
        }
    }

    /// Runs operations on the given pool instead
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    /// Gets the timeout duration
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Executes an operation with this timeout
    pub fn execute<F, T>(&self, operation: F) -> ResilienceResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.try_execute(move || Ok::<_, std::convert::Infallible>(operation()))
    }

    /// Executes a fallible operation with this timeout
    ///
    /// An error returned by the operation surfaces as
    /// [`ResilienceError::Failed`].
    pub fn try_execute<F, T, E>(&self, operation: F) -> ResilienceResult<T>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        if self.duration.is_zero() {
            return Err(ResilienceError::InvalidArgument(
                "timeout must be greater than zero".to_string(),
            ));
        }

        let (result_tx, result_rx) = bounded(1);
        self.pool.execute(move || {
            // Receiver is gone if the caller already timed out
            let _ = result_tx.send(operation());
        })?;

        match result_rx.recv_timeout(self.duration) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ResilienceError::Failed(e.into())),
            Err(RecvTimeoutError::Timeout) => {
                log::debug!("Operation still running after {:?}, giving up", self.duration);
                Err(ResilienceError::Timeout {
                    timeout: self.duration,
                    attempts: 0,
                    last_error: None,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(ResilienceError::WorkerLost),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), || {
            std::thread::sleep(Duration::from_millis(10));
            42
        });

        assert!(result.is_ok());
        assert_eq!(result.ok(), Some(42));
    }

    #[test]
    fn test_timeout_exceeded() {
        let result = with_timeout(Duration::from_millis(10), || {
            std::thread::sleep(Duration::from_millis(50));
            42
        });

        assert!(result.is_err());
        assert!(matches!(result, Err(ResilienceError::Timeout { .. })));
    }

    #[test]
    fn test_caller_unblocks_at_deadline() {
        let start = Instant::now();
        let result = with_timeout(Duration::from_millis(50), || {
            std::thread::sleep(Duration::from_secs(2));
        });

        assert!(matches!(result, Err(ResilienceError::Timeout { .. })));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_timeout_wrapper() {
        let timeout = Timeout::new(Duration::from_millis(100));

        let result = timeout.execute(|| {
            std::thread::sleep(Duration::from_millis(10));
            42
        });

        assert!(result.is_ok());
        assert_eq!(result.ok(), Some(42));
    }

    #[test]
    fn test_try_execute_wraps_error() {
        let timeout = Timeout::new(Duration::from_millis(100));
        let result: ResilienceResult<u32> = timeout.try_execute(|| Err("backend refused"));

        match result {
            Err(ResilienceError::Failed(source)) => {
                assert_eq!(source.to_string(), "backend refused");
            }
            other => panic!("Expected Failed error, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = with_timeout(Duration::ZERO, || 1);
        assert!(matches!(result, Err(ResilienceError::InvalidArgument(_))));
    }

    #[test]
    fn test_panicking_operation_reports_worker_lost() {
        let result: ResilienceResult<()> =
            with_timeout(Duration::from_secs(1), || panic!("operation blew up"));
        assert!(matches!(result, Err(ResilienceError::WorkerLost)));
    }

    #[test]
    fn test_timeout_duration() {
        let timeout = Timeout::new(Duration::from_secs(5));
        assert_eq!(timeout.duration(), Duration::from_secs(5));
    }
}
