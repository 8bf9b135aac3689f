// crates/resilience/src/retry.rs
//! Retry until success, bounded by a deadline or an attempt count
//!
//! Attempts are made back to back with no delay between them. Under a
//! deadline the loop runs on a pool worker; once the caller gives up, the
//! loop sees the cleared continue flag before its next attempt and stops.
//! An attempt already in flight is not interrupted.

use crate::error::{BoxError, NotReady, ResilienceError, ResilienceResult};
use crate::pool::WorkerPool;
use crossbeam_channel::{bounded, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// What bounds a retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryLimit {
    /// Keep retrying until this much wall time has passed
    Deadline(Duration),
    /// Make at most this many attempts
    Attempts(usize),
}

/// Retry policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    limit: RetryLimit,
}

impl RetryPolicy {
    /// Retries until the deadline elapses
    pub fn deadline(timeout: Duration) -> Self {
        Self {
            limit: RetryLimit::Deadline(timeout),
        }
    }

    /// Retries up to `max_attempts` times
    pub fn attempts(max_attempts: usize) -> Self {
        Self {
            limit: RetryLimit::Attempts(max_attempts),
        }
    }

    /// Returns the limit
    pub fn limit(&self) -> RetryLimit {
        self.limit
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::attempts(3)
    }
}

/// Result of a single attempt, as seen by the retry loop
pub(crate) enum Attempt<T, E> {
    Success(T),
    NotReady,
    Failed(E),
}

enum LastFailure<E> {
    NotReady,
    Error(E),
}

impl<E: Into<BoxError>> LastFailure<E> {
    fn into_error(self) -> BoxError {
        match self {
            LastFailure::NotReady => Box::new(NotReady),
            LastFailure::Error(e) => e.into(),
        }
    }
}

/// Progress shared between the retry loop and the waiting caller
struct RetryProgress<E> {
    keep_going: AtomicBool,
    attempts: AtomicUsize,
    last_failure: Mutex<Option<LastFailure<E>>>,
}

impl<E> RetryProgress<E> {
    fn new() -> Self {
        Self {
            keep_going: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
            last_failure: Mutex::new(None),
        }
    }

    fn should_continue(&self) -> bool {
        self.keep_going.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.keep_going.store(false, Ordering::Release);
    }

    fn record(&self, failure: LastFailure<E>) -> usize {
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        *self
            .last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(failure);
        attempt
    }

    fn take_last_failure(&self) -> Option<LastFailure<E>> {
        self.last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Runs retry loops, using a worker pool for deadline-bounded ones
#[derive(Debug, Clone)]
pub struct Retrier {
    pool: WorkerPool,
}

impl Retrier {
    /// Creates a retrier running deadline-bounded loops on `pool`
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool }
    }

    /// Retrier backed by the process-wide pool
    pub fn shared() -> Self {
        Self::new(WorkerPool::shared())
    }

    /// Calls `operation` until it returns `Ok`, or the policy's limit is hit
    pub fn retry_until_success<F, T, E>(
        &self,
        policy: &RetryPolicy,
        operation: F,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.retry_until_success_or_abort(policy, operation, |_: &E| false)
    }

    /// Like [`Retrier::retry_until_success`], but stops at the first error for
    /// which `abort_on` returns true
    ///
    /// The aborting error comes back as [`ResilienceError::Failed`] under
    /// either kind of limit.
    pub fn retry_until_success_or_abort<F, T, E, A>(
        &self,
        policy: &RetryPolicy,
        mut operation: F,
        abort_on: A,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
        A: Fn(&E) -> bool + Send + 'static,
    {
        self.run(
            policy,
            move || match operation() {
                Ok(value) => Attempt::Success(value),
                Err(e) => Attempt::Failed(e),
            },
            abort_on,
        )
    }

    /// Calls `condition` until it returns true
    pub fn retry_until_true<F>(
        &self,
        policy: &RetryPolicy,
        mut condition: F,
    ) -> ResilienceResult<()>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.run(
            policy,
            move || {
                if condition() {
                    Attempt::<(), std::convert::Infallible>::Success(())
                } else {
                    Attempt::NotReady
                }
            },
            |_| false,
        )
    }

    pub(crate) fn run<F, T, E, A>(
        &self,
        policy: &RetryPolicy,
        operation: F,
        abort_on: A,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Attempt<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
        A: Fn(&E) -> bool + Send + 'static,
    {
        match policy.limit() {
            RetryLimit::Deadline(timeout) => self.run_until_deadline(timeout, operation, abort_on),
            RetryLimit::Attempts(max_attempts) => run_attempts(max_attempts, operation, abort_on),
        }
    }

    fn run_until_deadline<F, T, E, A>(
        &self,
        timeout: Duration,
        mut operation: F,
        abort_on: A,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Attempt<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
        A: Fn(&E) -> bool + Send + 'static,
    {
        if timeout.is_zero() {
            return Err(ResilienceError::InvalidArgument(
                "timeout must be greater than zero".to_string(),
            ));
        }

        let progress = Arc::new(RetryProgress::new());
        let loop_progress = Arc::clone(&progress);
        let (result_tx, result_rx) = bounded(1);

        let submitted = self.pool.execute(move || {
            let outcome = loop {
                if !loop_progress.should_continue() {
                    log::trace!("Deadline passed, abandoning retry loop");
                    return;
                }

                match operation() {
                    Attempt::Success(value) => break Ok(value),
                    Attempt::Failed(e) if abort_on(&e) => break Err(e),
                    Attempt::Failed(e) => {
                        let attempt = loop_progress.record(LastFailure::Error(e));
                        log::trace!("Retrying operation after failed attempt {}", attempt);
                    }
                    Attempt::NotReady => {
                        let attempt = loop_progress.record(LastFailure::NotReady);
                        log::trace!("Retrying operation after attempt {} was not ready", attempt);
                    }
                }
            };
            let _ = result_tx.send(outcome);
        });
        if let Err(e) = submitted {
            progress.cancel();
            return Err(e);
        }

        match result_rx.recv_timeout(timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ResilienceError::Failed(e.into())),
            Err(RecvTimeoutError::Timeout) => {
                progress.cancel();
                let attempts = progress.attempts.load(Ordering::Acquire);
                log::debug!("Gave up after {:?} and {} failed attempts", timeout, attempts);
                Err(ResilienceError::Timeout {
                    timeout,
                    attempts,
                    last_error: progress.take_last_failure().map(LastFailure::into_error),
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                progress.cancel();
                Err(ResilienceError::WorkerLost)
            }
        }
    }
}

impl Default for Retrier {
    fn default() -> Self {
        Self::shared()
    }
}

fn run_attempts<F, T, E, A>(
    max_attempts: usize,
    mut operation: F,
    abort_on: A,
) -> ResilienceResult<T>
where
    F: FnMut() -> Attempt<T, E>,
    E: Into<BoxError>,
    A: Fn(&E) -> bool,
{
    if max_attempts == 0 {
        return Err(ResilienceError::InvalidArgument(
            "attempt count must be greater than zero".to_string(),
        ));
    }

    let mut last_failure = LastFailure::NotReady;
    for attempt in 1..=max_attempts {
        match operation() {
            Attempt::Success(value) => return Ok(value),
            Attempt::Failed(e) if abort_on(&e) => return Err(ResilienceError::Failed(e.into())),
            Attempt::Failed(e) => last_failure = LastFailure::Error(e),
            Attempt::NotReady => last_failure = LastFailure::NotReady,
        }
        log::trace!("Attempt {} of {} failed", attempt, max_attempts);
    }

    Err(ResilienceError::RetriesExhausted {
        attempts: max_attempts,
        last_error: last_failure.into_error(),
    })
}

/// Executes an operation with retry logic on the shared pool
pub fn with_retry<F, T, E>(policy: &RetryPolicy, operation: F) -> ResilienceResult<T>
where
    F: FnMut() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    Retrier::shared().retry_until_success(policy, operation)
}

/// Calls `condition` until it returns true, on the shared pool
pub fn retry_until_true<F>(policy: &RetryPolicy, condition: F) -> ResilienceResult<()>
where
    F: FnMut() -> bool + Send + 'static,
{
    Retrier::shared().retry_until_true(policy, condition)
}
