// crates/resilience/src/stabilize.rs
//! Waiting for a sampled value to stop changing

use crate::error::{ConsistencyError, ResilienceError};
use crate::retry::{Attempt, Retrier, RetryPolicy};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Samples a value repeatedly until it has held steady for long enough
///
/// Meant for components that take an unknown time to settle, where polling
/// is the only way to tell.
pub fn retry_until_consistent<F, T, E>(
    min_stable: Duration,
    total_timeout: Duration,
    sample: F,
) -> Result<T, ConsistencyError<T>>
where
    F: FnMut() -> Result<T, E> + Send + 'static,
    T: Clone + PartialEq + fmt::Debug + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    Stabilizer::new(Retrier::shared()).retry_until_consistent(min_stable, total_timeout, sample)
}

/// Stabilization waiter over an injected [`Retrier`]
#[derive(Debug, Clone)]
pub struct Stabilizer {
    retrier: Retrier,
}

impl Stabilizer {
    pub fn new(retrier: Retrier) -> Self {
        Self { retrier }
    }

    /// See [`retry_until_consistent`]
    pub fn retry_until_consistent<F, T, E>(
        &self,
        min_stable: Duration,
        total_timeout: Duration,
        mut sample: F,
    ) -> Result<T, ConsistencyError<T>>
    where
        F: FnMut() -> Result<T, E> + Send + 'static,
        T: Clone + PartialEq + fmt::Debug + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        if min_stable.is_zero() {
            return Err(ResilienceError::InvalidArgument(
                "consistent time must be greater than zero".to_string(),
            )
            .into());
        }
        if total_timeout.is_zero() {
            return Err(ResilienceError::InvalidArgument(
                "total timeout must be greater than zero".to_string(),
            )
            .into());
        }

        let start = Instant::now();
        let tracker = Arc::new(Mutex::new(RunTracker::new()));
        let sampling_tracker = Arc::clone(&tracker);

        let result = self.retrier.run(
            &RetryPolicy::deadline(total_timeout),
            move || {
                let observed = sample();
                let mut tracker = sampling_tracker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);

                match observed {
                    Ok(value) => match tracker.observe(value, Instant::now(), min_stable) {
                        Some(stable) => Attempt::<T, std::convert::Infallible>::Success(stable),
                        None => Attempt::NotReady,
                    },
                    Err(e) => {
                        log::trace!("Sampling failed, restarting consistency run: {}", e);
                        tracker.reset();
                        Attempt::NotReady
                    }
                }
            },
            |_| false,
        );

        match result {
            Ok(value) => Ok(value),
            Err(ResilienceError::Timeout { .. }) => {
                let elapsed = start.elapsed();
                let tracker = tracker.lock().unwrap_or_else(PoisonError::into_inner);
                match tracker.best_run.clone() {
                    Some((value, stable_for)) => Err(ConsistencyError::Inconsistent {
                        elapsed,
                        value,
                        stable_for,
                    }),
                    None => Err(ConsistencyError::NeverConsistent { elapsed }),
                }
            }
            Err(other) => Err(other.into()),
        }
    }
}

/// Current and longest runs of an unchanged value
#[derive(Debug)]
struct RunTracker<T> {
    current: Option<(T, Instant)>,
    best_run: Option<(T, Duration)>,
}

impl<T: Clone + PartialEq> RunTracker<T> {
    fn new() -> Self {
        Self {
            current: None,
            best_run: None,
        }
    }

    /// Records a sample, returning the value once it has been stable for `min_stable`
    fn observe(&mut self, value: T, now: Instant, min_stable: Duration) -> Option<T> {
        match &self.current {
            Some((current, since)) if *current == value => {
                let stable_for = now.saturating_duration_since(*since);

                let is_best = self
                    .best_run
                    .as_ref()
                    .map_or(true, |(_, best)| stable_for > *best);
                if is_best {
                    self.best_run = Some((value.clone(), stable_for));
                }

                (stable_for >= min_stable).then_some(value)
            }
            _ => {
                self.current = Some((value, now));
                None
            }
        }
    }

    fn reset(&mut self) {
        self.current = None;
    }
}
