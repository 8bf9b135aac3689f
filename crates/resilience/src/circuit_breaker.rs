// crates/resilience/src/circuit_breaker.rs
//! Circuit breaker pattern implementation
//!
//! A breaker is either `Alive`, letting calls through to the primary action,
//! or `Broken`, sending them straight to the fallback. Any error from the
//! primary action breaks it. With an auto-reset interval configured, a
//! broken breaker lets calls through again once that long has passed since
//! the failure; the check happens lazily on the next call.
//!
//! The breaker runs everything on the calling thread and takes no locks of
//! its own. Concurrent callers can race between the status check and the
//! status write, which at worst lets one extra primary call through while
//! the breaker trips.

use crate::clock::{duration_millis, Clock, SystemClock};
use crate::error::BoxError;
use crate::state_store::{InMemoryStateStore, StateStore, Status};
use crate::timeout::Timeout;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Circuit breaker configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Millis after the last failure before the breaker lets calls through
    /// again; `None` keeps it broken until reset by hand
    #[serde(default)]
    auto_reset_millis: Option<u64>,
}

impl CircuitBreakerConfig {
    /// Creates a configuration that never auto-resets
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the auto-reset interval
    pub fn with_auto_reset(mut self, interval: Duration) -> Self {
        self.auto_reset_millis = Some(duration_millis(interval));
        self
    }

    /// Returns the auto-reset interval, if any
    pub fn auto_reset(&self) -> Option<Duration> {
        self.auto_reset_millis.map(Duration::from_millis)
    }
}

/// What happened on a `try_do` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryOutcome {
    /// The primary action ran and succeeded
    Succeeded,
    /// The primary action ran, failed, and broke the breaker
    Tripped,
    /// The breaker was already broken; the primary action did not run
    Broken,
}

impl TryOutcome {
    /// True if the broken handler ran
    pub fn is_broken(&self) -> bool {
        !matches!(self, TryOutcome::Succeeded)
    }
}

/// Circuit breaker implementation
///
/// Clones share the same clock and state store.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn StateStore>,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker with in-memory state and the system clock
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock::new()),
            store: Arc::new(InMemoryStateStore::new()),
        }
    }

    /// Uses the given clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Keeps state in the given store
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    /// Gets the configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Gets the current state
    ///
    /// Applies the auto-reset check, so this can report `Alive` while the
    /// store still holds `Broken`; only the next call rewrites the store.
    pub fn state(&self) -> Status {
        if self.is_broken() {
            Status::Broken
        } else {
            Status::Alive
        }
    }

    /// Runs `primary` unless broken
    pub fn try_do<F, E>(&self, primary: F) -> TryOutcome
    where
        F: FnOnce() -> Result<(), E>,
        E: fmt::Display,
    {
        self.try_do_with(primary, || {}, || {})
    }

    /// Runs `primary` unless broken, otherwise `on_broken`
    pub fn try_do_or_else<F, E, B>(&self, primary: F, on_broken: B) -> TryOutcome
    where
        F: FnOnce() -> Result<(), E>,
        E: fmt::Display,
        B: FnOnce(),
    {
        self.try_do_with(primary, || {}, on_broken)
    }

    /// Runs `primary` unless broken
    ///
    /// When `primary` fails the breaker trips, then `on_first_failure` and
    /// `on_broken` run in that order. While broken only `on_broken` runs.
    pub fn try_do_with<F, E, O, B>(
        &self,
        primary: F,
        on_first_failure: O,
        on_broken: B,
    ) -> TryOutcome
    where
        F: FnOnce() -> Result<(), E>,
        E: fmt::Display,
        O: FnOnce(),
        B: FnOnce(),
    {
        if self.is_broken() {
            on_broken();
            return TryOutcome::Broken;
        }

        match primary() {
            Ok(()) => {
                self.store.set_status(Status::Alive);
                TryOutcome::Succeeded
            }
            Err(e) => {
                self.trip(&e);
                on_first_failure();
                on_broken();
                TryOutcome::Tripped
            }
        }
    }

    /// Returns `primary`'s value unless broken or failing, otherwise `fallback`'s
    pub fn try_get<F, T, E, G>(&self, primary: F, fallback: G) -> T
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display,
        G: FnOnce() -> T,
    {
        self.try_get_with(primary, || {}, fallback)
    }

    /// Like [`CircuitBreaker::try_get`], running `on_first_failure` when
    /// `primary` fails
    pub fn try_get_with<F, T, E, O, G>(
        &self,
        primary: F,
        on_first_failure: O,
        fallback: G,
    ) -> T
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display,
        O: FnOnce(),
        G: FnOnce() -> T,
    {
        if self.is_broken() {
            return fallback();
        }

        match primary() {
            Ok(value) => {
                self.store.set_status(Status::Alive);
                value
            }
            Err(e) => {
                self.trip(&e);
                on_first_failure();
                fallback()
            }
        }
    }

    /// Returns `primary`'s value, or `None` if broken or failing
    pub fn try_get_optional<F, T, E>(&self, primary: F) -> Option<T>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display,
    {
        self.try_get(move || primary().map(Some), || None)
    }

    /// Runs `primary` under `timeout`, counting a timeout as a failure
    ///
    /// The primary action runs on the timeout's worker pool, so a slow
    /// action keeps running in the background after the fallback is used.
    pub fn try_get_within<F, T, E, G>(&self, timeout: &Timeout, primary: F, fallback: G) -> T
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
        G: FnOnce() -> T,
    {
        self.try_get(|| timeout.try_execute(primary), fallback)
    }

    /// Resets the circuit breaker to alive
    pub fn reset(&self) {
        self.store.set_status(Status::Alive);
        self.store.set_last_failure(0);
    }

    fn is_broken(&self) -> bool {
        if self.store.status() != Status::Broken {
            return false;
        }

        match self.config.auto_reset_millis {
            None => true,
            Some(interval) => {
                let since_failure = self
                    .clock
                    .now_millis()
                    .saturating_sub(self.store.last_failure());
                since_failure < interval
            }
        }
    }

    fn trip(&self, error: &dyn fmt::Display) {
        let now = self.clock.now_millis();
        log::warn!("Protected call failed, breaking circuit: {}", error);
        self.store.set_status(Status::Broken);
        self.store.set_last_failure(now);
        log::debug!("Circuit broken at {}", now);
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
