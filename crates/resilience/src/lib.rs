// crates/resilience/src/lib.rs
//! Resilience primitives for calls to unreliable collaborators
//!
//! This crate provides:
//! - A circuit breaker with pluggable state storage and time source
//! - Retry until success, bounded by a deadline or an attempt count
//! - Timeout handling on an elastic worker pool
//! - Waiting for a sampled value to stabilize
//! - Rate limiting
//!
//! # Example
//!
//! ```rust
//! use holdfast_resilience::{
//!     with_retry, CircuitBreaker, CircuitBreakerConfig, RetryPolicy, Status,
//! };
//! use std::time::Duration;
//!
//! // Circuit breaker that lets calls through again 30s after a failure
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new().with_auto_reset(Duration::from_secs(30)),
//! );
//! let value = breaker.try_get(|| Err::<&str, _>("service down"), || "cached");
//! assert_eq!(value, "cached");
//! assert_eq!(breaker.state(), Status::Broken);
//!
//! // Retry for up to a second
//! let result = with_retry(&RetryPolicy::deadline(Duration::from_secs(1)), || {
//!     Ok::<_, String>(42)
//! });
//! assert_eq!(result.ok(), Some(42));
//! ```

mod circuit_breaker;
mod clock;
mod error;
mod pool;
mod rate_limiter;
mod retry;
mod stabilize;
mod state_store;
mod timeout;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, TryOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BoxError, ConsistencyError, NotReady, ResilienceError, ResilienceResult};
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use rate_limiter::{RateLimit, RateLimiter, RateLimiterBuilder, ThrottlingPolicy};
pub use retry::{retry_until_true, with_retry, Retrier, RetryLimit, RetryPolicy};
pub use stabilize::{retry_until_consistent, Stabilizer};
pub use state_store::{
    new_state_map, BreakerState, InMemoryStateStore, MapBackedStateStore, StateMap, StateStore,
    Status, StoredValue,
};
pub use timeout::{with_timeout, Timeout};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_all_exports_accessible() {
        // Verify all types are exported
        let _: RetryPolicy = RetryPolicy::default();
        let _: CircuitBreakerConfig = CircuitBreakerConfig::default();
        let _: CircuitBreaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        let _: Timeout = Timeout::new(Duration::from_secs(5));
        let _: Retrier = Retrier::shared();
        let _: Stabilizer = Stabilizer::new(Retrier::shared());
        let _: WorkerPool = WorkerPool::with_config(WorkerPoolConfig::default());
        let _: ManualClock = ManualClock::new(0);
        let _: InMemoryStateStore = InMemoryStateStore::new();
        let _: ResilienceResult<RateLimiter> = RateLimiter::builder()
            .with_rate(100, Duration::from_secs(1))
            .with_constant_throughput()
            .build();
    }
}
