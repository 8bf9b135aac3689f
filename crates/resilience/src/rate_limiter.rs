// crates/resilience/src/rate_limiter.rs
//! Rate limiting implementation
//!
//! A limiter sleeps the calling thread before each invocation so that
//! invocations are spaced at least `interval / count` apart. The gap is
//! measured from when the previous action finished, so a slow action never
//! shortens the next gap.

use crate::clock::{duration_millis, Clock, SystemClock};
use crate::error::{ResilienceError, ResilienceResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Target invocation rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Invocations allowed per interval
    pub count: u32,
    /// Interval length in millis
    pub interval_millis: u64,
}

impl RateLimit {
    /// Creates a rate of `count` invocations per `interval`
    pub fn new(count: u32, interval: Duration) -> Self {
        Self {
            count,
            interval_millis: duration_millis(interval),
        }
    }

    /// Minimum gap between invocations
    pub fn min_gap(&self) -> Duration {
        Duration::from_millis(self.interval_millis) / self.count.max(1)
    }
}

/// How a limiter spaces invocations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThrottlingPolicy {
    /// Evenly spaced invocations
    ConstantThroughput,
}

/// Builder for [`RateLimiter`]
#[derive(Debug, Default)]
pub struct RateLimiterBuilder {
    rate: Option<RateLimit>,
    policy: Option<ThrottlingPolicy>,
    clock: Option<Arc<dyn Clock>>,
}

impl RateLimiterBuilder {
    /// Sets the target rate
    pub fn with_rate(mut self, count: u32, per: Duration) -> Self {
        self.rate = Some(RateLimit::new(count, per));
        self
    }

    /// Sets the target rate from a config value
    pub fn with_rate_limit(mut self, rate: RateLimit) -> Self {
        self.rate = Some(rate);
        self
    }

    /// Spaces invocations evenly
    pub fn with_constant_throughput(mut self) -> Self {
        self.policy = Some(ThrottlingPolicy::ConstantThroughput);
        self
    }

    /// Uses the given clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the limiter
    pub fn build(self) -> ResilienceResult<RateLimiter> {
        let rate = self.rate.ok_or_else(|| {
            ResilienceError::InvalidArgument("a rate must be set".to_string())
        })?;
        if rate.count == 0 || rate.interval_millis == 0 {
            return Err(ResilienceError::InvalidArgument(
                "rate count and interval must be greater than zero".to_string(),
            ));
        }
        let policy = self.policy.ok_or_else(|| {
            ResilienceError::InvalidArgument("a throttling policy must be set".to_string())
        })?;

        Ok(RateLimiter {
            rate,
            policy,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock::new())),
            last_invocation: None,
        })
    }
}

/// Blocking rate limiter
///
/// Not meant to be shared between threads without external locking; each
/// call takes `&mut self`.
#[derive(Debug)]
pub struct RateLimiter {
    rate: RateLimit,
    policy: ThrottlingPolicy,
    clock: Arc<dyn Clock>,
    last_invocation: Option<u64>,
}

impl RateLimiter {
    /// Starts building a limiter
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    /// Runs `action` once enough time has passed since the previous one
    pub fn invoke_when_ready<F, T>(&mut self, action: F) -> T
    where
        F: FnOnce() -> T,
    {
        let wait = self.next_wait();
        if !wait.is_zero() {
            log::trace!("Rate limited, sleeping for {:?}", wait);
            std::thread::sleep(wait);
        }

        let result = action();
        self.last_invocation = Some(self.clock.now_millis());
        result
    }

    /// How long the next invocation would wait
    pub fn next_wait(&self) -> Duration {
        let Some(last) = self.last_invocation else {
            return Duration::ZERO;
        };

        match self.policy {
            ThrottlingPolicy::ConstantThroughput => {
                let elapsed = Duration::from_millis(self.clock.now_millis().saturating_sub(last));
                self.rate.min_gap().saturating_sub(elapsed)
            }
        }
    }

    /// Gets the configured rate
    pub fn rate(&self) -> RateLimit {
        self.rate
    }

    /// Gets the throttling policy
    pub fn policy(&self) -> ThrottlingPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Instant;

    fn limiter_with(clock: &ManualClock, count: u32, per: Duration) -> RateLimiter {
        RateLimiter::builder()
            .with_rate(count, per)
            .with_constant_throughput()
            .with_clock(Arc::new(clock.clone()))
            .build()
            .expect("valid limiter")
    }

    #[test]
    fn test_first_invocation_does_not_wait() {
        let clock = ManualClock::new(1_000);
        let limiter = limiter_with(&clock, 10, Duration::from_secs(1));
        assert_eq!(limiter.next_wait(), Duration::ZERO);
    }

    #[test]
    fn test_wait_shrinks_with_elapsed_time() {
        let clock = ManualClock::new(1_000);
        let mut limiter = limiter_with(&clock, 10, Duration::from_secs(1));

        assert_eq!(limiter.invoke_when_ready(|| 5), 5);
        assert_eq!(limiter.next_wait(), Duration::from_millis(100));

        clock.advance(Duration::from_millis(30));
        assert_eq!(limiter.next_wait(), Duration::from_millis(70));

        clock.advance(Duration::from_millis(200));
        assert_eq!(limiter.next_wait(), Duration::ZERO);
    }

    #[test]
    fn test_gap_starts_after_action_completes() {
        let clock = ManualClock::new(0);
        let mut limiter = limiter_with(&clock, 2, Duration::from_secs(1));

        let action_clock = clock.clone();
        limiter.invoke_when_ready(|| action_clock.advance(Duration::from_millis(400)));

        assert_eq!(limiter.next_wait(), Duration::from_millis(500));
    }

    #[test]
    fn test_failed_action_still_records_invocation() {
        let clock = ManualClock::new(0);
        let mut limiter = limiter_with(&clock, 4, Duration::from_secs(1));

        let result: Result<(), &str> = limiter.invoke_when_ready(|| Err("refused"));
        assert!(result.is_err());
        assert_eq!(limiter.next_wait(), Duration::from_millis(250));
    }

    #[test]
    fn test_limits_real_invocation_rate() {
        let mut limiter = RateLimiter::builder()
            .with_rate(20, Duration::from_secs(1))
            .with_constant_throughput()
            .build()
            .expect("valid limiter");

        let start = Instant::now();
        let mut count = 0;
        for _ in 0..5 {
            count = limiter.invoke_when_ready(|| count + 1);
        }

        assert_eq!(count, 5);
        assert!(start.elapsed() >= Duration::from_millis(190));
    }

    #[test]
    fn test_build_requires_rate_and_policy() {
        let missing_rate = RateLimiter::builder().with_constant_throughput().build();
        assert!(matches!(missing_rate, Err(ResilienceError::InvalidArgument(_))));

        let missing_policy = RateLimiter::builder()
            .with_rate(1, Duration::from_secs(1))
            .build();
        assert!(matches!(missing_policy, Err(ResilienceError::InvalidArgument(_))));

        let zero_rate = RateLimiter::builder()
            .with_rate(0, Duration::from_secs(1))
            .with_constant_throughput()
            .build();
        assert!(matches!(zero_rate, Err(ResilienceError::InvalidArgument(_))));
    }

    #[test]
    fn test_rate_limiter_config() -> Result<(), Box<dyn std::error::Error>> {
        let rate: RateLimit = toml::from_str("count = 100\ninterval_millis = 60000")?;
        let limiter = RateLimiter::builder()
            .with_rate_limit(rate)
            .with_constant_throughput()
            .build()?;

        assert_eq!(limiter.rate(), RateLimit::new(100, Duration::from_secs(60)));
        assert_eq!(limiter.rate().min_gap(), Duration::from_millis(600));
        assert_eq!(limiter.policy(), ThrottlingPolicy::ConstantThroughput);
        Ok(())
    }
}
