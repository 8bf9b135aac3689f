// crates/resilience/src/clock.rs
//! Time sources for breakers and rate limiters

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Supplies the current time in milliseconds
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current reading; never smaller than a previous reading
    fn now_millis(&self) -> u64;
}

/// Wall clock based on the system time
#[derive(Debug, Default)]
pub struct SystemClock {
    last_reading: AtomicU64,
}

impl SystemClock {
    /// Creates a new system clock
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(duration_millis)
            .unwrap_or(0);

        // Clamp so a wall clock step backwards never shows up as negative elapsed time
        let previous = self.last_reading.fetch_max(now, Ordering::AcqRel);
        previous.max(now)
    }
}

/// Manually driven clock for deterministic tests
///
/// Clones share the same reading, so a test can keep one handle and hand
/// another to the component under test.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock fixed at the given reading
    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    /// Sets the current reading
    pub fn set_millis(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    /// Moves the clock forward
    pub fn advance(&self, by: Duration) {
        let by = duration_millis(by);
        let _ = self
            .millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.saturating_add(by))
            });
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_nondecreasing() {
        let clock = SystemClock::new();
        let first = clock.now_millis();
        let second = clock.now_millis();
        assert!(first > 0);
        assert!(second >= first);
    }

    #[test]
    fn test_manual_clock_set_and_advance() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_millis(), 1_250);

        clock.set_millis(5);
        assert_eq!(clock.now_millis(), 5);
    }

    #[test]
    fn test_manual_clock_clones_share_reading() {
        let clock = ManualClock::new(0);
        let handle = clock.clone();

        handle.advance(Duration::from_secs(2));
        assert_eq!(clock.now_millis(), 2_000);
    }

    #[test]
    fn test_advance_saturates() {
        let clock = ManualClock::new(u64::MAX - 10);
        clock.advance(Duration::from_millis(100));
        assert_eq!(clock.now_millis(), u64::MAX);

        assert_eq!(duration_millis(Duration::MAX), u64::MAX);
        assert_eq!(duration_millis(Duration::from_secs(3)), 3_000);
    }
}
