//! Wall-clock abstraction.
//!
//! Breaker cool-downs and cache TTLs are measured against persisted
//! timestamps, so they use wall-clock time rather than `Instant`. Tests
//! drive a [`ManualClock`] to simulate time passing.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Shared reference to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl SystemClock {
    /// Create a shared system clock.
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock frozen at the current system time.
    pub fn starting_now() -> Arc<Self> {
        Arc::new(Self::new(Utc::now()))
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    /// Move the clock forward by a number of milliseconds.
    pub fn advance_ms(&self, ms: i64) {
        self.advance(Duration::milliseconds(ms));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Milliseconds elapsed from `earlier` to `later`, saturating at zero.
pub fn elapsed_ms(earlier: DateTime<Utc>, later: DateTime<Utc>) -> u64 {
    (later - earlier).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::starting_now();
        let start = clock.now();
        clock.advance_ms(1_500);
        assert_eq!(elapsed_ms(start, clock.now()), 1_500);
    }

    #[test]
    fn test_elapsed_saturates() {
        let now = Utc::now();
        let earlier = now - Duration::seconds(5);
        assert_eq!(elapsed_ms(now, earlier), 0);
    }
}
