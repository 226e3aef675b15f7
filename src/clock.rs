//! Provides the time source used by the cache engine.
//!
//! All expiry and versioning decisions are based on epoch milliseconds as reported by a
//! [Clock]. In production this is the [SystemClock], tests use a [ManualClock] which only
//! moves when told to.
//!
//! # Examples
//! ```
//! # use distcache::clock::{Clock, ManualClock};
//! # use std::time::Duration;
//! let clock = ManualClock::new(1_000);
//! clock.advance(Duration::from_secs(2));
//! assert_eq!(clock.now_millis(), 3_000);
//! ```
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Provides the current time in milliseconds since the unix epoch.
pub trait Clock: Send + Sync {
    /// Returns the current time in milliseconds since the unix epoch.
    fn now_millis(&self) -> u64;
}

/// Reports the time of the operating system.
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Provides a clock which is controlled manually.
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock which reports the given time until it is changed.
    pub fn new(now: u64) -> Self {
        ManualClock {
            now: AtomicU64::new(now),
        }
    }

    /// Moves the clock forward by the given duration.
    pub fn advance(&self, duration: Duration) {
        let _ = self
            .now
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    /// Sets the clock to the given time.
    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::{Clock, SystemClock};

    #[test]
    fn system_clock_reports_epoch_millis() {
        // 2020-01-01 is a safe lower bound...
        assert_eq!(SystemClock.now_millis() > 1_577_836_800_000, true);
    }
}
