//! Monotonic tick source and wall clock, both injectable so tests can pin
//! time instead of racing the real clock.
//!
//! A [`Ticker`] has no wall-clock meaning; every duration in this crate is a
//! difference between two ticks. The [`Clock`] is used exactly once per
//! trace, to stamp its start date.

use std::time::{SystemTime, UNIX_EPOCH};

/// A monotonically increasing nanosecond counter.
pub trait Ticker: Send + Sync {
    /// Read the current tick. Calls from the same thread must never
    /// observe a value smaller than a previously returned one.
    fn read(&self) -> u64;
}

/// A millisecond-precision wall clock, used only for trace start dates.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// Production [`Ticker`] backed by [`std::time::Instant`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTicker {
    _private: (),
}

impl SystemTicker {
    /// Construct the default system ticker.
    pub fn new() -> Self {
        SystemTicker { _private: () }
    }
}

impl Ticker for SystemTicker {
    fn read(&self) -> u64 {
        EPOCH.elapsed().as_nanos() as u64
    }
}

// `Instant` has no epoch; anchor one the first time a tick is read so all
// ticks observed by this process are comparable.
static EPOCH: once_cell::sync::Lazy<std::time::Instant> =
    once_cell::sync::Lazy::new(std::time::Instant::now);

/// Production [`Clock`] backed by [`std::time::SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock {
    _private: (),
}

impl SystemClock {
    /// Construct the default system clock.
    pub fn new() -> Self {
        SystemClock { _private: () }
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Test double for [`Ticker`]: returns a value set by the test, advanced
/// explicitly rather than by wall-clock time.
#[derive(Debug)]
pub struct FixedTicker {
    tick: std::sync::atomic::AtomicU64,
}

impl FixedTicker {
    /// Start the ticker at `start`.
    pub fn new(start: u64) -> Self {
        FixedTicker {
            tick: std::sync::atomic::AtomicU64::new(start),
        }
    }

    /// Move the ticker forward by `delta` and return the new value.
    pub fn advance(&self, delta: u64) -> u64 {
        self.tick
            .fetch_add(delta, std::sync::atomic::Ordering::SeqCst)
            + delta
    }

    /// Pin the ticker to an exact value.
    pub fn set(&self, value: u64) {
        self.tick.store(value, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Ticker for FixedTicker {
    fn read(&self) -> u64 {
        self.tick.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Test double for [`Clock`]: always returns a value set by the test.
#[derive(Debug)]
pub struct FixedClock {
    millis: std::sync::atomic::AtomicU64,
}

impl FixedClock {
    /// Pin the clock to `millis`.
    pub fn new(millis: u64) -> Self {
        FixedClock {
            millis: std::sync::atomic::AtomicU64::new(millis),
        }
    }
}

impl Clock for FixedClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_ticker_advances_monotonically() {
        let ticker = FixedTicker::new(100);
        assert_eq!(ticker.read(), 100);
        assert_eq!(ticker.advance(50), 150);
        assert_eq!(ticker.read(), 150);
    }

    #[test]
    fn fixed_clock_is_pinned() {
        let clock = FixedClock::new(1_700_000_000_000);
        assert_eq!(clock.now_millis(), 1_700_000_000_000);
        assert_eq!(clock.now_millis(), 1_700_000_000_000);
    }

    #[test]
    fn system_ticker_is_monotonic() {
        let ticker = SystemTicker::new();
        let a = ticker.read();
        let b = ticker.read();
        assert!(b >= a);
    }
}
