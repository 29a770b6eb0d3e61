//! Time utilities for SNP
//!
//! Monotonic timestamps for heartbeat deadlines and a simple interval timer
//! driving the periodic work in the drivers' update passes.

use std::ops::{Add, Sub};
use std::time::{Duration, Instant};

/// Monotonic timestamp
///
/// Wraps `std::time::Instant`; used for heartbeat liveness tracking and
/// retransmission deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(Instant);

impl Timestamp {
    #[inline]
    pub fn now() -> Self {
        Timestamp(Instant::now())
    }

    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        self.0.duration_since(earlier.0)
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, duration: Duration) -> Timestamp {
        Timestamp(self.0 + duration)
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, other: Timestamp) -> Duration {
        self.0.duration_since(other.0)
    }
}

/// Fixed-interval timer driving the heartbeat cadence.
pub struct Timer {
    interval: Duration,
    last_fire: Timestamp,
}

impl Timer {
    /// A fresh timer starts its first interval immediately.
    pub fn new(interval: Duration) -> Self {
        Timer {
            interval,
            last_fire: Timestamp::now(),
        }
    }

    pub fn expired(&self) -> bool {
        self.last_fire.elapsed() >= self.interval
    }

    pub fn reset(&mut self) {
        self.last_fire = Timestamp::now();
    }

    /// Consume one elapsed interval: true at most once per interval.
    pub fn try_fire(&mut self) -> bool {
        if self.expired() {
            self.reset();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_timestamp_difference_tracks_sleep() {
        let before = Timestamp::now();
        thread::sleep(Duration::from_millis(15));
        let after = Timestamp::now();

        assert!(after - before >= Duration::from_millis(15));
        assert!(after.duration_since(before) == after - before);
        assert!((before + Duration::from_millis(15)) <= after);
    }

    #[test]
    fn test_timer_expires_and_resets() {
        let mut timer = Timer::new(Duration::from_millis(5));
        assert!(!timer.expired());

        thread::sleep(Duration::from_millis(6));
        assert!(timer.expired());

        timer.reset();
        assert!(!timer.expired());
    }

    #[test]
    fn test_try_fire_once_per_interval() {
        let mut timer = Timer::new(Duration::from_millis(5));
        assert!(!timer.try_fire());

        thread::sleep(Duration::from_millis(6));
        assert!(timer.try_fire());
        // The fire consumed the interval; the next one has not elapsed yet.
        assert!(!timer.try_fire());
    }
}
