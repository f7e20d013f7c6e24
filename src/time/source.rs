//! Time sources for schedulers.
//!
//! A [`Scheduler`](super::Scheduler) reads the current time through
//! [`TimeSource`]. Production code uses [`WallClock`]; tests use
//! [`VirtualClock`], which only moves when told to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::types::Time;
use crate::types::id::duration_to_nanos_saturating;

/// Time source abstraction for getting the current time.
pub trait TimeSource: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// Wall clock time source.
///
/// The epoch is the moment this source was created.
#[derive(Debug)]
pub struct WallClock {
    epoch: Instant,
}

impl WallClock {
    /// Creates a new wall clock time source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for WallClock {
    fn now(&self) -> Time {
        Time::from_nanos(duration_to_nanos_saturating(self.epoch.elapsed()))
    }
}

/// Virtual time source for deterministic tests.
///
/// # Example
///
/// ```
/// use deferred::time::{TimeSource, VirtualClock};
/// use deferred::types::Time;
///
/// let clock = VirtualClock::new();
/// assert_eq!(clock.now(), Time::ZERO);
///
/// clock.advance(1_000_000_000); // 1 second
/// assert_eq!(clock.now(), Time::from_secs(1));
/// ```
#[derive(Debug, Default)]
pub struct VirtualClock {
    now: AtomicU64,
}

impl VirtualClock {
    /// Creates a new virtual clock starting at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a virtual clock starting at the given time.
    #[must_use]
    pub fn starting_at(time: Time) -> Self {
        Self {
            now: AtomicU64::new(time.as_nanos()),
        }
    }

    /// Advances time by the given number of nanoseconds, saturating.
    pub fn advance(&self, nanos: u64) {
        let _ = self
            .now
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                Some(t.saturating_add(nanos))
            });
    }

    /// Moves time forward to `time`. Never moves it backwards.
    pub fn advance_to(&self, time: Time) {
        self.now.fetch_max(time.as_nanos(), Ordering::AcqRel);
    }

    /// Sets the current time, forwards or backwards.
    pub fn set(&self, time: Time) {
        self.now.store(time.as_nanos(), Ordering::Release);
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> Time {
        Time::from_nanos(self.now.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_clock_only_moves_forward_on_advance_to() {
        let clock = VirtualClock::starting_at(Time::from_secs(5));
        clock.advance_to(Time::from_secs(3));
        assert_eq!(clock.now(), Time::from_secs(5));
        clock.advance_to(Time::from_secs(7));
        assert_eq!(clock.now(), Time::from_secs(7));
        clock.set(Time::from_secs(1));
        assert_eq!(clock.now(), Time::from_secs(1));
    }

    #[test]
    fn virtual_clock_advance_saturates() {
        let clock = VirtualClock::starting_at(Time::MAX);
        clock.advance(10);
        assert_eq!(clock.now(), Time::MAX);
    }

    #[test]
    fn wall_clock_is_monotonic() {
        let clock = WallClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
