// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Monotonic time for source expiry and LTP arbitration.
//!
//! The merge engine and the E1.31 source tracker both make decisions based
//! on "time since last heard". Tests need to move time forward without
//! sleeping, so everything that reads the clock goes through a [`Clock`]
//! handle backed by either the real monotonic clock or a manually advanced
//! one.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// A point on the monotonic timeline.
///
/// Thin wrapper over [`Instant`]; ordering and `+ Duration` behave the way
/// the merge code expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeStamp(Instant);

impl TimeStamp {
    /// Duration elapsed between `earlier` and this timestamp.
    ///
    /// Returns zero if `earlier` is in the future.
    pub fn since(&self, earlier: TimeStamp) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }
}

impl std::ops::Add<Duration> for TimeStamp {
    type Output = TimeStamp;

    fn add(self, rhs: Duration) -> TimeStamp {
        TimeStamp(self.0 + rhs)
    }
}

/// Source of monotonic time.
pub trait TimeSource {
    fn now(&self) -> TimeStamp;
}

/// The real monotonic clock.
#[derive(Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> TimeStamp {
        TimeStamp(Instant::now())
    }
}

/// A clock that only moves when told to.
///
/// `now()` returns a fixed origin plus the accumulated offset, so tests can
/// expire sources by calling [`MockTimeSource::advance`].
#[derive(Debug)]
pub struct MockTimeSource {
    origin: Instant,
    offset: Cell<Duration>,
}

impl MockTimeSource {
    pub fn new() -> Self {
        MockTimeSource {
            origin: Instant::now(),
            offset: Cell::new(Duration::ZERO),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.offset.set(self.offset.get() + by);
    }
}

impl Default for MockTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MockTimeSource {
    fn now(&self) -> TimeStamp {
        TimeStamp(self.origin + self.offset.get())
    }
}

/// Cheaply cloneable handle to a time source.
///
/// Everything on the main loop shares one of these; it is not `Send` and is
/// never handed to the discovery thread (which only uses loop timeouts).
#[derive(Clone)]
pub struct Clock {
    source: Rc<dyn TimeSource>,
}

impl Clock {
    /// A clock backed by the real monotonic clock.
    pub fn system() -> Self {
        Clock {
            source: Rc::new(SystemTimeSource),
        }
    }

    /// A clock backed by a [`MockTimeSource`]; the source is returned so the
    /// caller can advance it.
    pub fn mock() -> (Self, Rc<MockTimeSource>) {
        let source = Rc::new(MockTimeSource::new());
        (
            Clock {
                source: source.clone(),
            },
            source,
        )
    }

    pub fn now(&self) -> TimeStamp {
        self.source.now()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotonic() {
        let clock = Clock::system();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_mock_clock_advances() {
        let (clock, source) = Clock::mock();
        let a = clock.now();
        source.advance(Duration::from_millis(2500));
        let b = clock.now();
        assert_eq!(b.since(a), Duration::from_millis(2500));
        assert!(b > a);
    }

    #[test]
    fn test_since_saturates() {
        let (clock, source) = Clock::mock();
        let a = clock.now();
        source.advance(Duration::from_secs(1));
        let b = clock.now();
        assert_eq!(a.since(b), Duration::ZERO);
    }

    #[test]
    fn test_add_interval() {
        let (clock, source) = Clock::mock();
        let expiry = clock.now() + Duration::from_millis(100);
        source.advance(Duration::from_millis(99));
        assert!(clock.now() < expiry);
        source.advance(Duration::from_millis(2));
        assert!(clock.now() > expiry);
    }
}
