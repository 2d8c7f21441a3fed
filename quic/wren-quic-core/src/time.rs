// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Time related datatypes and functions
//!
//! Timestamps are opaque monotonic microsecond counts with no relation to
//! calendar time. They should only be compared when sourced from the same
//! clock.

use core::{fmt, num::NonZeroU64, task::Poll, time::Duration};

/// An absolute point in time, with microsecond resolution.
///
/// The size of `Timestamp` is guaranteed to be consistent across platforms
/// and it has a niche for `Option<Timestamp>`.
#[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct Timestamp(NonZeroU64);

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Timestamp({:?})", self.as_duration())
    }
}

impl Timestamp {
    /// Creates a `Timestamp` from a `Duration` since the clock's epoch
    #[inline]
    pub fn from_duration(duration: Duration) -> Self {
        let micros = duration.as_micros() as u64;
        // offset by 1 so a zero duration is still representable
        Self(NonZeroU64::new(micros + 1).expect("timestamp overflow"))
    }

    /// Returns the `Duration` since the clock's epoch
    #[inline]
    pub fn as_duration(self) -> Duration {
        Duration::from_micros(self.0.get() - 1)
    }

    /// Returns the `Duration` which elapsed since an earlier `Timestamp`,
    /// or zero if `earlier` is more recent.
    #[inline]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.get().saturating_sub(earlier.0.get()))
    }

    #[inline]
    pub fn checked_add(self, duration: Duration) -> Option<Self> {
        let micros: u64 = duration.as_micros().try_into().ok()?;
        let value = self.0.get().checked_add(micros)?;
        Some(Self(NonZeroU64::new(value)?))
    }

    #[inline]
    pub fn checked_sub(self, duration: Duration) -> Option<Self> {
        let micros: u64 = duration.as_micros().try_into().ok()?;
        let value = self.0.get().checked_sub(micros)?;
        Some(Self(NonZeroU64::new(value)?))
    }

    /// Returns true if the `Timestamp` occurs at or before the given time
    #[inline]
    pub fn has_elapsed(self, now: Self) -> bool {
        self <= now
    }
}

impl core::ops::Add<Duration> for Timestamp {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Duration) -> Self {
        self.checked_add(rhs).expect("timestamp overflow")
    }
}

impl core::ops::AddAssign<Duration> for Timestamp {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl core::ops::Sub<Duration> for Timestamp {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Duration) -> Self {
        self.checked_sub(rhs).expect("timestamp underflow")
    }
}

impl core::ops::Sub for Timestamp {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Self) -> Duration {
        self.saturating_duration_since(rhs)
    }
}

/// A timer that is explicitly polled rather than registered in a timer wheel.
///
/// These are owned by individual components; the connection aggregates the
/// earliest expiration over all of them through [`Provider`].
///
/// Note: The timer doesn't implement Copy to ensure it isn't accidentally moved
///       and have the expiration discarded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Timer {
    expiration: Option<Timestamp>,
}

impl Timer {
    /// Sets the timer to expire at the given timestamp
    #[inline]
    pub fn set(&mut self, time: Timestamp) {
        self.expiration = Some(time);
    }

    /// Cancels the timer.
    /// After cancellation, a timer will no longer report as expired.
    #[inline]
    pub fn cancel(&mut self) {
        self.expiration = None;
    }

    /// Returns true if the timer has expired
    #[inline]
    pub fn is_expired(&self, current_time: Timestamp) -> bool {
        match self.expiration {
            Some(timeout) => timeout.has_elapsed(current_time),
            _ => false,
        }
    }

    /// Returns true if the timer is armed
    #[inline]
    pub fn is_armed(&self) -> bool {
        self.expiration.is_some()
    }

    /// Returns the expiration, if armed
    #[inline]
    pub fn expiration(&self) -> Option<Timestamp> {
        self.expiration
    }

    /// Notifies the timer of the current time.
    /// If the timer's expiration occurs at or before the current time, it is
    /// cancelled and `Ready` is returned.
    #[inline]
    pub fn poll_expiration(&mut self, current_time: Timestamp) -> Poll<()> {
        if self.is_expired(current_time) {
            self.cancel();
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

pub mod timer {
    use super::Timestamp;

    pub struct QueryBreak;

    pub type Result = core::result::Result<(), QueryBreak>;

    /// A view over the timers a component has armed
    pub trait Query {
        fn on_timer(&mut self, expiration: Timestamp) -> Result;
    }

    /// Components expose their armed timers through this trait so the
    /// connection can compute the next wakeup time.
    pub trait Provider {
        fn timers<Q: Query>(&self, query: &mut Q) -> Result;

        /// Returns the earliest armed expiration, if any
        #[inline]
        fn next_expiration(&self) -> Option<Timestamp> {
            let mut earliest = Earliest(None);
            let _ = self.timers(&mut earliest);
            earliest.0
        }
    }

    impl Query for Earliest {
        #[inline]
        fn on_timer(&mut self, expiration: Timestamp) -> Result {
            self.0 = Some(match self.0 {
                Some(current) => current.min(expiration),
                None => expiration,
            });
            Ok(())
        }
    }

    struct Earliest(Option<Timestamp>);

    impl Provider for super::Timer {
        #[inline]
        fn timers<Q: Query>(&self, query: &mut Q) -> Result {
            if let Some(expiration) = self.expiration() {
                query.on_timer(expiration)?;
            }
            Ok(())
        }
    }
}

/// A source of `Timestamp`s
pub trait Clock {
    fn get_time(&self) -> Timestamp;
}

/// A clock which always returns the same time; useful when a timestamp is
/// needed but never compared.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopClock;

impl Clock for NoopClock {
    #[inline]
    fn get_time(&self) -> Timestamp {
        Timestamp::from_duration(Duration::from_micros(0))
    }
}

pub mod testing {
    use super::*;
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    /// A manually advanced clock for tests; clones share the same time
    #[derive(Clone, Debug)]
    pub struct Clock {
        micros: Arc<AtomicU64>,
    }

    impl Default for Clock {
        fn default() -> Self {
            Self {
                micros: Arc::new(AtomicU64::new(1_000)),
            }
        }
    }

    impl Clock {
        pub fn inc_by(&self, duration: Duration) {
            self.micros
                .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
        }
    }

    impl super::Clock for Clock {
        fn get_time(&self) -> Timestamp {
            Timestamp::from_duration(Duration::from_micros(self.micros.load(Ordering::SeqCst)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_lifecycle_test() {
        let now = NoopClock.get_time();
        let mut timer = Timer::default();

        assert!(!timer.is_armed());
        assert!(!timer.is_expired(now));

        timer.set(now + Duration::from_millis(10));
        assert!(timer.is_armed());
        assert!(!timer.is_expired(now));
        assert_eq!(timer.poll_expiration(now), Poll::Pending);

        let later = now + Duration::from_millis(10);
        assert!(timer.is_expired(later));
        assert_eq!(timer.poll_expiration(later), Poll::Ready(()));

        // polling cancels the expiration
        assert!(!timer.is_armed());
        assert_eq!(timer.poll_expiration(later), Poll::Pending);
    }

    #[test]
    fn timestamp_math_test() {
        let a = Timestamp::from_duration(Duration::from_millis(5));
        let b = a + Duration::from_millis(10);

        assert_eq!(b - a, Duration::from_millis(10));
        assert_eq!(a - b, Duration::ZERO);
        assert_eq!(a.saturating_duration_since(b), Duration::ZERO);
        assert!(a.has_elapsed(b));
        assert!(!b.has_elapsed(a));
    }
}
