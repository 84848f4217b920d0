//! Millisecond clocks for session bookkeeping
//!
//! Types included allow reading and mocking out the wall clock used to
//! decide whether tokens are expiring, lockouts have elapsed, or a recheck
//! already ran recently.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use
)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::{
    fmt, ops,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Epoch time in milliseconds
///
/// The number of milliseconds elapsed since the beginning of the Unix
/// epoch on 1970/01/01 at 00:00:00 UTC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct EpochMillis(pub u64);

/// A span of time in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct DurationMillis(pub u64);

impl EpochMillis {
    /// Constructs an epoch time from whole seconds
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// The time elapsed since `earlier`, or zero if `earlier` is later
    #[inline]
    pub fn saturating_since(self, earlier: EpochMillis) -> DurationMillis {
        DurationMillis(self.0.saturating_sub(earlier.0))
    }
}

impl DurationMillis {
    /// No time at all
    pub const ZERO: Self = Self(0);

    /// Constructs a duration from whole seconds
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// Constructs a duration from whole minutes
    #[inline]
    pub const fn from_mins(mins: u64) -> Self {
        Self(mins.saturating_mul(60_000))
    }

    /// Whole seconds in this duration, rounded up
    ///
    /// Countdowns shown to a user should never read zero while time remains.
    #[inline]
    pub const fn as_secs_ceil(self) -> u64 {
        (self.0 + 999) / 1000
    }
}

impl From<SystemTime> for EpochMillis {
    #[inline]
    fn from(t: SystemTime) -> Self {
        let millis = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        EpochMillis(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}

impl From<Duration> for DurationMillis {
    #[inline]
    fn from(d: Duration) -> Self {
        DurationMillis(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

impl From<DurationMillis> for Duration {
    #[inline]
    fn from(d: DurationMillis) -> Self {
        Duration::from_millis(d.0)
    }
}

impl ops::Add<DurationMillis> for EpochMillis {
    type Output = EpochMillis;

    #[inline]
    fn add(self, rhs: DurationMillis) -> Self::Output {
        EpochMillis(self.0.saturating_add(rhs.0))
    }
}

impl ops::AddAssign<DurationMillis> for EpochMillis {
    #[inline]
    fn add_assign(&mut self, rhs: DurationMillis) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl ops::Sub<DurationMillis> for EpochMillis {
    type Output = EpochMillis;

    #[inline]
    fn sub(self, rhs: DurationMillis) -> Self::Output {
        EpochMillis(self.0.saturating_sub(rhs.0))
    }
}

/// Subtraction saturates at zero when `rhs` is later than `self`
impl ops::Sub for EpochMillis {
    type Output = DurationMillis;

    #[inline]
    fn sub(self, rhs: EpochMillis) -> Self::Output {
        self.saturating_since(rhs)
    }
}

impl ops::Add for DurationMillis {
    type Output = DurationMillis;

    #[inline]
    fn add(self, rhs: DurationMillis) -> Self::Output {
        DurationMillis(self.0.saturating_add(rhs.0))
    }
}

impl fmt::Display for EpochMillis {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Display for DurationMillis {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for EpochMillis {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for EpochMillis {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = u64::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for DurationMillis {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for DurationMillis {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = u64::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

/// Represents a clock, which can tell the current time
pub trait Clock {
    /// Gets the current time according to this clock
    fn now(&self) -> EpochMillis;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    #[inline]
    fn now(&self) -> EpochMillis {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn now(&self) -> EpochMillis {
        (**self).now()
    }
}

/// The system clock as provided by `std::time::SystemTime`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now(&self) -> EpochMillis {
        EpochMillis::from(SystemTime::now())
    }
}

/// A test clock which maintains the current time as shared internal state
///
/// Clones observe the same instant, so a clock handed to several components
/// can be advanced from the test body.
#[derive(Clone, Debug, Default)]
pub struct TestClock(Arc<AtomicU64>);

impl Clock for TestClock {
    #[inline]
    fn now(&self) -> EpochMillis {
        EpochMillis(self.0.load(Ordering::Acquire))
    }
}

impl TestClock {
    /// Creates a new test clock with the specified time
    #[inline]
    pub fn new(time: EpochMillis) -> Self {
        Self(Arc::new(AtomicU64::new(time.0)))
    }

    /// Updates the clock's current time to `val`
    pub fn set(&self, val: EpochMillis) {
        self.0.store(val.0, Ordering::Release);
    }

    /// Advances the clock's current time by `inc`
    pub fn advance(&self, inc: DurationMillis) {
        self.0.fetch_add(inc.0, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtraction_saturates_at_zero() {
        let early = EpochMillis(1_000);
        let late = EpochMillis(4_500);

        assert_eq!(late - early, DurationMillis(3_500));
        assert_eq!(early - late, DurationMillis::ZERO);
    }

    #[test]
    fn test_clock_clones_share_time() {
        let clock = TestClock::new(EpochMillis(10));
        let observer = clock.clone();

        clock.advance(DurationMillis::from_secs(2));

        assert_eq!(observer.now(), EpochMillis(2_010));

        observer.set(EpochMillis(5));
        assert_eq!(clock.now(), EpochMillis(5));
    }

    #[test]
    fn countdown_rounds_up() {
        assert_eq!(DurationMillis(1).as_secs_ceil(), 1);
        assert_eq!(DurationMillis(1_000).as_secs_ceil(), 1);
        assert_eq!(DurationMillis(1_001).as_secs_ceil(), 2);
        assert_eq!(DurationMillis::ZERO.as_secs_ceil(), 0);
    }

    #[test]
    fn duration_round_trips_through_std() {
        let d: Duration = DurationMillis::from_mins(5).into();
        assert_eq!(d, Duration::from_secs(300));
        assert_eq!(DurationMillis::from(d), DurationMillis(300_000));
    }
}
