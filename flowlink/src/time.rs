//! Millisecond time types.
//!
//! Every algorithm in this crate takes `now` as an argument instead of
//! reading a clock, so the same code runs under an interrupt timer, an
//! embassy time driver, or the simulator.

use core::ops::{Add, AddAssign, Sub};

/// Point in time, in milliseconds since node boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Boot instant.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Latest representable instant.
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1000))
    }

    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is in the future.
    ///
    /// Pulse timestamps are written from interrupt context and may be a
    /// millisecond ahead of a `now` sampled just before the interrupt fired.
    #[inline]
    pub const fn saturating_sub(self, earlier: Timestamp) -> Duration {
        Duration(self.0.saturating_sub(earlier.0))
    }

    #[inline]
    pub const fn saturating_add(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn add(self, rhs: Duration) -> Timestamp {
        self.saturating_add(rhs)
    }
}

impl AddAssign<Duration> for Timestamp {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        *self = self.saturating_add(rhs);
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Timestamp) -> Duration {
        self.saturating_sub(rhs)
    }
}

/// Span of time in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(u64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Duration(ms)
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Duration(secs.saturating_mul(1000))
    }

    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Milliseconds as a `u32`, saturating. This is the width ages travel with on the wire.
    #[inline]
    pub const fn as_millis_u32(self) -> u32 {
        if self.0 > u32::MAX as u64 {
            u32::MAX
        } else {
            self.0 as u32
        }
    }
}

impl Add for Duration {
    type Output = Duration;

    #[inline]
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_add(rhs.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_never_underflows() {
        let pulse = Timestamp::from_millis(1001);
        let now = Timestamp::from_millis(1000);
        assert_eq!(now - pulse, Duration::ZERO);
        assert_eq!(pulse - now, Duration::from_millis(1));
    }

    #[test]
    fn test_wire_age_saturates() {
        let d = Duration::from_millis(u64::from(u32::MAX) + 10);
        assert_eq!(d.as_millis_u32(), u32::MAX);
        assert_eq!(Duration::from_secs(2).as_millis_u32(), 2000);
    }

    #[test]
    fn test_add_saturates() {
        assert_eq!(Timestamp::MAX + Duration::from_secs(1), Timestamp::MAX);
        let mut t = Timestamp::from_secs(1);
        t += Duration::from_millis(250);
        assert_eq!(t.as_millis(), 1250);
    }
}
