//! The tick clock and its duration / time point types.
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

use crate::{
    cfg::TICK_RATE_HZ,
    klock::{lock_cpu, CpuLockCell, CriticalSection},
};

/// A span of time, measured in kernel ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration {
    ticks: u64,
}

impl Duration {
    pub const ZERO: Self = Self { ticks: 0 };

    #[inline]
    pub const fn from_ticks(ticks: u64) -> Self {
        Self { ticks }
    }

    /// Convert from milliseconds, rounding up to the next whole tick.
    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            ticks: (millis * TICK_RATE_HZ as u64).div_ceil(1000),
        }
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            ticks: secs * TICK_RATE_HZ as u64,
        }
    }

    #[inline]
    pub const fn as_ticks(self) -> u64 {
        self.ticks
    }
}

impl Add for Duration {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self {
            ticks: self.ticks + rhs.ticks,
        }
    }
}

impl AddAssign for Duration {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        self.ticks += rhs.ticks;
    }
}

impl Sub for Duration {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self {
            ticks: self.ticks.saturating_sub(rhs.ticks),
        }
    }
}

/// A point on the [`TickClock`] timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TimePoint {
    ticks: u64,
}

impl TimePoint {
    #[inline]
    pub const fn from_ticks(ticks: u64) -> Self {
        Self { ticks }
    }

    #[inline]
    pub const fn as_ticks(self) -> u64 {
        self.ticks
    }

    /// The duration elapsed since `earlier`, or zero if `earlier` is in
    /// the future.
    #[inline]
    pub const fn duration_since(self, earlier: TimePoint) -> Duration {
        Duration::from_ticks(self.ticks.saturating_sub(earlier.ticks))
    }
}

impl Add<Duration> for TimePoint {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Duration) -> Self {
        Self {
            ticks: self.ticks + rhs.as_ticks(),
        }
    }
}

impl Sub<TimePoint> for TimePoint {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: TimePoint) -> Duration {
        self.duration_since(rhs)
    }
}

/// The monotonic kernel clock.
///
/// A 64-bit counter of ticks, incremented by the tick interrupt. The tick
/// period is fixed at configuration time ([`TICK_RATE_HZ`]).
pub struct TickClock;

static TICK_COUNT: CpuLockCell<u64> = CpuLockCell::new(0);

impl TickClock {
    /// The current value of the clock.
    pub fn now() -> TimePoint {
        let guard = lock_cpu();
        Self::now_locked(guard.token())
    }

    #[inline]
    pub(crate) fn now_locked(cs: CriticalSection<'_>) -> TimePoint {
        TimePoint::from_ticks(TICK_COUNT.get(cs))
    }

    /// Advance the clock by one tick. Called by the tick interrupt.
    #[inline]
    pub(crate) fn advance(cs: CriticalSection<'_>) -> TimePoint {
        TimePoint::from_ticks(TICK_COUNT.update(cs, |x| x + 1))
    }
}

impl fmt::Debug for TickClock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TickClock")
            .field("now", &TickClock::now())
            .finish()
    }
}

/// Compute the absolute deadline for a relative timeout.
///
/// One tick of slack is added so that the deadline timer cannot fire in
/// the same tick as the request; `d` is thereby a guaranteed *minimum*
/// wait.
#[inline]
pub(crate) fn deadline_after(duration: Duration) -> TimePoint {
    TickClock::now() + duration + Duration::from_ticks(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_conversions() {
        assert_eq!(Duration::from_secs(2).as_ticks(), 2 * TICK_RATE_HZ as u64);
        // Rounds up to a whole tick.
        assert_eq!(Duration::from_millis(1).as_ticks(), 1);
        assert_eq!(
            Duration::from_millis(1000).as_ticks(),
            TICK_RATE_HZ as u64
        );
    }

    #[test]
    fn time_point_arithmetic() {
        let t0 = TimePoint::from_ticks(10);
        let t1 = t0 + Duration::from_ticks(5);
        assert_eq!(t1.as_ticks(), 15);
        assert_eq!(t1 - t0, Duration::from_ticks(5));
        // Saturates instead of going negative.
        assert_eq!(t0 - t1, Duration::ZERO);
    }
}
