//! Time abstractions
//!
//! The kernel clock counts microseconds since boot. Timeslice quanta, period
//! lengths and deadlines are all expressed in this unit.

use core::ops::{Add, AddAssign, Sub};
use serde::{Deserialize, Serialize};

/// A point on the kernel clock
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Instant {
    micros: u64,
}

impl Instant {
    /// Boot time
    pub const BOOT: Instant = Instant { micros: 0 };

    pub const fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    pub const fn as_micros(&self) -> u64 {
        self.micros
    }

    /// Returns the duration since another instant (zero if `earlier` is later)
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration::from_micros(self.micros.saturating_sub(earlier.micros))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, duration: Duration) -> Self::Output {
        Instant::from_micros(self.micros.saturating_add(duration.as_micros()))
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, duration: Duration) -> Self::Output {
        Instant::from_micros(self.micros.saturating_sub(duration.as_micros()))
    }
}

/// A span on the kernel clock
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Duration {
    micros: u64,
}

impl Duration {
    pub const ZERO: Duration = Duration { micros: 0 };

    pub const fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self {
            micros: millis * 1_000,
        }
    }

    pub const fn as_micros(&self) -> u64 {
        self.micros
    }

    pub const fn as_millis(&self) -> u64 {
        self.micros / 1_000
    }

    pub const fn is_zero(&self) -> bool {
        self.micros == 0
    }

    pub fn saturating_sub(self, other: Duration) -> Duration {
        Duration::from_micros(self.micros.saturating_sub(other.micros))
    }

    pub fn checked_add(self, other: Duration) -> Option<Duration> {
        self.micros.checked_add(other.micros).map(Duration::from_micros)
    }
}

impl Add for Duration {
    type Output = Duration;

    fn add(self, other: Duration) -> Self::Output {
        Duration::from_micros(self.micros.saturating_add(other.micros))
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, other: Duration) {
        *self = *self + other;
    }
}

impl Sub for Duration {
    type Output = Duration;

    fn sub(self, other: Duration) -> Self::Output {
        self.saturating_sub(other)
    }
}
