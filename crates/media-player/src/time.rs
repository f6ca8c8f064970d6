//! Media timestamps.
//!
//! Every pts/dts/duration in the pipeline is a [`MediaTime`]: a signed count of
//! microseconds on the asset timeline. Signed so that drift and lateness can be
//! expressed with the same type.

use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const MICROS_PER_SEC: i64 = 1_000_000;

/// Signed media time with microsecond resolution.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MediaTime(i64);

impl MediaTime {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(i64::MAX);

    pub const fn from_micros(us: i64) -> Self {
        Self(us)
    }

    pub const fn from_millis(ms: i64) -> Self {
        Self(ms.saturating_mul(1000))
    }

    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(MICROS_PER_SEC))
    }

    /// Convert fractional seconds, rounding to the nearest microsecond.
    ///
    /// Non-finite input maps to zero.
    pub fn from_secs_f64(secs: f64) -> Self {
        if !secs.is_finite() {
            return Self::ZERO;
        }
        Self((secs * MICROS_PER_SEC as f64).round() as i64)
    }

    /// Time covered by `samples` sample frames at `rate` Hz.
    pub fn from_samples(samples: u64, rate: u32) -> Self {
        if rate == 0 {
            return Self::ZERO;
        }
        let us = (samples as i128 * MICROS_PER_SEC as i128) / rate as i128;
        Self(us.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }

    /// Time of `ticks` in a `numer/denom` time base.
    pub fn from_ticks(ticks: u64, numer: u32, denom: u32) -> Self {
        if denom == 0 {
            return Self::ZERO;
        }
        let us = (ticks as i128 * numer as i128 * MICROS_PER_SEC as i128) / denom as i128;
        Self(us.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }

    pub fn from_duration(d: Duration) -> Self {
        Self(i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub const fn as_millis(self) -> i64 {
        self.0 / 1000
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / MICROS_PER_SEC as f64
    }

    /// Nearest sample index at `rate` Hz (floor division for negative times).
    pub fn to_samples(self, rate: u32) -> i64 {
        let num = self.0 as i128 * rate as i128 + MICROS_PER_SEC as i128 / 2;
        num.div_euclid(MICROS_PER_SEC as i128) as i64
    }

    /// Wall-clock length of this span; negative spans clamp to zero.
    pub fn to_duration(self) -> Duration {
        Duration::from_micros(self.0.max(0) as u64)
    }

    /// Multiply by a (positive) factor, e.g. to convert media time to wall time at a rate.
    pub fn scale(self, factor: f64) -> Self {
        Self::from_secs_f64(self.as_secs_f64() * factor)
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub const fn abs(self) -> Self {
        Self(self.0.saturating_abs())
    }

    pub const fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.as_secs_f64())
    }
}

impl Add for MediaTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl AddAssign for MediaTime {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for MediaTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl SubAssign for MediaTime {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Neg for MediaTime {
    type Output = Self;

    fn neg(self) -> Self {
        Self(self.0.saturating_neg())
    }
}

impl From<Duration> for MediaTime {
    fn from(d: Duration) -> Self {
        Self::from_duration(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_conversions_are_exact_on_boundaries() {
        let t = MediaTime::from_samples(48_000, 48_000);
        assert_eq!(t, MediaTime::from_secs(1));
        assert_eq!(t.to_samples(48_000), 48_000);
        assert_eq!(MediaTime::from_secs(2).to_samples(44_100), 88_200);
    }

    #[test]
    fn to_samples_rounds_to_nearest() {
        // 1 sample at 48 kHz is 20.833us.
        assert_eq!(MediaTime::from_micros(20).to_samples(48_000), 1);
        assert_eq!(MediaTime::from_micros(10).to_samples(48_000), 0);
    }

    #[test]
    fn ticks_use_time_base() {
        assert_eq!(MediaTime::from_ticks(90_000, 1, 90_000), MediaTime::from_secs(1));
        assert_eq!(MediaTime::from_ticks(5, 1, 0), MediaTime::ZERO);
    }

    #[test]
    fn arithmetic_saturates() {
        assert_eq!(MediaTime::MAX + MediaTime::from_secs(1), MediaTime::MAX);
        let d = MediaTime::from_millis(5) - MediaTime::from_millis(7);
        assert!(d.is_negative());
        assert_eq!(d.abs(), MediaTime::from_millis(2));
        assert_eq!(d.to_duration(), Duration::ZERO);
    }

    #[test]
    fn non_finite_seconds_map_to_zero() {
        assert_eq!(MediaTime::from_secs_f64(f64::NAN), MediaTime::ZERO);
        assert_eq!(MediaTime::from_secs_f64(1.5), MediaTime::from_millis(1500));
    }
}
