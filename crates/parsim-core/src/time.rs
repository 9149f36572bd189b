//! Virtual time: the simulation's internal clock.
//!
//! Time is a signed 64-bit count of nanosecond ticks. Arithmetic saturates
//! toward [`VirtualTime::INFINITY`], which is reserved as the "never" value
//! (an empty queue reports it, an unconstrained horizon is it). Conversion to
//! and from floating seconds exists for I/O only; the kernel itself never
//! leaves tick space.

use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A point (or span) in simulation time, measured in ticks.
///
/// One tick is one nanosecond. Parses from strings with an optional unit
/// suffix: `"1.5"` (seconds), `"100ms"`, `"2us"`, `"3ns"`, `"2m"`, `"1h"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualTime(i64);

/// Ticks per second at the default resolution.
pub const TICKS_PER_SECOND: i64 = 1_000_000_000;

impl VirtualTime {
    /// The start of time.
    pub const ZERO: VirtualTime = VirtualTime(0);
    /// Reserved "never" value; all arithmetic saturates here.
    pub const INFINITY: VirtualTime = VirtualTime(i64::MAX);
    /// One nanosecond (one tick).
    pub const NANOSECOND: VirtualTime = VirtualTime(1);
    /// One microsecond.
    pub const MICROSECOND: VirtualTime = VirtualTime(1_000);
    /// One millisecond.
    pub const MILLISECOND: VirtualTime = VirtualTime(1_000_000);
    /// One second.
    pub const SECOND: VirtualTime = VirtualTime(TICKS_PER_SECOND);
    /// One minute.
    pub const MINUTE: VirtualTime = VirtualTime(60 * TICKS_PER_SECOND);
    /// One hour.
    pub const HOUR: VirtualTime = VirtualTime(3600 * TICKS_PER_SECOND);

    /// Construct from a raw tick count.
    pub const fn from_ticks(ticks: i64) -> Self {
        VirtualTime(ticks)
    }

    /// Raw tick count.
    pub const fn ticks(self) -> i64 {
        self.0
    }

    /// Construct from floating seconds, rounding to the nearest tick.
    /// Values at or beyond the representable range become `INFINITY`.
    pub fn from_seconds(seconds: f64) -> Self {
        let ticks = seconds * TICKS_PER_SECOND as f64;
        if ticks >= i64::MAX as f64 {
            VirtualTime::INFINITY
        } else if ticks <= i64::MIN as f64 {
            VirtualTime(i64::MIN)
        } else {
            VirtualTime(ticks.round() as i64)
        }
    }

    /// Value in floating seconds, for display and statistics.
    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / TICKS_PER_SECOND as f64
    }

    /// Whether this is the reserved `INFINITY` value.
    pub const fn is_infinite(self) -> bool {
        self.0 == i64::MAX
    }

    /// Saturating addition; any operand at `INFINITY` stays there.
    pub const fn saturating_add(self, rhs: VirtualTime) -> VirtualTime {
        if self.is_infinite() || rhs.is_infinite() {
            VirtualTime::INFINITY
        } else {
            VirtualTime(self.0.saturating_add(rhs.0))
        }
    }

    /// Saturating subtraction; `INFINITY` minus anything finite stays infinite.
    pub const fn saturating_sub(self, rhs: VirtualTime) -> VirtualTime {
        if self.is_infinite() {
            VirtualTime::INFINITY
        } else {
            VirtualTime(self.0.saturating_sub(rhs.0))
        }
    }

    /// The smaller of two times.
    pub fn min(self, other: VirtualTime) -> VirtualTime {
        if self.0 <= other.0 { self } else { other }
    }

    /// The larger of two times.
    pub fn max(self, other: VirtualTime) -> VirtualTime {
        if self.0 >= other.0 { self } else { other }
    }
}

impl Add for VirtualTime {
    type Output = VirtualTime;
    fn add(self, rhs: VirtualTime) -> VirtualTime {
        self.saturating_add(rhs)
    }
}

impl AddAssign for VirtualTime {
    fn add_assign(&mut self, rhs: VirtualTime) {
        *self = *self + rhs;
    }
}

impl Sub for VirtualTime {
    type Output = VirtualTime;
    fn sub(self, rhs: VirtualTime) -> VirtualTime {
        self.saturating_sub(rhs)
    }
}

impl SubAssign for VirtualTime {
    fn sub_assign(&mut self, rhs: VirtualTime) {
        *self = *self - rhs;
    }
}

impl Mul<i64> for VirtualTime {
    type Output = VirtualTime;
    fn mul(self, rhs: i64) -> VirtualTime {
        if self.is_infinite() {
            VirtualTime::INFINITY
        } else {
            match self.0.checked_mul(rhs) {
                Some(t) => VirtualTime(t),
                None => VirtualTime::INFINITY,
            }
        }
    }
}

impl fmt::Display for VirtualTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "inf")
        } else {
            write!(f, "{:.9}", self.as_seconds())
        }
    }
}

/// Error parsing a virtual time string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTimeError(String);

impl fmt::Display for ParseTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid virtual time: {:?}", self.0)
    }
}

impl std::error::Error for ParseTimeError {}

impl FromStr for VirtualTime {
    type Err = ParseTimeError;

    /// Accepts a decimal number with an optional unit suffix
    /// (`ns`, `us`, `ms`, `s`, `m`, `h`). A bare number is seconds.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseTimeError(s.to_string()));
        }
        let (number, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
            Some(pos) => s.split_at(pos),
            None => (s, "s"),
        };
        let value: f64 = number
            .trim()
            .parse()
            .map_err(|_| ParseTimeError(s.to_string()))?;
        let scale = match unit.trim() {
            "ns" => VirtualTime::NANOSECOND,
            "us" => VirtualTime::MICROSECOND,
            "ms" => VirtualTime::MILLISECOND,
            "s" => VirtualTime::SECOND,
            "m" => VirtualTime::MINUTE,
            "h" => VirtualTime::HOUR,
            _ => return Err(ParseTimeError(s.to_string())),
        };
        Ok(VirtualTime::from_seconds(value * scale.as_seconds()))
    }
}
