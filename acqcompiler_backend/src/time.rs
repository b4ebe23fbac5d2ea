//! Exact decimal time used for every timestamp in an action table.
//!
//! A [`Time`] is a signed count of ticks, with [`TICKS_PER_MS`] ticks per millisecond. All
//! arithmetic is integer arithmetic, so sums are associative and a tie-breaking offset such as
//! [`crate::zstack::EXPOSURE_EPSILON`] is never absorbed by rounding, however large the
//! timestamp it is added to.
//!
//! Floats enter through [`Time::from_millis`], which goes through the shortest decimal string
//! that round-trips the float. `0.1` therefore becomes exactly one tenth of a millisecond rather
//! than the nearest binary fraction.
//!
//! ```
//! use acqcompiler_backend::time::Time;
//!
//! let a = Time::from_millis(0.1).unwrap();
//! let b = Time::from_millis(0.2).unwrap();
//! assert_eq!(a + b, "0.3".parse::<Time>().unwrap());
//! ```

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ScheduleError, ScheduleResult};

/// Number of ticks in one millisecond (resolution of 1e-12 ms).
pub const TICKS_PER_MS: i128 = 1_000_000_000_000;
const FRAC_DIGITS: usize = 12;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(i128);

impl Time {
    pub const ZERO: Time = Time(0);

    pub const fn from_ticks(ticks: i128) -> Self {
        Time(ticks)
    }

    pub const fn from_whole_millis(ms: i64) -> Self {
        Time(ms as i128 * TICKS_PER_MS)
    }

    /// Converts a float millisecond value through its shortest round-trip decimal representation.
    ///
    /// Fails with [`ScheduleError::InvalidTime`] for NaN, infinities and values outside the
    /// representable range.
    pub fn from_millis(ms: f64) -> ScheduleResult<Self> {
        if !ms.is_finite() {
            return Err(ScheduleError::InvalidTime(ms.to_string()));
        }
        format!("{ms}").parse()
    }

    pub fn ticks(self) -> i128 {
        self.0
    }

    /// Lossy conversion for display and export; never feed the result back into a table.
    pub fn as_millis_f64(self) -> f64 {
        let whole = (self.0 / TICKS_PER_MS) as f64;
        let frac = (self.0 % TICKS_PER_MS) as f64 / TICKS_PER_MS as f64;
        whole + frac
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Time) -> Option<Time> {
        self.0.checked_add(other.0).map(Time)
    }
}

// Parses `[+-]digits[.digits][(e|E)[+-]digits]` into ticks, rounding half away from zero
// beyond the tick resolution.
fn parse_ticks(s: &str) -> Option<i128> {
    let s = s.trim();
    let (negative, rest) = match s.as_bytes().first()? {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    let (mantissa, exponent) = match rest.find(['e', 'E']) {
        Some(pos) => (&rest[..pos], rest[pos + 1..].parse::<i32>().ok()?),
        None => (rest, 0),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }

    let mut digits: i128 = 0;
    for c in int_part.chars().chain(frac_part.chars()) {
        let d = c.to_digit(10)? as i128;
        digits = digits.checked_mul(10)?.checked_add(d)?;
    }

    let shift = exponent as i64 - frac_part.len() as i64 + FRAC_DIGITS as i64;
    let magnitude = if shift >= 0 {
        let scale = 10i128.checked_pow(u32::try_from(shift).ok()?)?;
        digits.checked_mul(scale)?
    } else if -shift > 38 {
        0
    } else {
        let divisor = 10i128.pow((-shift) as u32);
        let (quotient, remainder) = (digits / divisor, digits % divisor);
        if remainder >= divisor - remainder {
            quotient + 1
        } else {
            quotient
        }
    };
    Some(if negative { -magnitude } else { magnitude })
}

impl FromStr for Time {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_ticks(s)
            .map(Time)
            .ok_or_else(|| ScheduleError::InvalidTime(s.to_string()))
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        let scale = TICKS_PER_MS as u128;
        let (whole, frac) = (magnitude / scale, magnitude % scale);
        if frac == 0 {
            write!(f, "{sign}{whole}")
        } else {
            let frac = format!("{:0width$}", frac, width = FRAC_DIGITS);
            write!(f, "{sign}{whole}.{}", frac.trim_end_matches('0'))
        }
    }
}

impl Add for Time {
    type Output = Time;
    fn add(self, rhs: Time) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl AddAssign for Time {
    fn add_assign(&mut self, rhs: Time) {
        self.0 += rhs.0;
    }
}

impl Sub for Time {
    type Output = Time;
    fn sub(self, rhs: Time) -> Time {
        Time(self.0 - rhs.0)
    }
}

impl SubAssign for Time {
    fn sub_assign(&mut self, rhs: Time) {
        self.0 -= rhs.0;
    }
}

impl Sum for Time {
    fn sum<I: Iterator<Item = Time>>(iter: I) -> Time {
        iter.fold(Time::ZERO, |acc, t| acc + t)
    }
}

impl Serialize for Time {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct TimeVisitor;

impl<'de> Visitor<'de> for TimeVisitor {
    type Value = Time;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a time in milliseconds, as a decimal string or a number")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Time, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Time, E> {
        Time::from_millis(v).map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Time, E> {
        Ok(Time::from_whole_millis(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Time, E> {
        Ok(Time(v as i128 * TICKS_PER_MS))
    }
}

impl<'de> Deserialize<'de> for Time {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(TimeVisitor)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn t(s: &str) -> Time {
        s.parse().unwrap()
    }

    #[test]
    fn parses_decimal_forms() {
        assert_eq!(t("1"), Time::from_whole_millis(1));
        assert_eq!(t("0.001").ticks(), 1_000_000_000);
        assert_eq!(t("1e-10").ticks(), 100);
        assert_eq!(t("-3.25"), Time::ZERO - t("3.25"));
        assert_eq!(t(".5"), t("0.5"));
        assert_eq!(t("2.5E2"), Time::from_whole_millis(250));
    }

    #[test]
    fn rounds_beyond_resolution() {
        assert_eq!(t("0.0000000000004").ticks(), 0);
        assert_eq!(t("0.0000000000005").ticks(), 1);
        assert_eq!(t("-0.0000000000005").ticks(), -1);
    }

    #[test]
    fn rejects_malformed_values() {
        for bad in ["", "-", "1.2.3", "abc", "1e", "."] {
            assert!(bad.parse::<Time>().is_err(), "{bad:?} should not parse");
        }
        assert!(Time::from_millis(f64::NAN).is_err());
        assert!(Time::from_millis(f64::INFINITY).is_err());
        assert!(Time::from_millis(1e300).is_err());
    }

    #[test]
    fn float_conversion_is_decimal() {
        let sum = Time::from_millis(0.1).unwrap() + Time::from_millis(0.2).unwrap();
        assert_eq!(sum, t("0.3"));
        assert_eq!(Time::from_millis(3.2).unwrap().to_string(), "3.2");
    }

    #[test]
    fn epsilon_survives_large_times() {
        let eps = t("1e-10");
        let large = Time::from_whole_millis(86_400_000);
        assert!(large + eps > large);
        assert_eq!((large + eps) - large, eps);
    }

    #[test]
    fn display_round_trips() {
        for s in ["0", "12", "-7.5", "0.0000000001", "123456.789"] {
            assert_eq!(t(s).to_string(), s);
        }
    }

    #[test]
    fn serde_accepts_strings_and_numbers() {
        let from_str: Time = serde_json::from_str("\"0.25\"").unwrap();
        let from_float: Time = serde_json::from_str("0.25").unwrap();
        let from_int: Time = serde_json::from_str("4").unwrap();
        assert_eq!(from_str, from_float);
        assert_eq!(from_int, Time::from_whole_millis(4));
        assert_eq!(serde_json::to_string(&from_str).unwrap(), "\"0.25\"");
    }
}
