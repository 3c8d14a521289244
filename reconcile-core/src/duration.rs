//! Durations in Go's `time.ParseDuration` format.
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time};

/// A non-negative duration that (de)serializes as a Go duration string
///
/// Controller settings such as backoff delays and sync timeouts are written as
/// `"5ms"`, `"30s"` or `"16m40s"` in configuration files. This type wraps a
/// [`std::time::Duration`] and accepts that format.
///
/// ```
/// use reconcile_core::Duration;
/// let d: Duration = "1m30s".parse().unwrap();
/// assert_eq!(std::time::Duration::from(d).as_secs(), 90);
/// assert_eq!(d.to_string(), "1m30s");
/// ```
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(time::Duration);

/// Errors returned by the [`FromStr`] implementation for [`Duration`].
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    /// The input was empty
    #[error("empty duration")]
    Empty,

    /// An invalid unit was provided.
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    /// No unit was provided.
    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    /// Negative durations have no meaning for delays and timeouts
    #[error("duration must not be negative")]
    Negative,

    /// The duration does not fit a [`std::time::Duration`]
    #[error("duration out of range")]
    OutOfRange,

    /// The number associated with a given unit was invalid.
    #[error("invalid floating-point number: {}", .0)]
    NotANumber(#[from] std::num::ParseFloatError),
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

const MINUTE: time::Duration = time::Duration::from_secs(60);
const HOUR: time::Duration = time::Duration::from_secs(60 * 60);

impl From<time::Duration> for Duration {
    fn from(duration: time::Duration) -> Self {
        Self(duration)
    }
}

impl From<Duration> for time::Duration {
    fn from(Duration(duration): Duration) -> Self {
        duration
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.0;
        if d.is_zero() {
            return f.write_str("0s");
        }
        if d < time::Duration::from_secs(1) {
            let nanos = d.subsec_nanos();
            return if nanos % 1_000_000 == 0 {
                write!(f, "{}ms", nanos / 1_000_000)
            } else if nanos % 1_000 == 0 {
                write!(f, "{}us", nanos / 1_000)
            } else {
                write!(f, "{nanos}ns")
            };
        }
        let secs = d.as_secs();
        let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        if hours > 0 {
            write!(f, "{hours}h")?;
        }
        if hours > 0 || minutes > 0 {
            write!(f, "{minutes}m")?;
        }
        let nanos = d.subsec_nanos();
        if nanos == 0 {
            write!(f, "{seconds}s")
        } else {
            let frac = format!("{nanos:09}");
            write!(f, "{seconds}.{}s", frac.trim_end_matches('0'))
        }
    }
}

impl FromStr for Duration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if s.starts_with('-') {
            return Err(ParseError::Negative);
        }
        let mut s = s.trim_start_matches('+');

        let mut total = time::Duration::ZERO;
        while !s.is_empty() && s != "0" {
            let unit_start = s.find(|c: char| c.is_alphabetic()).ok_or(ParseError::NoUnit)?;

            let (val, rest) = s.split_at(unit_start);
            let val = val.parse::<f64>()?;
            let unit = match rest.find(|c: char| !c.is_alphabetic()) {
                Some(next_numeric_start) => {
                    let (unit, rest) = rest.split_at(next_numeric_start);
                    s = rest;
                    unit
                }
                None => {
                    s = "";
                    rest
                }
            };

            let base = match unit {
                "ns" => time::Duration::from_nanos(1),
                // U+00B5 is the "micro sign" while U+03BC is "Greek letter mu"
                "us" | "\u{00b5}s" | "\u{03bc}s" => time::Duration::from_micros(1),
                "ms" => time::Duration::from_millis(1),
                "s" => time::Duration::from_secs(1),
                "m" => MINUTE,
                "h" => HOUR,
                _ => return Err(ParseError::InvalidUnit),
            };

            let part = if val.fract() == 0.0 && val <= f64::from(u32::MAX) {
                base.checked_mul(val as u32)
            } else {
                time::Duration::try_from_secs_f64(base.as_secs_f64() * val).ok()
            }
            .ok_or(ParseError::OutOfRange)?;
            total = total.checked_add(part).ok_or(ParseError::OutOfRange)?;
        }

        Ok(Duration(total))
    }
}

impl Serialize for Duration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;
        impl de::Visitor<'_> for Visitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string in Go `time.Duration.String()` format")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value.parse::<Duration>().map_err(de::Error::custom)
            }
        }
        deserializer.deserialize_str(Visitor)
    }
}
