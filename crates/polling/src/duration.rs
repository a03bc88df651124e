//! Human-readable duration strings.
//!
//! Poll frequencies and backoff intervals are declared as strings such as
//! `"5m"`, `"1h30m"`, `"30s"` or `"250ms"`. Units may be combined in any
//! order; each number must be followed by a unit.
//!
//! | Unit | Meaning |
//! |------|---------|
//! | `ms` | milliseconds |
//! | `s`  | seconds |
//! | `m`  | minutes |
//! | `h`  | hours |
//! | `d`  | days |

use std::time::Duration;

use thiserror::Error;

/// A duration string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("duration cannot be empty")]
    Empty,

    #[error("invalid duration '{input}': {reason}")]
    Invalid { input: String, reason: String },
}

/// Parses a human-readable duration such as `"1h30m"`.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(DurationError::Empty);
    }

    let invalid = |reason: &str| DurationError::Invalid {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(invalid("expected a number"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| invalid("number out of range"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        if unit_len == 0 {
            return Err(invalid("missing unit"));
        }
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(60 * 60)),
            "d" => Duration::from_secs(value.saturating_mul(24 * 60 * 60)),
            other => return Err(invalid(&format!("unknown unit '{other}'"))),
        };
        rest = &rest[unit_len..];

        total = total
            .checked_add(part)
            .ok_or_else(|| invalid("duration overflows"))?;
    }

    Ok(total)
}

/// Formats a duration in the same notation [`parse_duration`] accepts.
///
/// Sub-millisecond precision is dropped.
pub fn format_duration(duration: Duration) -> String {
    let mut millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    for (unit, size) in [("d", 86_400_000u128), ("h", 3_600_000), ("m", 60_000), ("s", 1_000), ("ms", 1)] {
        let count = millis / size;
        if count > 0 {
            out.push_str(&format!("{count}{unit}"));
            millis %= size;
        }
    }
    out
}

/// Serde adapter for `Duration` fields written as duration strings.
///
/// Use with `#[serde(with = "polling::duration::serde_str")]`.
pub mod serde_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
