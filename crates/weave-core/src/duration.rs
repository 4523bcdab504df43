//! Duration parsing for chain definitions.
//!
//! Chains written by hand or by a language model express delays and timeouts
//! as strings such as `"250ms"`, `"2s"` or `"1m30s"`. Integers are read as
//! milliseconds.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

use crate::error::{Result, WeaveError};

/// Parse a duration string made of `<number><unit>` segments.
///
/// Units: `ns`, `us`, `ms`, `s`, `m`, `h`. A bare number is milliseconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(WeaveError::Config("empty duration".into()));
    }

    if let Ok(ms) = s.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| WeaveError::Config(format!("missing unit in duration '{}'", input)))?;
        if digits == 0 {
            return Err(WeaveError::Config(format!("invalid duration '{}'", input)));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| WeaveError::Config(format!("invalid number in duration '{}'", input)))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let nanos_per_unit = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1_000.0,
            "ms" => 1_000_000.0,
            "s" => 1_000_000_000.0,
            "m" => 60_000_000_000.0,
            "h" => 3_600_000_000_000.0,
            other => {
                return Err(WeaveError::Config(format!(
                    "unknown unit '{}' in duration '{}'",
                    other, input
                )))
            }
        };
        total += Duration::from_nanos((value * nanos_per_unit) as u64);
    }

    Ok(total)
}

/// Render a duration the way [`parse_duration`] reads it back.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_nanos() % 1_000_000 != 0 {
        format!("{}ns", d.as_nanos())
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Millis(u64),
    Text(String),
}

/// Serde adapter for `Option<Duration>` fields.
///
/// Use with `#[serde(default, with = "crate::duration::option")]`.
pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, ser: S) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(d) => ser.serialize_str(&format_duration(*d)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Option<Duration>, D::Error> {
        let raw: Option<RawDuration> = Option::deserialize(de)?;
        match raw {
            None => Ok(None),
            Some(RawDuration::Millis(ms)) => Ok(Some(Duration::from_millis(ms))),
            Some(RawDuration::Text(text)) => parse_duration(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
