//! ISO-8601 durations (`PT24H`, `P1DT30M`, `PT0.5S`) for configuration files.
//!
//! Only the calendar-free subset is accepted: weeks, days, hours, minutes and
//! (fractional) seconds. Years and months have no fixed length and are
//! rejected.

use std::time::Duration;

use crate::error::{CacheError, CacheResult};

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * SECS_PER_MINUTE;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;
const SECS_PER_WEEK: u64 = 7 * SECS_PER_DAY;

/// Parses an ISO-8601 duration.
pub fn parse_iso8601(input: &str) -> CacheResult<Duration> {
    let invalid = |why: &str| {
        CacheError::invalid_configuration(format!("invalid ISO-8601 duration '{input}': {why}"))
    };

    let text = input.trim();
    let rest = text
        .strip_prefix('P')
        .or_else(|| text.strip_prefix('p'))
        .ok_or_else(|| invalid("must start with 'P'"))?;
    if rest.is_empty() {
        return Err(invalid("no components"));
    }

    let (date_part, time_part) = match rest.find(['T', 't']) {
        Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
        None => (rest, None),
    };
    if time_part.is_some_and(str::is_empty) {
        return Err(invalid("empty time section"));
    }

    let mut total = Duration::ZERO;
    for (value, unit) in components(date_part).map_err(|why| invalid(why))? {
        let scale = match unit {
            'W' => SECS_PER_WEEK,
            'D' => SECS_PER_DAY,
            'Y' | 'M' => return Err(invalid("years and months are not supported")),
            _ => return Err(invalid("unknown date unit")),
        };
        total += scaled(value, scale).map_err(|why| invalid(why))?;
    }
    if let Some(time_part) = time_part {
        for (value, unit) in components(time_part).map_err(|why| invalid(why))? {
            let scale = match unit {
                'H' => SECS_PER_HOUR,
                'M' => SECS_PER_MINUTE,
                'S' => 1,
                _ => return Err(invalid("unknown time unit")),
            };
            total += scaled(value, scale).map_err(|why| invalid(why))?;
        }
    }
    Ok(total)
}

/// Formats a duration as ISO-8601, using the largest exact units.
pub fn format_iso8601(duration: Duration) -> String {
    if duration.is_zero() {
        return "PT0S".to_string();
    }
    let mut secs = duration.as_secs();
    let nanos = duration.subsec_nanos();
    let mut out = String::from("P");

    let days = secs / SECS_PER_DAY;
    secs %= SECS_PER_DAY;
    if days > 0 {
        out.push_str(&format!("{days}D"));
    }
    if secs == 0 && nanos == 0 {
        return out;
    }

    out.push('T');
    let hours = secs / SECS_PER_HOUR;
    secs %= SECS_PER_HOUR;
    let minutes = secs / SECS_PER_MINUTE;
    secs %= SECS_PER_MINUTE;
    if hours > 0 {
        out.push_str(&format!("{hours}H"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}M"));
    }
    if nanos > 0 {
        let fraction = format!("{nanos:09}");
        out.push_str(&format!("{secs}.{}S", fraction.trim_end_matches('0')));
    } else if secs > 0 {
        out.push_str(&format!("{secs}S"));
    }
    out
}

fn components(section: &str) -> Result<Vec<(f64, char)>, &'static str> {
    let mut parsed = Vec::new();
    let mut number = String::new();
    for ch in section.chars() {
        if ch.is_ascii_digit() || ch == '.' || ch == ',' {
            number.push(if ch == ',' { '.' } else { ch });
            continue;
        }
        if number.is_empty() {
            return Err("unit without a value");
        }
        let value: f64 = number.parse().map_err(|_| "malformed number")?;
        parsed.push((value, ch.to_ascii_uppercase()));
        number.clear();
    }
    if !number.is_empty() {
        return Err("value without a unit");
    }
    Ok(parsed)
}

fn scaled(value: f64, unit_secs: u64) -> Result<Duration, &'static str> {
    Duration::try_from_secs_f64(value * unit_secs as f64).map_err(|_| "value out of range")
}

/// Serde adapter: `#[serde(with = "tiercache_core::duration::iso8601")]`.
pub mod iso8601 {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_iso8601(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_iso8601(&text).map_err(D::Error::custom)
    }
}

/// Serde adapter for `Option<Duration>` fields.
pub mod iso8601_option {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_str(&super::format_iso8601(*duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| super::parse_iso8601(&text).map_err(D::Error::custom))
            .transpose()
    }
}
