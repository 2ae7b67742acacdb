//! Human-friendly durations in rule configuration
//!
//! Durations are written as a sequence of `<number><unit>` pairs such as
//! `10s`, `5m`, `1h30m` or `250ms`. A bare number is read as seconds.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Longest duration accepted anywhere in configuration (ten years)
pub const MAX_DURATION: Duration = Duration::from_secs(10 * 365 * 86_400);

fn check_range(duration: Duration, input: &str) -> Result<Duration, String> {
    if duration > MAX_DURATION {
        Err(format!(
            "duration `{input}` is out of range, the maximum is {}",
            format_duration(MAX_DURATION)
        ))
    } else {
        Ok(duration)
    }
}

/// Parse a duration string
///
/// # Errors
/// Returns a description of the problem when the string is not a duration
/// or is longer than [`MAX_DURATION`].
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(seconds) = input.parse::<u64>() {
        return check_range(Duration::from_secs(seconds), input);
    }
    let out_of_range = || format!("duration `{input}` is out of range");

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("expected a number in duration `{input}`"));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("number too large in duration `{input}`"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let seconds_per_unit = match unit.trim().to_ascii_lowercase().as_str() {
            "ms" => None,
            "s" | "sec" | "secs" => Some(1),
            "m" | "min" | "mins" => Some(60),
            "h" | "hr" | "hrs" => Some(3600),
            "d" | "day" | "days" => Some(86_400),
            other => return Err(format!("unknown unit `{other}` in duration `{input}`")),
        };
        let part = match seconds_per_unit {
            None => Duration::from_millis(amount),
            Some(factor) => Duration::from_secs(amount.checked_mul(factor).ok_or_else(out_of_range)?),
        };
        total = total.checked_add(part).ok_or_else(out_of_range)?;
    }

    check_range(total, input)
}

/// Render a duration the way it is written in configuration
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = duration.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<Duration, String> {
        match self {
            Self::Seconds(secs) => check_range(Duration::from_secs(secs), &secs.to_string()),
            Self::Text(text) => parse_duration(&text),
        }
    }
}

/// `#[serde(with = ...)]` support for `Duration` fields
pub mod serde_duration {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        RawDuration::deserialize(deserializer)?
            .into_duration()
            .map_err(serde::de::Error::custom)
    }
}

/// `#[serde(with = ...)]` support for `Option<Duration>` fields
pub mod serde_opt_duration {
    use super::*;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => serializer.serialize_str(&format_duration(*duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<RawDuration>::deserialize(deserializer)?
            .map(RawDuration::into_duration)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

/// `#[serde(with = ...)]` support for maps of durations
pub mod serde_duration_map {
    use super::*;
    use serde::Serialize;
    use std::collections::HashMap;
    use std::hash::Hash;

    pub fn serialize<K, S>(map: &HashMap<K, Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize + Eq + Hash,
        S: Serializer,
    {
        let rendered: HashMap<&K, String> = map
            .iter()
            .map(|(key, duration)| (key, format_duration(*duration)))
            .collect();
        rendered.serialize(serializer)
    }

    pub fn deserialize<'de, K, D>(deserializer: D) -> Result<HashMap<K, Duration>, D::Error>
    where
        K: Deserialize<'de> + Eq + Hash,
        D: Deserializer<'de>,
    {
        HashMap::<K, RawDuration>::deserialize(deserializer)?
            .into_iter()
            .map(|(key, raw)| Ok((key, raw.into_duration().map_err(serde::de::Error::custom)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h30m"), Ok(Duration::from_secs(5400)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("2d"), Ok(Duration::from_secs(172_800)));
        assert_eq!(parse_duration("45"), Ok(Duration::from_secs(45)));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ten seconds").is_err());
        assert!(parse_duration("5w").is_err());
    }

    #[test]
    fn test_huge_durations_are_rejected() {
        assert!(parse_duration("999999999999999999m").is_err());
        assert!(parse_duration("18446744073709551615s1s").is_err());
        assert!(parse_duration("100000000000d").is_err());
        assert!(parse_duration("3651d").is_err());
        assert_eq!(parse_duration("3650d"), Ok(MAX_DURATION));

        #[derive(Debug, Deserialize)]
        struct Window {
            #[serde(with = "serde_duration")]
            #[allow(dead_code)]
            within: Duration,
        }
        assert!(serde_yaml::from_str::<Window>("within: 18446744073709551615").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
    }

    #[test]
    fn test_serde_duration_fields() {
        #[derive(Deserialize)]
        struct Settings {
            #[serde(with = "serde_duration")]
            within: Duration,
            #[serde(default, with = "serde_opt_duration")]
            cooldown: Option<Duration>,
        }

        let settings: Settings = serde_yaml::from_str("within: 10s\ncooldown: 60").unwrap();
        assert_eq!(settings.within, Duration::from_secs(10));
        assert_eq!(settings.cooldown, Some(Duration::from_secs(60)));

        let settings: Settings = serde_yaml::from_str("within: 1m").unwrap();
        assert_eq!(settings.cooldown, None);
    }
}
