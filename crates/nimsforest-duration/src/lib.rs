//! Duration parsing for nimsforest configuration.
//!
//! Intervals, timeouts, and lock TTLs in forest configuration are written as
//! humantime strings (`"30s"`, `"5m"`, `"1h30m"`). This crate provides the
//! parse/format helpers plus serde adapters that also accept plain integer
//! milliseconds, so durations roundtrip through JSON and YAML.
//!
//! # Example
//!
//! ```
//! use nimsforest_duration::parse_duration;
//! use std::time::Duration;
//!
//! assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
//! assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
//! assert!(parse_duration("invalid").is_err());
//! ```

use std::time::Duration;

/// Parse a humantime duration string like "30s", "5m", or "1h".
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s.trim()).map_err(|e| format!("invalid duration {:?}: {}", s, e))
}

/// Format a duration in humantime notation ("30s", "5m").
pub fn format_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}

/// Serde adapter for `Duration` fields.
///
/// Deserializes from either a humantime string or an integer number of
/// milliseconds; serializes as milliseconds so the output roundtrips.
pub mod serde_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match DurationHelper::deserialize(deserializer)? {
            DurationHelper::String(s) => {
                super::parse_duration(&s).map_err(serde::de::Error::custom)
            }
            DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
        }
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

/// Serde adapter for `Option<Duration>` fields.
pub mod serde_opt_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OptHelper {
        String(String),
        U64(u64),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let helper: Option<OptHelper> = Option::deserialize(deserializer)?;
        match helper {
            None => Ok(None),
            Some(OptHelper::String(s)) => super::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            Some(OptHelper::U64(ms)) => Ok(Some(Duration::from_millis(ms))),
        }
    }

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }
}
