use chrono::{DateTime, LocalResult, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::debug;

use crate::error::{ClasslogError, Result};

// ── System timezone detection ─────────────────────────────────────────────────

/// Detect the IANA timezone name of the running system.
///
/// Uses the `iana-time-zone` crate directly – no subprocess calls.
/// Falls back to `"UTC"` if detection fails.
pub fn get_system_timezone() -> String {
    iana_time_zone::get_timezone().unwrap_or_else(|_| "UTC".to_string())
}

// ── TimezoneHandler ───────────────────────────────────────────────────────────

/// Interprets timestamps that carry no offset.
///
/// Raw logs mix epoch numbers, RFC 3339 strings and naive wall-clock strings;
/// the latter are read in the timezone of the classroom that produced them.
#[derive(Debug, Clone, Copy)]
pub struct TimezoneHandler {
    default_tz: Tz,
}

impl Default for TimezoneHandler {
    fn default() -> Self {
        Self { default_tz: Tz::UTC }
    }
}

impl TimezoneHandler {
    /// Create a handler for `tz_name`, an IANA name or `"auto"` for the
    /// system timezone.
    ///
    /// An unknown name is a configuration error: silently reading wall-clock
    /// times in the wrong zone would shift every naive timestamp.
    pub fn new(tz_name: &str) -> Result<Self> {
        let resolved = if tz_name.eq_ignore_ascii_case("auto") {
            get_system_timezone()
        } else {
            tz_name.to_string()
        };
        let tz = resolved.parse::<Tz>().map_err(|_| {
            ClasslogError::config(format!("unrecognised timezone \"{}\"", resolved))
        })?;
        debug!("TimezoneHandler: naive timestamps read as {}", tz);
        Ok(Self { default_tz: tz })
    }

    /// Interpret a naive date-time string in the handler's timezone.
    ///
    /// Ambiguous local times (DST fold) resolve to the earlier instant;
    /// non-existent local times return `None`.
    pub fn parse_local(&self, s: &str) -> Option<DateTime<Utc>> {
        const FMTS: &[&str] = &[
            "%Y-%m-%dT%H:%M:%S%.f",
            "%Y-%m-%dT%H:%M:%S",
            "%Y-%m-%d %H:%M:%S%.f",
            "%Y-%m-%d %H:%M:%S",
            "%d/%m/%Y %H:%M:%S",
        ];
        for fmt in FMTS {
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
                return match self.default_tz.from_local_datetime(&naive) {
                    LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
                    LocalResult::Ambiguous(early, _) => Some(early.with_timezone(&Utc)),
                    LocalResult::None => None,
                };
            }
        }
        None
    }
}

// ── Duration helpers ──────────────────────────────────────────────────────────

/// A [`TimeDelta`] as fractional seconds.
pub fn seconds(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 1000.0
}

/// Convert a configuration duration into a [`TimeDelta`].
pub fn to_time_delta(name: &str, duration: std::time::Duration) -> Result<TimeDelta> {
    TimeDelta::from_std(duration)
        .map_err(|_| ClasslogError::config(format!("{name} is out of range: {duration:?}")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_invalid_timezone_is_config_error() {
        let err = TimezoneHandler::new("Mars/Olympus").unwrap_err();
        assert!(matches!(err, ClasslogError::Configuration(_)));
    }

    #[test]
    fn test_new_auto_resolves() {
        assert!(TimezoneHandler::new("auto").is_ok());
    }

    #[test]
    fn test_parse_local_in_utc() {
        let handler = TimezoneHandler::default();
        let dt = handler.parse_local("2024-03-01 09:30:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-03-01T09:30:00+00:00");
    }

    #[test]
    fn test_parse_local_applies_offset() {
        let handler = TimezoneHandler::new("Europe/Brussels").unwrap();
        // CET is UTC+1 in winter.
        let dt = handler.parse_local("2024-01-15T10:00:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-01-15T09:00:00+00:00");
    }

    #[test]
    fn test_parse_local_garbage_returns_none() {
        assert!(TimezoneHandler::default().parse_local("after lunch").is_none());
    }

    #[test]
    fn test_seconds_of_delta() {
        assert!((seconds(TimeDelta::milliseconds(1500)) - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_get_system_timezone_returns_nonempty_string() {
        assert!(!get_system_timezone().is_empty());
    }
}
