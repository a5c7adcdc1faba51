use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;

use crate::time_utils::TimezoneHandler;

/// Maximum stored length of an execution's textual output.
pub const MAX_OUTPUT_CHARS: usize = 1000;

// ── TimestampProcessor ────────────────────────────────────────────────────────

/// Unit of numeric (epoch) timestamps in a given log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochUnit {
    Seconds,
    Milliseconds,
}

/// Parses timestamps from the variety of formats found in classroom logs.
pub struct TimestampProcessor;

impl TimestampProcessor {
    /// Attempt to parse a [`serde_json::Value`] into a UTC [`DateTime`].
    ///
    /// Handles:
    /// * `null`       → `None`
    /// * JSON number  → epoch time in `unit` (integer or float).
    /// * JSON string  → RFC 3339 (including `Z`-suffix), RFC 2822, a numeric
    ///   string read as epoch time, or a naive date-time read in the
    ///   handler's timezone.
    pub fn parse(value: &Value, unit: EpochUnit, tz: &TimezoneHandler) -> Option<DateTime<Utc>> {
        match value {
            Value::Null => None,
            Value::Number(n) => Self::from_epoch(n.as_f64()?, unit),
            Value::String(s) => Self::parse_str(s.trim(), unit, tz),
            _ => None,
        }
    }

    fn from_epoch(raw: f64, unit: EpochUnit) -> Option<DateTime<Utc>> {
        if !raw.is_finite() {
            return None;
        }
        let millis = match unit {
            EpochUnit::Seconds => raw * 1000.0,
            EpochUnit::Milliseconds => raw,
        };
        DateTime::from_timestamp_millis(millis.round() as i64)
    }

    fn parse_str(s: &str, unit: EpochUnit, tz: &TimezoneHandler) -> Option<DateTime<Utc>> {
        if s.is_empty() {
            return None;
        }

        // Replace trailing 'Z' with '+00:00' for RFC 3339 compatibility.
        let normalised = if let Some(stripped) = s.strip_suffix('Z') {
            format!("{}+00:00", stripped)
        } else {
            s.to_string()
        };

        if let Ok(dt) = DateTime::parse_from_rfc3339(&normalised) {
            return Some(dt.with_timezone(&Utc));
        }

        if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
            return Some(dt.with_timezone(&Utc));
        }

        if let Ok(raw) = s.parse::<f64>() {
            return Self::from_epoch(raw, unit);
        }

        tz.parse_local(s)
    }
}

// ── Text cleanup ──────────────────────────────────────────────────────────────

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\x{9B}|\x1B\[)[0-?]*[ -/]*[@-~]").expect("regex is valid"))
}

/// Remove terminal colour/cursor escape sequences from a traceback.
pub fn strip_ansi(text: &str) -> String {
    ansi_regex().replace_all(text, "").into_owned()
}

/// Cap `text` at [`MAX_OUTPUT_CHARS`] characters, marking truncation with `...`.
pub fn truncate_output(text: &str) -> String {
    if text.chars().count() <= MAX_OUTPUT_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_OUTPUT_CHARS).collect();
    out.push_str("...");
    out
}

/// Render a JSON value that may be a string or a list of lines as one string.
///
/// Notebook cell sources and stream outputs use either form.
pub fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(lines) => Some(
            lines
                .iter()
                .filter_map(|l| l.as_str())
                .collect::<Vec<_>>()
                .concat(),
        ),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
