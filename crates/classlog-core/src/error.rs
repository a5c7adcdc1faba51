use std::path::PathBuf;
use thiserror::Error;

/// A single raw record that could not be turned into an event.
///
/// Recovered locally by the loader: the record is skipped and counted, the
/// load continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// A required field is missing or has the wrong type.
    #[error("Malformed record #{index} in {origin}: {reason}")]
    MalformedRecord {
        origin: String,
        index: usize,
        reason: String,
    },

    /// The timestamp field is present but cannot be parsed.
    #[error("Unparsable timestamp in record #{index} of {origin}: {value}")]
    Timestamp {
        origin: String,
        index: usize,
        value: String,
    },
}

impl LoadError {
    pub fn malformed(origin: &str, index: usize, reason: impl Into<String>) -> Self {
        LoadError::MalformedRecord {
            origin: origin.to_string(),
            index,
            reason: reason.into(),
        }
    }

    pub fn timestamp(origin: &str, index: usize, value: impl ToString) -> Self {
        LoadError::Timestamp {
            origin: origin.to_string(),
            index,
            value: value.to_string(),
        }
    }

    pub fn index(&self) -> usize {
        match self {
            LoadError::MalformedRecord { index, .. } | LoadError::Timestamp { index, .. } => *index,
        }
    }
}

/// All errors produced by classlog.
#[derive(Error, Debug)]
pub enum ClasslogError {
    /// A file could not be opened or read from disk.
    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A JSON document could not be parsed.
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// A raw record was rejected by the loader.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// A configuration value is missing or out of range. Fatal.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An input directory does not exist.
    #[error("Data path not found: {0}")]
    DataPathNotFound(PathBuf),

    /// Every input was empty or unusable.
    #[error("No usable input: {0}")]
    NoUsableInput(String),

    /// Pass-through for any raw I/O error that does not carry a path.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Catch-all for errors from third-party crates via `anyhow`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClasslogError {
    pub fn config(message: impl Into<String>) -> Self {
        ClasslogError::Configuration(message.into())
    }
}

/// Convenience alias used throughout the classlog crates.
pub type Result<T> = std::result::Result<T, ClasslogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_malformed_record() {
        let err = LoadError::malformed("jupyter-alice-log", 3, "missing eventDetail");
        assert_eq!(
            err.to_string(),
            "Malformed record #3 in jupyter-alice-log: missing eventDetail"
        );
        assert_eq!(err.index(), 3);
    }

    #[test]
    fn test_error_display_timestamp() {
        let err = LoadError::timestamp("events.jsonl", 7, "yesterday");
        assert_eq!(
            err.to_string(),
            "Unparsable timestamp in record #7 of events.jsonl: yesterday"
        );
    }

    #[test]
    fn test_error_display_file_read() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = ClasslogError::FileRead {
            path: PathBuf::from("/logs/jupyter-bob-log"),
            source: io_err,
        };
        let msg = err.to_string();
        assert!(msg.contains("Failed to read file"));
        assert!(msg.contains("/logs/jupyter-bob-log"));
        assert!(msg.contains("no such file"));
    }

    #[test]
    fn test_error_display_config() {
        let err = ClasslogError::config("inactivity_gap must be positive");
        assert_eq!(
            err.to_string(),
            "Configuration error: inactivity_gap must be positive"
        );
    }

    #[test]
    fn test_error_from_load_error_is_transparent() {
        let err: ClasslogError = LoadError::malformed("f", 0, "bad").into();
        assert_eq!(err.to_string(), "Malformed record #0 in f: bad");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid}").unwrap_err();
        let err: ClasslogError = json_err.into();
        assert!(err.to_string().contains("Failed to parse JSON"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: ClasslogError = io_err.into();
        assert!(err.to_string().contains("denied"));
    }
}
