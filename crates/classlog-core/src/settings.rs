use chrono::TimeDelta;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ClasslogError, Result};
use crate::models::{AnalyserKind, Relation};
use crate::time_utils::to_time_delta;

/// Inactivity gap used when neither the CLI nor the config file sets one.
///
/// Thirty minutes separates two lab sittings while tolerating a student who
/// pauses to read the assignment.
pub const DEFAULT_INACTIVITY_GAP: Duration = Duration::from_secs(30 * 60);

// ── MatchPolicy ───────────────────────────────────────────────────────────────

/// Ranking policy used by the correlator when several candidates qualify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Smallest time gap wins; ties by ingestion order.
    Nearest,
    /// Most similar content wins; ties by time gap.
    Content,
    /// Smallest time gap wins; ties by content similarity.
    #[default]
    Hybrid,
}

impl MatchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPolicy::Nearest => "nearest",
            MatchPolicy::Content => "content",
            MatchPolicy::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output format of metric tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Jsonl,
}

impl ExportFormat {
    /// File extension of tables written in this format.
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Jsonl => "jsonl",
        }
    }
}

// ── AnalysisConfig ────────────────────────────────────────────────────────────

/// Validated, immutable configuration handed to every pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    inactivity_gap: TimeDelta,
    correlation_windows: BTreeMap<Relation, TimeDelta>,
    clock_skew_max_latency: TimeDelta,
    match_policy: MatchPolicy,
}

impl AnalysisConfig {
    /// Build and validate a configuration.
    ///
    /// Every duration must be strictly positive and the window mapping must
    /// name at least one relation; anything else is a configuration error.
    pub fn new(
        inactivity_gap: Duration,
        correlation_windows: BTreeMap<Relation, Duration>,
        clock_skew_max_latency: Duration,
        match_policy: MatchPolicy,
    ) -> Result<Self> {
        let inactivity_gap = positive("inactivity_gap", inactivity_gap)?;
        let clock_skew_max_latency = positive("clock_skew_max_latency", clock_skew_max_latency)?;

        if correlation_windows.is_empty() {
            return Err(ClasslogError::config(
                "correlation_windows must define a window for at least one relation",
            ));
        }
        let mut windows = BTreeMap::new();
        for (relation, window) in correlation_windows {
            let name = format!("correlation window for {relation}");
            windows.insert(relation, positive(&name, window)?);
        }

        Ok(Self {
            inactivity_gap,
            correlation_windows: windows,
            clock_skew_max_latency,
            match_policy,
        })
    }

    pub fn inactivity_gap(&self) -> TimeDelta {
        self.inactivity_gap
    }

    /// Correlation window for `relation`; `None` disables that relation.
    pub fn window(&self, relation: Relation) -> Option<TimeDelta> {
        self.correlation_windows.get(&relation).copied()
    }

    /// Relations with a configured window, in declaration order.
    pub fn relations(&self) -> impl Iterator<Item = (Relation, TimeDelta)> + '_ {
        self.correlation_windows.iter().map(|(r, w)| (*r, *w))
    }

    pub fn clock_skew_max_latency(&self) -> TimeDelta {
        self.clock_skew_max_latency
    }

    pub fn match_policy(&self) -> MatchPolicy {
        self.match_policy
    }
}

fn positive(name: &str, duration: Duration) -> Result<TimeDelta> {
    if duration.is_zero() {
        return Err(ClasslogError::config(format!("{name} must be greater than zero")));
    }
    to_time_delta(name, duration)
}

// ── ConfigFile ────────────────────────────────────────────────────────────────

/// Optional JSON configuration, by default at `~/.classlog/config.json`.
///
/// Durations use humantime notation (`"45s"`, `"30m"`, `"1h 30m"`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub inactivity_gap: Option<Duration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub correlation_windows: BTreeMap<Relation, humantime_serde::Serde<Duration>>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub clock_skew_max_latency: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_policy: Option<MatchPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl ConfigFile {
    /// Return the default path to the config file.
    pub fn default_path() -> PathBuf {
        Self::default_path_in(&dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
    }

    /// Return the config path rooted at `base_dir` (used for testing).
    pub fn default_path_in(base_dir: &Path) -> PathBuf {
        base_dir.join(".classlog").join("config.json")
    }

    /// Load a config file from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ClasslogError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ClasslogError::config(format!("invalid config file {}: {}", path.display(), e))
        })
    }

    fn windows(&self) -> BTreeMap<Relation, Duration> {
        self.correlation_windows
            .iter()
            .map(|(r, d)| (*r, d.into_inner()))
            .collect()
    }
}

// ── Settings (CLI) ─────────────────────────────────────────────────────────────

/// Reconcile classroom programming logs into per-student activity metrics
#[derive(Parser, Debug, Clone)]
#[command(
    name = "classlog",
    about = "Reconcile classroom programming logs into per-student activity metrics",
    version
)]
pub struct Settings {
    /// Directories with notebook telemetry files (`jupyter-<student>-log`)
    #[arg(long, value_delimiter = ',')]
    pub notebook_logs: Vec<PathBuf>,

    /// Directories with per-student chat folders (`<student>/*.chat`)
    #[arg(long, value_delimiter = ',')]
    pub chat_logs: Vec<PathBuf>,

    /// Directories with normalized event files (`*.jsonl`)
    #[arg(long, value_delimiter = ',')]
    pub event_logs: Vec<PathBuf>,

    /// Output directory for metric tables
    #[arg(long, short, default_value = "classlog-output")]
    pub output: PathBuf,

    /// Analysers to run (default: all)
    #[arg(long, value_enum, value_delimiter = ',')]
    pub analysers: Vec<AnalyserKind>,

    /// Inactivity gap that starts a new session (default: 30m)
    #[arg(long, value_parser = parse_duration)]
    pub inactivity_gap: Option<Duration>,

    /// Correlation window per relation, e.g. `triggered_by=30s` (repeatable)
    #[arg(long = "window", value_parser = parse_window)]
    pub windows: Vec<(Relation, Duration)>,

    /// Maximum plausible latency between an edit and the execution it causes
    #[arg(long, value_parser = parse_duration)]
    pub clock_skew_max_latency: Option<Duration>,

    /// Candidate ranking policy for the correlator
    #[arg(long, value_enum)]
    pub match_policy: Option<MatchPolicy>,

    /// Timezone for timestamps without an offset (IANA name or `auto`)
    #[arg(long)]
    pub timezone: Option<String>,

    /// Only load logs of this student
    #[arg(long)]
    pub student: Option<String>,

    /// Metric table format
    #[arg(long, value_enum, default_value_t = ExportFormat::Csv)]
    pub format: ExportFormat,

    /// JSON config file (default: ~/.classlog/config.json when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(long, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR"])]
    pub log_level: String,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl Settings {
    /// Analysers selected on the command line, or all of them.
    pub fn selected_analysers(&self) -> Vec<AnalyserKind> {
        if self.analysers.is_empty() {
            return AnalyserKind::ALL.to_vec();
        }
        let mut selected = self.analysers.clone();
        selected.sort();
        selected.dedup();
        selected
    }

    /// `--debug` overrides the log level.
    pub fn effective_log_level(&self) -> &str {
        if self.debug {
            "DEBUG"
        } else {
            &self.log_level
        }
    }

    /// Load the config file named by `--config`, or the default one if it
    /// exists. An explicitly named file must exist and parse.
    pub fn load_config_file(&self) -> Result<Option<ConfigFile>> {
        self.load_config_file_from(&ConfigFile::default_path())
    }

    /// Same as [`Settings::load_config_file`] with an explicit default path.
    pub fn load_config_file_from(&self, default_path: &Path) -> Result<Option<ConfigFile>> {
        match &self.config {
            Some(path) => ConfigFile::load_from(path).map(Some),
            None if default_path.exists() => ConfigFile::load_from(default_path).map(Some),
            None => Ok(None),
        }
    }

    /// Merge CLI values over the config file (CLI always wins) and validate.
    pub fn analysis_config(&self, file: Option<&ConfigFile>) -> Result<AnalysisConfig> {
        let inactivity_gap = self
            .inactivity_gap
            .or(file.and_then(|f| f.inactivity_gap))
            .unwrap_or(DEFAULT_INACTIVITY_GAP);

        let mut windows = file.map(ConfigFile::windows).unwrap_or_default();
        for (relation, window) in &self.windows {
            windows.insert(*relation, *window);
        }

        let clock_skew_max_latency = self
            .clock_skew_max_latency
            .or(file.and_then(|f| f.clock_skew_max_latency))
            .ok_or_else(|| ClasslogError::config("clock_skew_max_latency is required"))?;

        let match_policy = self
            .match_policy
            .or(file.and_then(|f| f.match_policy))
            .unwrap_or_default();

        AnalysisConfig::new(inactivity_gap, windows, clock_skew_max_latency, match_policy)
    }

    /// Timezone for naive timestamps: CLI, then config file, then UTC.
    pub fn timezone_name(&self, file: Option<&ConfigFile>) -> String {
        self.timezone
            .clone()
            .or_else(|| file.and_then(|f| f.timezone.clone()))
            .unwrap_or_else(|| "UTC".to_string())
    }
}

// ── Value parsers ──────────────────────────────────────────────────────────────

/// Parse a humantime duration such as `30s` or `1h 15m`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    humantime::parse_duration(s.trim()).map_err(|e| format!("invalid duration '{s}': {e}"))
}

/// Parse `relation=duration`.
pub fn parse_window(s: &str) -> std::result::Result<(Relation, Duration), String> {
    let (relation, duration) = s
        .split_once('=')
        .ok_or_else(|| format!("expected relation=duration, got '{s}'"))?;
    Ok((relation.parse()?, parse_duration(duration)?))
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn windows(pairs: &[(Relation, u64)]) -> BTreeMap<Relation, Duration> {
        pairs
            .iter()
            .map(|(r, s)| (*r, Duration::from_secs(*s)))
            .collect()
    }

    // ── AnalysisConfig ────────────────────────────────────────────────────────

    #[test]
    fn test_analysis_config_valid() {
        let config = AnalysisConfig::new(
            Duration::from_secs(60),
            windows(&[(Relation::TriggeredBy, 30)]),
            Duration::from_secs(120),
            MatchPolicy::Hybrid,
        )
        .unwrap();
        assert_eq!(config.inactivity_gap(), TimeDelta::seconds(60));
        assert_eq!(config.window(Relation::TriggeredBy), Some(TimeDelta::seconds(30)));
        assert_eq!(config.window(Relation::Preceded), None);
        assert_eq!(config.relations().count(), 1);
    }

    #[test]
    fn test_analysis_config_rejects_zero_gap() {
        let err = AnalysisConfig::new(
            Duration::ZERO,
            windows(&[(Relation::TriggeredBy, 30)]),
            Duration::from_secs(120),
            MatchPolicy::Nearest,
        )
        .unwrap_err();
        assert!(err.to_string().contains("inactivity_gap"));
    }

    #[test]
    fn test_analysis_config_rejects_zero_window() {
        let err = AnalysisConfig::new(
            Duration::from_secs(60),
            windows(&[(Relation::Preceded, 0)]),
            Duration::from_secs(120),
            MatchPolicy::Nearest,
        )
        .unwrap_err();
        assert!(matches!(err, ClasslogError::Configuration(_)));
        assert!(err.to_string().contains("preceded"));
    }

    #[test]
    fn test_analysis_config_rejects_empty_windows() {
        let err = AnalysisConfig::new(
            Duration::from_secs(60),
            BTreeMap::new(),
            Duration::from_secs(120),
            MatchPolicy::Nearest,
        )
        .unwrap_err();
        assert!(err.to_string().contains("correlation_windows"));
    }

    // ── Value parsers ─────────────────────────────────────────────────────────

    #[test]
    fn test_parse_window() {
        let (relation, duration) = parse_window("triggered_by=45s").unwrap();
        assert_eq!(relation, Relation::TriggeredBy);
        assert_eq!(duration, Duration::from_secs(45));
    }

    #[test]
    fn test_parse_window_rejects_bad_input() {
        assert!(parse_window("triggered_by").is_err());
        assert!(parse_window("sometime=45s").is_err());
        assert!(parse_window("preceded=-5s").is_err());
    }

    #[test]
    fn test_parse_duration_compound() {
        assert_eq!(parse_duration("1h 30m").unwrap(), Duration::from_secs(5400));
    }

    // ── Settings ──────────────────────────────────────────────────────────────

    #[test]
    fn test_settings_default_values() {
        let settings = Settings::parse_from(["classlog"]);
        assert!(settings.notebook_logs.is_empty());
        assert_eq!(settings.output, PathBuf::from("classlog-output"));
        assert_eq!(settings.selected_analysers(), AnalyserKind::ALL.to_vec());
        assert!(settings.inactivity_gap.is_none());
        assert!(settings.windows.is_empty());
        assert_eq!(settings.format, ExportFormat::Csv);
        assert_eq!(settings.log_level, "INFO");
        assert!(!settings.debug);
    }

    #[test]
    fn test_settings_cli_parsing() {
        let settings = Settings::parse_from([
            "classlog",
            "--notebook-logs",
            "/data/logs-a,/data/logs-b",
            "--analysers",
            "execution,edit",
            "--window",
            "triggered_by=30s",
            "--window",
            "preceded=2m",
            "--clock-skew-max-latency",
            "10m",
            "--match-policy",
            "nearest",
            "--debug",
        ]);
        assert_eq!(settings.notebook_logs.len(), 2);
        assert_eq!(
            settings.selected_analysers(),
            vec![AnalyserKind::Edit, AnalyserKind::Execution]
        );
        assert_eq!(settings.windows.len(), 2);
        assert_eq!(settings.effective_log_level(), "DEBUG");
        assert_eq!(settings.match_policy, Some(MatchPolicy::Nearest));
    }

    #[test]
    fn test_analysis_config_uses_default_gap() {
        let settings = Settings::parse_from([
            "classlog",
            "--window",
            "triggered_by=30s",
            "--clock-skew-max-latency",
            "5m",
        ]);
        let config = settings.analysis_config(None).unwrap();
        assert_eq!(config.inactivity_gap(), TimeDelta::minutes(30));
        assert_eq!(config.match_policy(), MatchPolicy::Hybrid);
    }

    #[test]
    fn test_analysis_config_requires_skew_latency() {
        let settings = Settings::parse_from(["classlog", "--window", "triggered_by=30s"]);
        let err = settings.analysis_config(None).unwrap_err();
        assert!(err.to_string().contains("clock_skew_max_latency"));
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let mut file = ConfigFile {
            inactivity_gap: Some(Duration::from_secs(600)),
            clock_skew_max_latency: Some(Duration::from_secs(300)),
            ..Default::default()
        };
        file.correlation_windows
            .insert(Relation::TriggeredBy, Duration::from_secs(20).into());
        file.correlation_windows
            .insert(Relation::Consulted, Duration::from_secs(90).into());

        let settings = Settings::parse_from(["classlog", "--window", "triggered_by=45s"]);
        let config = settings.analysis_config(Some(&file)).unwrap();

        assert_eq!(config.inactivity_gap(), TimeDelta::minutes(10));
        assert_eq!(config.window(Relation::TriggeredBy), Some(TimeDelta::seconds(45)));
        assert_eq!(config.window(Relation::Consulted), Some(TimeDelta::seconds(90)));
    }

    // ── ConfigFile ────────────────────────────────────────────────────────────

    #[test]
    fn test_config_file_save_load() {
        let tmp = TempDir::new().expect("tempdir");
        let path = ConfigFile::default_path_in(tmp.path());
        let mut file = ConfigFile {
            inactivity_gap: Some(Duration::from_secs(900)),
            clock_skew_max_latency: Some(Duration::from_secs(120)),
            match_policy: Some(MatchPolicy::Content),
            timezone: Some("Europe/Brussels".to_string()),
            ..Default::default()
        };
        file.correlation_windows
            .insert(Relation::Preceded, Duration::from_secs(180).into());

        std::fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        std::fs::write(&path, serde_json::to_string_pretty(&file).unwrap()).expect("write");
        let loaded = ConfigFile::load_from(&path).expect("load");
        assert_eq!(loaded, file);
    }

    #[test]
    fn test_config_file_humantime_strings() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"inactivity_gap": "45m", "correlation_windows": {"triggered_by": "30s"}, "clock_skew_max_latency": "10m"}"#,
        )
        .unwrap();
        let loaded = ConfigFile::load_from(&path).unwrap();
        assert_eq!(loaded.inactivity_gap, Some(Duration::from_secs(2700)));
        assert_eq!(
            loaded.correlation_windows[&Relation::TriggeredBy].into_inner(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_explicit_missing_config_is_error() {
        let tmp = TempDir::new().expect("tempdir");
        let settings = Settings::parse_from([
            "classlog",
            "--config",
            tmp.path().join("nope.json").to_str().unwrap(),
        ]);
        assert!(settings
            .load_config_file_from(&ConfigFile::default_path_in(tmp.path()))
            .is_err());
    }

    #[test]
    fn test_absent_default_config_is_none() {
        let tmp = TempDir::new().expect("tempdir");
        let settings = Settings::parse_from(["classlog"]);
        let file = settings
            .load_config_file_from(&ConfigFile::default_path_in(tmp.path()))
            .unwrap();
        assert!(file.is_none());
    }
}
