use classlog_core::error::{ClasslogError, Result};
use classlog_core::settings::Settings;
use classlog_core::time_utils::TimezoneHandler;
use classlog_data::reader::{LogKind, Loader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ── Logging bootstrap ──────────────────────────────────────────────────────────

/// Map a `--log-level` name to a tracing filter directive. Unknown names
/// fall back to `info`.
pub fn filter_directive(log_level: &str) -> &'static str {
    match log_level.to_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARNING" | "WARN" => "warn",
        "ERROR" => "error",
        _ => "info",
    }
}

/// Initialise the global `tracing` subscriber on stderr.
///
/// `RUST_LOG`, when set, takes precedence over `log_level`.
pub fn setup_logging(log_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(log_level)));

    let subscriber = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(subscriber)
        .try_init()?;

    Ok(())
}

// ── Loader bootstrap ───────────────────────────────────────────────────────────

/// Build a loader over every input directory named on the command line.
///
/// A missing directory is fatal, as is a command line that names none.
pub fn build_loader(settings: &Settings, tz: TimezoneHandler) -> Result<Loader> {
    let mut loader = Loader::new(tz).with_student(settings.student.clone());
    let roots = [
        (LogKind::Notebook, &settings.notebook_logs),
        (LogKind::Chat, &settings.chat_logs),
        (LogKind::Events, &settings.event_logs),
    ];
    for (kind, paths) in roots {
        for path in paths {
            loader.add_root(kind, path)?;
        }
    }
    if !loader.has_roots() {
        return Err(ClasslogError::config(
            "no input given; use --notebook-logs, --chat-logs or --event-logs",
        ));
    }
    Ok(loader)
}

// ── Tests ──────────────────────────────────────────────────────────────────────
