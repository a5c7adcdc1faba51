mod bootstrap;

use anyhow::{Context, Result};
use clap::Parser;
use classlog_core::settings::Settings;
use classlog_core::time_utils::TimezoneHandler;
use classlog_runtime::export::export;
use classlog_runtime::orchestrator::BatchOrchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::parse();

    bootstrap::setup_logging(settings.effective_log_level())?;
    tracing::info!("classlog v{} starting", env!("CARGO_PKG_VERSION"));

    let file = settings.load_config_file()?;
    let config = settings.analysis_config(file.as_ref())?;
    let tz = TimezoneHandler::new(&settings.timezone_name(file.as_ref()))?;
    let kinds = settings.selected_analysers();
    tracing::info!(
        "Gap: {}s, windows: {}, policy: {}",
        config.inactivity_gap().num_seconds(),
        config
            .relations()
            .map(|(r, w)| format!("{r}={}s", w.num_seconds()))
            .collect::<Vec<_>>()
            .join(" "),
        config.match_policy()
    );

    let loader = bootstrap::build_loader(&settings, tz)?;
    let orchestrator = BatchOrchestrator::new(config, &kinds);
    let result = orchestrator.run(loader).await?;

    let written = export(&result, &settings.output, settings.format)
        .with_context(|| format!("writing results to {}", settings.output.display()))?;

    let summary = &result.summary;
    println!(
        "{} events, {} students, {} sessions ({} skew-flagged)",
        summary.events_loaded, summary.students, summary.sessions, summary.skew_flagged_sessions
    );
    println!(
        "skipped: {} malformed, {} bad timestamps, {} duplicates, {} unreadable files",
        summary.malformed_records,
        summary.timestamp_errors,
        summary.duplicates_dropped,
        summary.files_failed
    );
    for (relation, count) in &summary.episodes {
        println!("{relation}: {count} episodes");
    }
    println!("wrote {} files to {}", written.len(), settings.output.display());

    Ok(())
}
