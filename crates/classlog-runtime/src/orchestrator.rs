//! Batch orchestrator.
//!
//! Runs the load step and the per-student pipeline on tokio's blocking pool.
//! Every student is an independent job that owns its events and returns its
//! own [`StudentAnalysis`]; results are collected once all jobs finish and
//! sorted by student id, so the output does not depend on scheduling.

use std::sync::Arc;
use std::time::Instant;

use classlog_core::error::{ClasslogError, Result};
use classlog_core::models::{AnalyserKind, Event};
use classlog_core::settings::AnalysisConfig;
use classlog_data::analysers::{analysers_for, Analyser};
use classlog_data::analysis::{
    analyse_student, log_summary, no_usable_input, AnalysisResult, StudentAnalysis,
};
use classlog_data::reader::{LoadReport, Loader};
use classlog_data::timeline::group_by_student;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info};

/// Data-parallel runner for one batch of logs.
pub struct BatchOrchestrator {
    config: Arc<AnalysisConfig>,
    kinds: Vec<AnalyserKind>,
    analysers: Arc<Vec<Box<dyn Analyser>>>,
}

impl BatchOrchestrator {
    pub fn new(config: AnalysisConfig, kinds: &[AnalyserKind]) -> Self {
        Self {
            config: Arc::new(config),
            kinds: kinds.to_vec(),
            analysers: Arc::new(analysers_for(kinds)),
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Load every configured root without blocking the runtime.
    pub async fn load(&self, loader: Loader) -> Result<(Vec<Event>, LoadReport)> {
        let (events, report) = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(join_failure)?;
        info!(
            "Loaded {} events from {} files ({} malformed, {} bad timestamps)",
            report.loaded, report.files_read, report.malformed, report.timestamp_errors
        );
        Ok((events, report))
    }

    /// Load, then analyse.
    pub async fn run(&self, loader: Loader) -> Result<AnalysisResult> {
        let (events, report) = self.load(loader).await?;
        self.analyse(events, &report).await
    }

    /// Build, correlate and analyse every student concurrently.
    ///
    /// A batch without a single event is [`ClasslogError::NoUsableInput`].
    pub async fn analyse(&self, events: Vec<Event>, report: &LoadReport) -> Result<AnalysisResult> {
        if events.is_empty() {
            return Err(no_usable_input(report));
        }

        let start = Instant::now();
        let mut jobs: JoinSet<StudentAnalysis> = JoinSet::new();
        for (student_id, events) in group_by_student(events) {
            let config = Arc::clone(&self.config);
            let analysers = Arc::clone(&self.analysers);
            jobs.spawn_blocking(move || analyse_student(&student_id, events, &config, &analysers));
        }
        debug!("BatchOrchestrator: {} student jobs spawned", jobs.len());

        let mut students = Vec::with_capacity(jobs.len());
        while let Some(joined) = jobs.join_next().await {
            students.push(joined.map_err(join_failure)?);
        }

        let result = AnalysisResult::assemble(
            students,
            report,
            &self.config,
            &self.kinds,
            start.elapsed().as_secs_f64(),
        );
        log_summary(&result.summary);
        Ok(result)
    }
}

/// Re-raise a worker panic on the caller; anything else is an error.
fn join_failure(error: JoinError) -> ClasslogError {
    if error.is_panic() {
        std::panic::resume_unwind(error.into_panic());
    }
    ClasslogError::Other(anyhow::anyhow!("analysis worker cancelled: {error}"))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
