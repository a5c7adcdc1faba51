//! Main analysis pipeline for classlog.
//!
//! Builds timelines from loaded events, correlates every session, runs the
//! selected analysers and rolls their records up per student, returning an
//! [`AnalysisResult`] ready for export.

use std::collections::BTreeMap;

use chrono::Utc;
use classlog_core::error::{ClasslogError, Result};
use classlog_core::models::{AnalyserKind, Episode, Event, MetricRecord, Relation};
use classlog_core::settings::AnalysisConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::analysers::{analysers_for, Analyser};
use crate::correlator::Correlator;
use crate::reader::LoadReport;
use crate::timeline::{group_by_student, StudentTimeline, TimelineBuilder};

// ── Public types ──────────────────────────────────────────────────────────────

/// Everything computed for one student.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentAnalysis {
    pub timeline: StudentTimeline,
    /// Episodes per session, in session order.
    pub episodes: Vec<Vec<Episode>>,
    /// Session-scoped records, grouped by session then analyser.
    pub session_records: Vec<MetricRecord>,
    /// One roll-up per analyser that produced at least one session record.
    pub student_records: Vec<MetricRecord>,
}

impl StudentAnalysis {
    pub fn student_id(&self) -> &str {
        &self.timeline.student_id
    }

    pub fn episode_count(&self, relation: Relation) -> usize {
        self.episodes
            .iter()
            .flatten()
            .filter(|e| e.relation == relation)
            .count()
    }
}

/// Counts reported at the end of every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// RFC 3339 timestamp when this summary was generated.
    pub generated_at: String,
    pub files_read: usize,
    pub files_failed: usize,
    pub events_loaded: usize,
    pub malformed_records: usize,
    pub timestamp_errors: usize,
    pub duplicates_dropped: usize,
    pub students: usize,
    pub sessions: usize,
    pub episodes: BTreeMap<Relation, usize>,
    pub skew_flagged_sessions: usize,
    pub match_policy: String,
    pub analysers: Vec<AnalyserKind>,
    /// Wall-clock seconds spent building, correlating and analysing.
    pub analysis_time_seconds: f64,
}

/// The complete output of a run.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    /// Per-student output, ordered by student id.
    pub students: Vec<StudentAnalysis>,
    pub summary: RunSummary,
}

impl AnalysisResult {
    /// Collect per-student output, sorting it by student id.
    pub fn assemble(
        mut students: Vec<StudentAnalysis>,
        report: &LoadReport,
        config: &AnalysisConfig,
        kinds: &[AnalyserKind],
        analysis_time_seconds: f64,
    ) -> Self {
        students.sort_by(|a, b| a.timeline.student_id.cmp(&b.timeline.student_id));

        let episodes = Relation::ALL
            .into_iter()
            .filter(|r| config.window(*r).is_some())
            .map(|r| (r, students.iter().map(|s| s.episode_count(r)).sum()))
            .collect();
        let mut analysers = kinds.to_vec();
        analysers.sort();
        analysers.dedup();

        let summary = RunSummary {
            generated_at: Utc::now().to_rfc3339(),
            files_read: report.files_read,
            files_failed: report.files_failed,
            events_loaded: report.loaded,
            malformed_records: report.malformed,
            timestamp_errors: report.timestamp_errors,
            duplicates_dropped: students.iter().map(|s| s.timeline.duplicates_dropped).sum(),
            students: students.len(),
            sessions: students.iter().map(|s| s.timeline.sessions.len()).sum(),
            episodes,
            skew_flagged_sessions: students
                .iter()
                .flat_map(|s| s.timeline.sessions.iter())
                .filter(|s| s.is_skew_affected())
                .count(),
            match_policy: config.match_policy().to_string(),
            analysers,
            analysis_time_seconds,
        };

        Self { students, summary }
    }

    /// Session records of one analyser across all students.
    pub fn session_records(&self, kind: AnalyserKind) -> Vec<&MetricRecord> {
        self.students
            .iter()
            .flat_map(|s| s.session_records.iter())
            .filter(|r| r.analyser == kind)
            .collect()
    }

    /// Student roll-ups of one analyser.
    pub fn student_records(&self, kind: AnalyserKind) -> Vec<&MetricRecord> {
        self.students
            .iter()
            .flat_map(|s| s.student_records.iter())
            .filter(|r| r.analyser == kind)
            .collect()
    }
}

// ── Public functions ──────────────────────────────────────────────────────────

/// Correlate and analyse every session of one built timeline.
///
/// Depends on nothing outside its arguments, so students can be processed
/// on separate threads and collected afterwards.
pub fn analyse_timeline(
    timeline: StudentTimeline,
    config: &AnalysisConfig,
    analysers: &[Box<dyn Analyser>],
) -> StudentAnalysis {
    let correlator = Correlator::new(config);
    let mut episodes = Vec::with_capacity(timeline.sessions.len());
    let mut session_records = Vec::new();

    for session in &timeline.sessions {
        let found = correlator.correlate(session);
        for analyser in analysers {
            session_records.extend(analyser.analyse(session, &found, config));
        }
        episodes.push(found);
    }

    let student_records = analysers
        .iter()
        .filter_map(|a| a.roll_up(&timeline.student_id, &timeline.sessions, &session_records))
        .collect();

    debug!(
        "analyse: {} sessions, {} session records for {}",
        timeline.sessions.len(),
        session_records.len(),
        timeline.student_id
    );

    StudentAnalysis {
        timeline,
        episodes,
        session_records,
        student_records,
    }
}

/// Build, correlate and analyse one student's events.
pub fn analyse_student(
    student_id: &str,
    events: Vec<Event>,
    config: &AnalysisConfig,
    analysers: &[Box<dyn Analyser>],
) -> StudentAnalysis {
    let timeline = TimelineBuilder::new(config).build_student(student_id, events);
    analyse_timeline(timeline, config, analysers)
}

/// Run the full pipeline sequentially.
///
/// 1. Group loaded events by student.
/// 2. Build each student's timeline and detect clock skew.
/// 3. Correlate every session and run the selected analysers.
/// 4. Roll session records up per student and assemble the run summary.
///
/// A run without a single loaded event is [`ClasslogError::NoUsableInput`].
pub fn run_analysis(
    events: Vec<Event>,
    report: &LoadReport,
    config: &AnalysisConfig,
    kinds: &[AnalyserKind],
) -> Result<AnalysisResult> {
    if events.is_empty() {
        return Err(no_usable_input(report));
    }

    let start = std::time::Instant::now();
    let analysers = analysers_for(kinds);

    // ── Steps 1–3: Per-student pipeline ───────────────────────────────────────
    let students: Vec<StudentAnalysis> = group_by_student(events)
        .into_iter()
        .map(|(student_id, events)| analyse_student(&student_id, events, config, &analysers))
        .collect();

    // ── Step 4: Summary ───────────────────────────────────────────────────────
    let result = AnalysisResult::assemble(
        students,
        report,
        config,
        kinds,
        start.elapsed().as_secs_f64(),
    );
    log_summary(&result.summary);
    Ok(result)
}

/// Error for a load that produced no events at all.
pub fn no_usable_input(report: &LoadReport) -> ClasslogError {
    ClasslogError::NoUsableInput(format!(
        "{} files read, {} unreadable, {} records skipped",
        report.files_read,
        report.files_failed,
        report.skipped()
    ))
}

pub fn log_summary(summary: &RunSummary) {
    info!(
        "Analysed {} events: {} students, {} sessions ({} skew-flagged), {} duplicates, {} malformed, {} bad timestamps",
        summary.events_loaded,
        summary.students,
        summary.sessions,
        summary.skew_flagged_sessions,
        summary.duplicates_dropped,
        summary.malformed_records,
        summary.timestamp_errors
    );
    for (relation, count) in &summary.episodes {
        info!("  {relation}: {count} episodes");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysers::fixtures::*;
    use classlog_core::models::{MetricScope, MetricValue, Payload};

    fn events(student: &str, items: Vec<(i64, Payload)>) -> Vec<Event> {
        items
            .into_iter()
            .enumerate()
            .map(|(seq, (secs, payload))| Event::new(student, at(secs), payload, seq as u64))
            .collect()
    }

    fn report(loaded: usize) -> LoadReport {
        LoadReport {
            files_read: 1,
            loaded,
            ..LoadReport::default()
        }
    }

    // ── run_analysis ──────────────────────────────────────────────────────────

    #[test]
    fn test_empty_input_is_fatal() {
        let err = run_analysis(Vec::new(), &report(0), &config(), &AnalyserKind::ALL).unwrap_err();
        assert!(matches!(err, ClasslogError::NoUsableInput(_)));
    }

    #[test]
    fn test_run_analysis_basic_pipeline() {
        let mut all = events(
            "bob",
            vec![
                (0, edit("lab.ipynb_0", "CellEditEvent", "x = 1")),
                (2, success("lab.ipynb_0", "x = 1")),
                (5000, student("what next?")),
            ],
        );
        all.extend(events(
            "alice",
            vec![(0, failure("lab.ipynb_0", "y", "NameError", "name 'y' is not defined"))],
        ));

        let result = run_analysis(all, &report(4), &config(), &AnalyserKind::ALL).unwrap();
        let ids: Vec<&str> = result.students.iter().map(|s| s.student_id()).collect();
        assert_eq!(ids, ["alice", "bob"]);

        let summary = &result.summary;
        assert_eq!(summary.students, 2);
        assert_eq!(summary.sessions, 3);
        assert_eq!(summary.events_loaded, 4);
        assert_eq!(summary.episodes[&Relation::TriggeredBy], 1);
        assert_eq!(summary.episodes[&Relation::Consulted], 0);
        assert_eq!(summary.match_policy, "hybrid");

        assert_eq!(result.session_records(AnalyserKind::Execution).len(), 2);
        assert_eq!(result.session_records(AnalyserKind::Edit).len(), 1);
        let rollups = result.student_records(AnalyserKind::Interaction);
        assert_eq!(rollups.len(), 1);
        assert_eq!(rollups[0].student_id, "bob");
        assert_eq!(rollups[0].scope, MetricScope::Student);
    }

    #[test]
    fn test_selected_analysers_only() {
        let all = events(
            "alice",
            vec![
                (0, edit("lab.ipynb_0", "CellEditEvent", "x = 1")),
                (2, success("lab.ipynb_0", "x = 1")),
            ],
        );
        let result = run_analysis(all, &report(2), &config(), &[AnalyserKind::Edit]).unwrap();
        assert!(result.session_records(AnalyserKind::Execution).is_empty());
        assert_eq!(result.summary.analysers, [AnalyserKind::Edit]);
        let student = result.student_records(AnalyserKind::Edit)[0];
        assert_eq!(student.get("sessions"), Some(&MetricValue::Count(1)));
    }

    #[test]
    fn test_unconfigured_relation_absent_from_summary() {
        let all = events("alice", vec![(0, student("hi"))]);
        let result = run_analysis(
            all,
            &report(1),
            &config_without(Relation::Consulted),
            &AnalyserKind::ALL,
        )
        .unwrap();
        assert!(!result.summary.episodes.contains_key(&Relation::Consulted));
        assert!(result.summary.episodes.contains_key(&Relation::Preceded));
    }

    #[test]
    fn test_summary_serialises() {
        let all = events("alice", vec![(0, student("hi"))]);
        let result = run_analysis(all, &report(1), &config(), &AnalyserKind::ALL).unwrap();
        let json = serde_json::to_value(&result.summary).unwrap();
        assert_eq!(json["sessions"], 1);
        assert_eq!(json["episodes"]["triggered_by"], 0);
        assert_eq!(json["analysers"][0], "edit");
    }
}
