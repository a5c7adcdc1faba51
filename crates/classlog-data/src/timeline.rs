//! Timeline builder for classlog.
//!
//! Merges the events of every source into one chronologically ordered,
//! session-segmented timeline per student, and flags systematic clock offsets
//! between the notebook's edit and execution streams.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, TimeDelta, Utc};
use classlog_core::models::{ClockSkewWarning, Event, Payload, Session, Source};
use classlog_core::settings::AnalysisConfig;
use classlog_core::stats;
use classlog_core::time_utils::seconds;
use tracing::{debug, warn};

/// Fewer causal pairs than this are too few to call an offset systematic.
pub const MIN_SKEW_SAMPLES: usize = 3;

// ── Timeline ──────────────────────────────────────────────────────────────────

/// All sessions of one student.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentTimeline {
    pub student_id: String,
    /// Sessions in chronological order.
    pub sessions: Vec<Session>,
    /// Exact duplicates removed before sorting.
    pub duplicates_dropped: usize,
}

impl StudentTimeline {
    pub fn event_count(&self) -> usize {
        self.sessions.iter().map(|s| s.events.len()).sum()
    }

    /// Next free ingestion number after every event of this timeline.
    pub fn next_seq(&self) -> u64 {
        self.sessions
            .iter()
            .flat_map(|s| s.events.iter())
            .map(|e| e.ingest_seq + 1)
            .max()
            .unwrap_or(0)
    }
}

/// Per-student timelines, ordered by student id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    pub students: Vec<StudentTimeline>,
}

impl Timeline {
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.students.iter().flat_map(|s| s.sessions.iter())
    }

    pub fn session_count(&self) -> usize {
        self.sessions().count()
    }

    pub fn duplicates_dropped(&self) -> usize {
        self.students.iter().map(|s| s.duplicates_dropped).sum()
    }

    pub fn skew_flagged_sessions(&self) -> usize {
        self.sessions().filter(|s| s.is_skew_affected()).count()
    }
}

/// Split a mixed event stream by student, keeping each student's events in
/// the order they arrived.
pub fn group_by_student(events: Vec<Event>) -> BTreeMap<String, Vec<Event>> {
    let mut groups: BTreeMap<String, Vec<Event>> = BTreeMap::new();
    for event in events {
        groups.entry(event.student_id.clone()).or_default().push(event);
    }
    groups
}

// ── TimelineBuilder ───────────────────────────────────────────────────────────

/// Builds [`Session`]s from loaded events.
#[derive(Debug, Clone)]
pub struct TimelineBuilder {
    inactivity_gap: TimeDelta,
    max_latency: TimeDelta,
}

impl TimelineBuilder {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            inactivity_gap: config.inactivity_gap(),
            max_latency: config.clock_skew_max_latency(),
        }
    }

    // ── Public methods ────────────────────────────────────────────────────────

    /// Build the timelines of every student found in `events`.
    pub fn build(&self, events: Vec<Event>) -> Timeline {
        let students = group_by_student(events)
            .into_iter()
            .map(|(student_id, events)| self.build_student(&student_id, events))
            .collect();
        Timeline { students }
    }

    /// Build one student's timeline.
    ///
    /// The algorithm:
    /// 1. Drop exact duplicates (same payload and timestamp), keeping the
    ///    first ingested copy.
    /// 2. Sort by timestamp, then source priority, then ingestion order.
    /// 3. Cut a new session wherever the gap to the previous event is
    ///    strictly greater than the inactivity gap.
    /// 4. Attach a [`ClockSkewWarning`] to the affected sessions when the
    ///    edit→execution offsets are implausible.
    pub fn build_student(&self, student_id: &str, events: Vec<Event>) -> StudentTimeline {
        let (mut events, duplicates_dropped) = Self::dedup(events, &HashSet::new());
        events.sort_by_key(|e| e.timeline_key());

        let mut sessions = self.segment(student_id, events, 1);
        self.detect_clock_skew(&mut sessions);

        debug!(
            "TimelineBuilder: {} sessions for {} ({} duplicates dropped)",
            sessions.len(),
            student_id,
            duplicates_dropped
        );
        StudentTimeline {
            student_id: student_id.to_string(),
            sessions,
            duplicates_dropped,
        }
    }

    /// Add events found in a later load pass.
    ///
    /// The new events are first cut at inactivity gaps. A run that comes
    /// within the gap of an existing session joins it, so late events that
    /// chain forward from a session stay in that session. A run touching two
    /// sessions hands each event to the nearer one; sessions grow but are
    /// never merged or removed. Runs touching no session become new sessions
    /// numbered after the existing ones. Skew detection is redone over the
    /// whole timeline, and any episodes computed earlier are stale.
    pub fn extend(&self, timeline: &mut StudentTimeline, events: Vec<Event>) {
        let known: HashSet<(DateTime<Utc>, Payload)> = timeline
            .sessions
            .iter()
            .flat_map(|s| s.events.iter())
            .map(|e| (e.timestamp, e.payload.clone()))
            .collect();
        let (mut events, dropped) = Self::dedup(events, &known);
        timeline.duplicates_dropped += dropped;
        events.sort_by_key(|e| e.timeline_key());

        let mut additions: Vec<Vec<Event>> = vec![Vec::new(); timeline.sessions.len()];
        let mut orphans: Vec<Vec<Event>> = Vec::new();
        for run in self.split_at_gaps(events) {
            let (Some(first), Some(last)) = (
                run.first().map(|e| e.timestamp),
                run.last().map(|e| e.timestamp),
            ) else {
                continue;
            };
            let touched: Vec<usize> = timeline
                .sessions
                .iter()
                .enumerate()
                .filter(|(_, s)| {
                    s.start - self.inactivity_gap <= last && first <= s.end + self.inactivity_gap
                })
                .map(|(i, _)| i)
                .collect();
            if touched.is_empty() {
                orphans.push(run);
                continue;
            }
            for event in run {
                let nearest = touched
                    .iter()
                    .copied()
                    .min_by_key(|&i| distance_to(&timeline.sessions[i], event.timestamp));
                if let Some(i) = nearest {
                    additions[i].push(event);
                }
            }
        }

        for (session, added) in timeline.sessions.iter_mut().zip(additions) {
            session.append(added);
        }
        let next_number = timeline.sessions.len() + 1;
        let created: Vec<Session> = orphans
            .into_iter()
            .enumerate()
            .filter_map(|(i, run)| {
                Session::from_events(session_id(&timeline.student_id, next_number + i), run)
            })
            .collect();
        debug!(
            "TimelineBuilder: extended {} with {} new sessions",
            timeline.student_id,
            created.len()
        );
        timeline.sessions.extend(created);
        timeline.sessions.sort_by(|a, b| (a.start, &a.id).cmp(&(b.start, &b.id)));

        for session in timeline.sessions.iter_mut() {
            session.skew_warnings.clear();
        }
        self.detect_clock_skew(&mut timeline.sessions);
    }

    /// Extend every student's timeline; unseen students get a fresh one.
    pub fn extend_all(&self, timeline: &mut Timeline, events: Vec<Event>) {
        for (student_id, events) in group_by_student(events) {
            match timeline
                .students
                .iter_mut()
                .find(|s| s.student_id == student_id)
            {
                Some(existing) => self.extend(existing, events),
                None => timeline.students.push(self.build_student(&student_id, events)),
            }
        }
        timeline
            .students
            .sort_by(|a, b| a.student_id.cmp(&b.student_id));
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    /// Remove events whose (timestamp, payload) already appeared, either in
    /// `known` or earlier in ingestion order.
    fn dedup(
        mut events: Vec<Event>,
        known: &HashSet<(DateTime<Utc>, Payload)>,
    ) -> (Vec<Event>, usize) {
        events.sort_by_key(|e| e.ingest_seq);
        let keep: Vec<bool> = {
            let mut seen: HashSet<(DateTime<Utc>, &Payload)> = HashSet::new();
            events
                .iter()
                .map(|e| {
                    let fresh = !known.contains(&(e.timestamp, e.payload.clone()));
                    seen.insert((e.timestamp, &e.payload)) && fresh
                })
                .collect()
        };
        let before = events.len();
        let kept: Vec<Event> = events
            .into_iter()
            .zip(keep)
            .filter_map(|(event, keep)| keep.then_some(event))
            .collect();
        let dropped = before - kept.len();
        (kept, dropped)
    }

    /// Cut time-ordered events wherever the gap to the previous event is
    /// strictly greater than the inactivity gap.
    fn split_at_gaps(&self, events: Vec<Event>) -> Vec<Vec<Event>> {
        let mut runs = Vec::new();
        let mut current: Vec<Event> = Vec::new();

        for event in events {
            if let Some(last) = current.last() {
                if event.timestamp - last.timestamp > self.inactivity_gap {
                    runs.push(std::mem::take(&mut current));
                }
            }
            current.push(event);
        }
        if !current.is_empty() {
            runs.push(current);
        }
        runs
    }

    /// Split time-ordered events into sessions numbered from `first_number`.
    fn segment(&self, student_id: &str, events: Vec<Event>, first_number: usize) -> Vec<Session> {
        self.split_at_gaps(events)
            .into_iter()
            .enumerate()
            .filter_map(|(i, run)| Session::from_events(session_id(student_id, first_number + i), run))
            .collect()
    }

    /// Sample, for every execution, the latency from the latest preceding
    /// edit of the same cell in the same session. A median latency above
    /// `max_latency` means one of the two clocks is off: executions that run
    /// ahead of their edits pair with an earlier cycle's edit instead.
    fn detect_clock_skew(&self, sessions: &mut [Session]) {
        let mut offsets: Vec<f64> = Vec::new();
        let mut sampled: BTreeSet<usize> = BTreeSet::new();

        for (position, session) in sessions.iter().enumerate() {
            for (_, execution) in session.events_of(Source::Execution) {
                let Some(file) = execution.file() else {
                    continue;
                };
                let latency = session
                    .events_of(Source::Edit)
                    .filter(|(_, edit)| {
                        edit.file() == Some(file) && edit.timestamp <= execution.timestamp
                    })
                    .map(|(_, edit)| execution.timestamp - edit.timestamp)
                    .min();
                if let Some(offset) = latency {
                    offsets.push(seconds(offset));
                    sampled.insert(position);
                }
            }
        }

        if offsets.len() < MIN_SKEW_SAMPLES {
            return;
        }
        let Some(median) = stats::median(&offsets) else {
            return;
        };
        let max_latency = seconds(self.max_latency);
        if (0.0..=max_latency).contains(&median) {
            return;
        }

        let warning = ClockSkewWarning {
            reference: Source::Edit,
            skewed: Source::Execution,
            median_offset_secs: median,
            max_latency_secs: max_latency,
            samples: offsets.len(),
        };
        for position in sampled {
            let session = &mut sessions[position];
            warn!("Session {}: {}", session.id, warning);
            session.skew_warnings.push(warning.clone());
        }
    }
}

fn session_id(student_id: &str, number: usize) -> String {
    format!("{student_id}-s{number:03}")
}

/// How far `at` lies outside the span of `session`; zero inside it.
fn distance_to(session: &Session, at: DateTime<Utc>) -> TimeDelta {
    if at < session.start {
        session.start - at
    } else if at > session.end {
        at - session.end
    } else {
        TimeDelta::zero()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use classlog_core::models::{EditPayload, ExecutionPayload, InteractionPayload};
    use classlog_core::models::Relation;
    use classlog_core::settings::MatchPolicy;
    use std::time::Duration;

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn config(gap_secs: u64) -> AnalysisConfig {
        AnalysisConfig::new(
            Duration::from_secs(gap_secs),
            [(Relation::TriggeredBy, Duration::from_secs(30))].into_iter().collect(),
            Duration::from_secs(300),
            MatchPolicy::Hybrid,
        )
        .unwrap()
    }

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_705_312_800_000 + millis).unwrap()
    }

    fn edit(student: &str, secs: i64, seq: u64) -> Event {
        edit_on(student, secs, seq, "lab1.ipynb_0")
    }

    fn edit_on(student: &str, secs: i64, seq: u64, file: &str) -> Event {
        Event::new(
            student,
            at(secs * 1000),
            Payload::Edit(EditPayload {
                event_type: "CellEditEvent".to_string(),
                file: Some(file.to_string()),
                selection: None,
                content: Some(format!("x = {secs}")),
            }),
            seq,
        )
    }

    fn execution(student: &str, secs: i64, seq: u64) -> Event {
        Event::new(
            student,
            at(secs * 1000),
            Payload::Execution(ExecutionPayload {
                file: Some("lab1.ipynb_0".to_string()),
                code: "x = 1".to_string(),
                outputs: Vec::new(),
                error: None,
            }),
            seq,
        )
    }

    fn message(student: &str, secs: i64, seq: u64) -> Event {
        Event::new(
            student,
            at(secs * 1000),
            Payload::Interaction(InteractionPayload {
                sender: student.to_string(),
                body: "help".to_string(),
                automated: false,
                model: None,
            }),
            seq,
        )
    }

    // ── Segmentation ──────────────────────────────────────────────────────────

    #[test]
    fn test_empty_input_yields_no_sessions() {
        let timeline = TimelineBuilder::new(&config(60)).build(Vec::new());
        assert!(timeline.students.is_empty());
        assert_eq!(timeline.session_count(), 0);
    }

    #[test]
    fn test_gap_equal_to_threshold_stays_in_session() {
        let events = vec![edit("alice", 0, 0), edit("alice", 60, 1)];
        let timeline = TimelineBuilder::new(&config(60)).build(events);
        assert_eq!(timeline.session_count(), 1);
    }

    #[test]
    fn test_gap_one_unit_over_threshold_splits() {
        let mut late = edit("alice", 0, 1);
        late.timestamp = at(60_001);
        let events = vec![edit("alice", 0, 0), late];
        let timeline = TimelineBuilder::new(&config(60)).build(events);
        assert_eq!(timeline.session_count(), 2);
    }

    #[test]
    fn test_two_sessions_after_long_gap() {
        let events = vec![edit("alice", 0, 0), execution("alice", 120, 1)];
        let timeline = TimelineBuilder::new(&config(60)).build(events);
        let sessions = &timeline.students[0].sessions;
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, "alice-s001");
        assert_eq!(sessions[1].id, "alice-s002");
        assert_eq!(sessions[1].events[0].session_id.as_deref(), Some("alice-s002"));
    }

    #[test]
    fn test_single_source_student_still_gets_sessions() {
        let events = vec![message("bob", 0, 0), message("bob", 10, 1)];
        let timeline = TimelineBuilder::new(&config(60)).build(events);
        assert_eq!(timeline.session_count(), 1);
        assert_eq!(timeline.students[0].student_id, "bob");
    }

    #[test]
    fn test_students_are_separated_and_ordered() {
        let events = vec![edit("zoe", 0, 0), edit("alice", 0, 1), edit("zoe", 5, 2)];
        let timeline = TimelineBuilder::new(&config(60)).build(events);
        let ids: Vec<&str> = timeline.students.iter().map(|s| s.student_id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "zoe"]);
        assert_eq!(timeline.students[1].event_count(), 2);
    }

    // ── Ordering ──────────────────────────────────────────────────────────────

    #[test]
    fn test_equal_timestamps_ordered_by_source_then_ingestion() {
        let events = vec![
            message("alice", 0, 0),
            execution("alice", 0, 1),
            edit("alice", 0, 3),
            edit_on("alice", 0, 2, "lab1.ipynb_1"),
        ];
        let timeline = TimelineBuilder::new(&config(60)).build(events);
        let order: Vec<u64> = timeline.students[0].sessions[0]
            .events
            .iter()
            .map(|e| e.ingest_seq)
            .collect();
        assert_eq!(order, vec![2, 3, 1, 0]);
    }

    #[test]
    fn test_every_event_covered_once_and_sorted() {
        let events: Vec<Event> = (0..40)
            .map(|i| {
                let secs = (i * 37) % 500;
                match i % 3 {
                    0 => edit("alice", secs, i as u64),
                    1 => execution("alice", secs, i as u64),
                    _ => message("alice", secs, i as u64),
                }
            })
            .collect();
        let timeline = TimelineBuilder::new(&config(45)).build(events);

        let mut seqs: Vec<u64> = timeline
            .sessions()
            .flat_map(|s| s.events.iter().map(|e| e.ingest_seq))
            .collect();
        seqs.sort();
        assert_eq!(seqs, (0..40).collect::<Vec<u64>>());
        for session in timeline.sessions() {
            assert!(session.events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        }
    }

    #[test]
    fn test_rebuild_is_identical() {
        let events: Vec<Event> = (0..20)
            .map(|i| if i % 2 == 0 { edit("alice", i * 40, i as u64) } else { message("alice", i * 40, i as u64) })
            .collect();
        let builder = TimelineBuilder::new(&config(60));
        let first = builder.build(events.clone());
        let mut reversed = events;
        reversed.reverse();
        let second = builder.build(reversed);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first.students[0].sessions).unwrap(),
            serde_json::to_string(&second.students[0].sessions).unwrap()
        );
    }

    // ── Deduplication ─────────────────────────────────────────────────────────

    #[test]
    fn test_exact_duplicate_edits_collapse() {
        let events = vec![edit("alice", 0, 0), edit("alice", 0, 1)];
        let timeline = TimelineBuilder::new(&config(60)).build(events);
        let student = &timeline.students[0];
        assert_eq!(student.event_count(), 1);
        assert_eq!(student.sessions[0].events[0].ingest_seq, 0);
        assert_eq!(student.duplicates_dropped, 1);
    }

    #[test]
    fn test_same_time_different_payload_kept() {
        let events = vec![edit("alice", 0, 0), edit_on("alice", 0, 1, "lab1.ipynb_1")];
        let timeline = TimelineBuilder::new(&config(60)).build(events);
        assert_eq!(timeline.students[0].event_count(), 2);
        assert_eq!(timeline.duplicates_dropped(), 0);
    }

    // ── Clock skew ────────────────────────────────────────────────────────────

    #[test]
    fn test_executions_before_their_edits_flag_skew() {
        // Every execution lands 100s before the edit of its cell, so each
        // one pairs with the previous cycle's edit 500s earlier.
        let mut events = Vec::new();
        for i in 0..4 {
            let base = i * 600;
            events.push(edit("alice", base + 100, (2 * i) as u64));
            events.push(execution("alice", base, (2 * i + 1) as u64));
        }
        let timeline = TimelineBuilder::new(&config(3600)).build(events);
        let session = &timeline.students[0].sessions[0];
        assert!(session.is_skew_affected());
        let warning = &session.skew_warnings[0];
        assert_eq!(warning.samples, 3);
        assert!((warning.median_offset_secs - 500.0).abs() < 1e-9);
        assert_eq!(timeline.skew_flagged_sessions(), 1);
    }

    #[test]
    fn test_quick_fix_after_run_not_flagged() {
        // edit, run 10s later, then a fix 2s after the run.
        let mut events = Vec::new();
        for i in 0..4 {
            let base = i * 60;
            let seq = (3 * i) as u64;
            events.push(edit("alice", base, seq));
            events.push(execution("alice", base + 10, seq + 1));
            events.push(edit("alice", base + 12, seq + 2));
        }
        let timeline = TimelineBuilder::new(&config(3600)).build(events);
        assert_eq!(timeline.skew_flagged_sessions(), 0);
        assert!(timeline.students[0].sessions[0].skew_warnings.is_empty());
    }

    #[test]
    fn test_plausible_latency_not_flagged() {
        let mut events = Vec::new();
        for i in 0..5 {
            events.push(edit("alice", i * 60, (2 * i) as u64));
            events.push(execution("alice", i * 60 + 4, (2 * i + 1) as u64));
        }
        let timeline = TimelineBuilder::new(&config(3600)).build(events);
        assert_eq!(timeline.skew_flagged_sessions(), 0);
    }

    #[test]
    fn test_too_few_samples_not_flagged() {
        let events = vec![edit("alice", 100, 0), execution("alice", 0, 1)];
        let timeline = TimelineBuilder::new(&config(3600)).build(events);
        assert_eq!(timeline.skew_flagged_sessions(), 0);
    }

    // ── Second pass ───────────────────────────────────────────────────────────

    #[test]
    fn test_extend_appends_into_nearby_session() {
        let builder = TimelineBuilder::new(&config(60));
        let mut timeline = builder.build_student("alice", vec![edit("alice", 0, 0), edit("alice", 30, 1)]);

        builder.extend(&mut timeline, vec![execution("alice", 80, 2), message("alice", 10, 3)]);

        assert_eq!(timeline.sessions.len(), 1);
        let session = &timeline.sessions[0];
        assert_eq!(session.events.len(), 4);
        assert_eq!(session.end, at(80_000));
        assert!(session.events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(session.events.iter().all(|e| e.session_id.as_deref() == Some("alice-s001")));
    }

    #[test]
    fn test_extend_chained_late_events_stay_in_one_session() {
        let builder = TimelineBuilder::new(&config(60));
        let mut timeline = builder.build_student("alice", vec![edit("alice", 0, 0)]);

        builder.extend(&mut timeline, vec![edit("alice", 100, 1), edit("alice", 50, 2)]);

        assert_eq!(timeline.sessions.len(), 1);
        let session = &timeline.sessions[0];
        assert_eq!(session.id, "alice-s001");
        assert_eq!(session.events.len(), 3);
        assert_eq!(session.end, at(100_000));
    }

    #[test]
    fn test_extend_bridging_run_keeps_both_sessions() {
        let builder = TimelineBuilder::new(&config(60));
        let mut timeline =
            builder.build_student("alice", vec![edit("alice", 0, 0), edit("alice", 200, 1)]);
        assert_eq!(timeline.sessions.len(), 2);

        // One run from 50s to 150s touches both sessions.
        builder.extend(
            &mut timeline,
            vec![edit("alice", 50, 2), edit("alice", 110, 3), edit("alice", 150, 4)],
        );

        let ids: Vec<(&str, usize)> = timeline
            .sessions
            .iter()
            .map(|s| (s.id.as_str(), s.events.len()))
            .collect();
        assert_eq!(ids, [("alice-s001", 2), ("alice-s002", 3)]);
    }

    #[test]
    fn test_extend_creates_numbered_sessions_and_drops_duplicates() {
        let builder = TimelineBuilder::new(&config(60));
        let mut timeline = builder.build_student("alice", vec![edit("alice", 1000, 0)]);

        builder.extend(
            &mut timeline,
            vec![edit("alice", 1000, 5), edit("alice", 0, 6), edit("alice", 10, 7)],
        );

        assert_eq!(timeline.duplicates_dropped, 1);
        assert_eq!(timeline.sessions.len(), 2);
        // Chronological order, numbering follows creation.
        assert_eq!(timeline.sessions[0].id, "alice-s002");
        assert_eq!(timeline.sessions[0].events.len(), 2);
        assert_eq!(timeline.sessions[1].id, "alice-s001");
        assert_eq!(timeline.next_seq(), 8);
    }

    #[test]
    fn test_extend_all_adds_new_students() {
        let builder = TimelineBuilder::new(&config(60));
        let mut timeline = builder.build(vec![edit("zoe", 0, 0)]);
        builder.extend_all(&mut timeline, vec![edit("alice", 0, 1), edit("zoe", 20, 2)]);
        assert_eq!(timeline.students.len(), 2);
        assert_eq!(timeline.students[0].student_id, "alice");
        assert_eq!(timeline.students[1].event_count(), 2);
    }
}
