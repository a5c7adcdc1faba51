//! Per-session analysers.
//!
//! Every analyser is a pure function of a session, the episodes found in it
//! and the run configuration. None of them holds state between calls, so
//! sessions and students can be analysed in any order and on any thread.

use std::collections::BTreeSet;

use classlog_core::models::{AnalyserKind, Episode, MetricRecord, MetricValue, Relation, Session};
use classlog_core::settings::AnalysisConfig;

use crate::aggregator::roll_up;

pub mod edits;
pub mod executions;
pub mod interactions;

pub use edits::EditAnalyser;
pub use executions::ExecutionAnalyser;
pub use interactions::InteractionAnalyser;

/// Common contract of the edit, execution and interaction analysers.
pub trait Analyser: Send + Sync {
    fn kind(&self) -> AnalyserKind;

    /// Session-scoped metric records. Empty when the session holds no event
    /// the analyser looks at.
    fn analyse(
        &self,
        session: &Session,
        episodes: &[Episode],
        config: &AnalysisConfig,
    ) -> Vec<MetricRecord>;

    /// One student-scoped record folded from this analyser's session
    /// `records`; `None` when there are none.
    fn roll_up(
        &self,
        student_id: &str,
        _sessions: &[Session],
        records: &[MetricRecord],
    ) -> Option<MetricRecord> {
        roll_up(self.kind(), student_id, records)
    }
}

pub fn analyser_for(kind: AnalyserKind) -> Box<dyn Analyser> {
    match kind {
        AnalyserKind::Edit => Box::new(EditAnalyser),
        AnalyserKind::Execution => Box::new(ExecutionAnalyser),
        AnalyserKind::Interaction => Box::new(InteractionAnalyser),
    }
}

/// Analysers for `kinds`, deduplicated and in [`AnalyserKind`] order.
pub fn analysers_for(kinds: &[AnalyserKind]) -> Vec<Box<dyn Analyser>> {
    kinds
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(analyser_for)
        .collect()
}

// ── Episode helpers ───────────────────────────────────────────────────────────

pub(crate) fn episodes_of(
    episodes: &[Episode],
    relation: Relation,
) -> impl Iterator<Item = &Episode> {
    episodes.iter().filter(move |e| e.relation == relation)
}

/// Session positions acting as anchors of `relation`.
pub(crate) fn anchors_of(episodes: &[Episode], relation: Relation) -> BTreeSet<usize> {
    episodes_of(episodes, relation).filter_map(Episode::anchor).collect()
}

/// Session positions claimed as targets of `relation`.
pub(crate) fn targets_of(episodes: &[Episode], relation: Relation) -> BTreeSet<usize> {
    episodes_of(episodes, relation)
        .flat_map(|e| e.targets().iter().copied())
        .collect()
}

/// A relation-derived value, or `Missing` when the relation was not
/// correlated in this run.
pub(crate) fn if_correlated(
    config: &AnalysisConfig,
    relation: Relation,
    value: impl FnOnce() -> MetricValue,
) -> MetricValue {
    if config.window(relation).is_some() {
        value()
    } else {
        MetricValue::Missing
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Session builders shared by the analyser tests.

    use chrono::{DateTime, TimeZone, Utc};
    use classlog_core::models::{
        EditPayload, Event, ExecutionError, ExecutionPayload, InteractionPayload, Payload,
        Relation, Session,
    };
    use classlog_core::settings::{AnalysisConfig, MatchPolicy};
    use std::time::Duration;

    pub fn config() -> AnalysisConfig {
        AnalysisConfig::new(
            Duration::from_secs(1800),
            [
                (Relation::TriggeredBy, Duration::from_secs(30)),
                (Relation::Preceded, Duration::from_secs(120)),
                (Relation::Consulted, Duration::from_secs(300)),
            ]
            .into_iter()
            .collect(),
            Duration::from_secs(600),
            MatchPolicy::Hybrid,
        )
        .unwrap()
    }

    pub fn config_without(relation: Relation) -> AnalysisConfig {
        let windows = Relation::ALL
            .into_iter()
            .filter(|r| *r != relation)
            .map(|r| (r, Duration::from_secs(60)))
            .collect();
        AnalysisConfig::new(
            Duration::from_secs(1800),
            windows,
            Duration::from_secs(600),
            MatchPolicy::Hybrid,
        )
        .unwrap()
    }

    pub fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_705_312_800 + secs, 0).unwrap()
    }

    pub fn edit(file: &str, event_type: &str, content: &str) -> Payload {
        Payload::Edit(EditPayload {
            event_type: event_type.to_string(),
            file: Some(file.to_string()),
            selection: None,
            content: Some(content.to_string()),
        })
    }

    pub fn success(file: &str, code: &str) -> Payload {
        Payload::Execution(ExecutionPayload {
            file: Some(file.to_string()),
            code: code.to_string(),
            outputs: Vec::new(),
            error: None,
        })
    }

    pub fn failure(file: &str, code: &str, name: &str, value: &str) -> Payload {
        Payload::Execution(ExecutionPayload {
            file: Some(file.to_string()),
            code: code.to_string(),
            outputs: Vec::new(),
            error: Some(ExecutionError {
                name: name.to_string(),
                value: value.to_string(),
                traceback: format!("{name}: {value}"),
            }),
        })
    }

    pub fn student(body: &str) -> Payload {
        Payload::Interaction(InteractionPayload {
            sender: "alice".to_string(),
            body: body.to_string(),
            automated: false,
            model: None,
        })
    }

    pub fn assistant(body: &str) -> Payload {
        Payload::Interaction(InteractionPayload {
            sender: "Juno".to_string(),
            body: body.to_string(),
            automated: true,
            model: Some("gpt-4o".to_string()),
        })
    }

    /// Session from (seconds, payload) pairs given in time order.
    pub fn session(items: Vec<(i64, Payload)>) -> Session {
        let events = items
            .into_iter()
            .enumerate()
            .map(|(seq, (secs, payload))| Event::new("alice", at(secs), payload, seq as u64))
            .collect();
        Session::from_events("alice-s001".to_string(), events).unwrap()
    }
}
