//! Edit activity: how much a student edits, where, and what the edits lead to.

use std::collections::BTreeSet;

use classlog_core::models::{
    AnalyserKind, Episode, MetricRecord, MetricValue, Relation, Session, Source,
};
use classlog_core::settings::AnalysisConfig;
use classlog_core::stats;
use classlog_core::time_utils::seconds;

use super::{anchors_of, episodes_of, if_correlated, targets_of, Analyser};

#[derive(Debug, Clone, Copy, Default)]
pub struct EditAnalyser;

impl Analyser for EditAnalyser {
    fn kind(&self) -> AnalyserKind {
        AnalyserKind::Edit
    }

    fn analyse(
        &self,
        session: &Session,
        episodes: &[Episode],
        config: &AnalysisConfig,
    ) -> Vec<MetricRecord> {
        let edits: Vec<(usize, &str, Option<&str>)> = session
            .events_of(Source::Edit)
            .filter_map(|(i, e)| e.as_edit().map(|p| (i, p.event_type.as_str(), p.file.as_deref())))
            .collect();
        if edits.is_empty() {
            return Vec::new();
        }

        let edit_count = edits.len();
        let files: BTreeSet<&str> = edits.iter().filter_map(|(_, _, file)| *file).collect();
        let dominant = stats::mode(edits.iter().map(|(_, event_type, _)| *event_type));

        let triggering = anchors_of(episodes, Relation::TriggeredBy);
        let after_chat = targets_of(episodes, Relation::Preceded);
        let latencies: Vec<f64> = episodes_of(episodes, Relation::TriggeredBy)
            .filter_map(|e| e.latency(session))
            .map(seconds)
            .collect();

        let record = MetricRecord::for_session(self.kind(), session)
            .with("edit_count", MetricValue::Count(edit_count as u64))
            .with(
                "edits_per_minute",
                MetricValue::Number(edit_count as f64 / session.duration_minutes()),
            )
            .with("distinct_files", MetricValue::Count(files.len() as u64))
            .with("dominant_event_type", MetricValue::category(dominant))
            .with(
                "edits_followed_by_execution",
                if_correlated(config, Relation::TriggeredBy, || {
                    MetricValue::Count(triggering.len() as u64)
                }),
            )
            .with(
                "edits_preceded_by_chat",
                if_correlated(config, Relation::Preceded, || {
                    MetricValue::Count(after_chat.len() as u64)
                }),
            )
            .with(
                "chat_dependency_ratio",
                if_correlated(config, Relation::Preceded, || {
                    MetricValue::number(stats::ratio(after_chat.len(), edit_count))
                }),
            )
            .with(
                "median_edit_to_execution_secs",
                if_correlated(config, Relation::TriggeredBy, || {
                    MetricValue::number(stats::median(&latencies))
                }),
            );
        vec![record]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysers::fixtures::*;
    use crate::correlator::Correlator;

    fn run(session: &Session, config: &AnalysisConfig) -> MetricRecord {
        let episodes = Correlator::new(config).correlate(session);
        let mut records = EditAnalyser.analyse(session, &episodes, config);
        assert_eq!(records.len(), 1);
        records.remove(0)
    }

    #[test]
    fn test_no_edits_no_record() {
        let s = session(vec![(0, student("hi"))]);
        assert!(EditAnalyser.analyse(&s, &[], &config()).is_empty());
    }

    #[test]
    fn test_edit_counts_and_rates() {
        let s = session(vec![
            (0, edit("lab.ipynb_0", "CellEditEvent", "x = 1")),
            (60, edit("lab.ipynb_0", "CellEditEvent", "x = 2")),
            (90, edit("lab.ipynb_1", "SelectionChangeEvent", "y = 1")),
            (120, edit("lab.ipynb_1", "CellEditEvent", "y = 2")),
        ]);
        let record = run(&s, &config());
        assert_eq!(record.get("edit_count"), Some(&MetricValue::Count(4)));
        assert_eq!(record.get("edits_per_minute"), Some(&MetricValue::Number(2.0)));
        assert_eq!(record.get("distinct_files"), Some(&MetricValue::Count(2)));
        assert_eq!(
            record.get("dominant_event_type"),
            Some(&MetricValue::Category("CellEditEvent".to_string()))
        );
        assert_eq!(record.session_id(), Some("alice-s001"));
        assert!(!record.skew_affected);
    }

    #[test]
    fn test_edit_to_execution_metrics() {
        let s = session(vec![
            (0, edit("lab.ipynb_0", "CellEditEvent", "x = 1")),
            (4, success("lab.ipynb_0", "x = 1")),
            (20, edit("lab.ipynb_0", "CellEditEvent", "x = 2")),
            (30, success("lab.ipynb_0", "x = 2")),
            (200, edit("lab.ipynb_0", "CellEditEvent", "x = 3")),
        ]);
        let record = run(&s, &config());
        assert_eq!(record.get("edits_followed_by_execution"), Some(&MetricValue::Count(2)));
        assert_eq!(
            record.get("median_edit_to_execution_secs"),
            Some(&MetricValue::Number(7.0))
        );
    }

    #[test]
    fn test_chat_dependency_ratio() {
        let s = session(vec![
            (0, edit("lab.ipynb_0", "CellEditEvent", "x = 1")),
            (10, assistant("Try a loop: for x in xs")),
            (20, edit("lab.ipynb_0", "CellEditEvent", "for x in xs:")),
            (25, edit("lab.ipynb_0", "CellEditEvent", "for x in xs:\n    print(x)")),
            (40, edit("lab.ipynb_0", "CellEditEvent", "done")),
        ]);
        let record = run(&s, &config());
        assert_eq!(record.get("edits_preceded_by_chat"), Some(&MetricValue::Count(3)));
        assert_eq!(record.get("chat_dependency_ratio"), Some(&MetricValue::Number(0.75)));
    }

    #[test]
    fn test_uncorrelated_relation_is_missing() {
        let s = session(vec![
            (0, edit("lab.ipynb_0", "CellEditEvent", "x = 1")),
            (4, success("lab.ipynb_0", "x = 1")),
        ]);
        let record = run(&s, &config_without(Relation::TriggeredBy));
        assert_eq!(record.get("edits_followed_by_execution"), Some(&MetricValue::Missing));
        assert_eq!(record.get("median_edit_to_execution_secs"), Some(&MetricValue::Missing));
        assert_eq!(record.get("edits_preceded_by_chat"), Some(&MetricValue::Count(0)));
    }
}
