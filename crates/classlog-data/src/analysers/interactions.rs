//! Chatbot conversations: volume, waiting time, code sharing and their effect
//! on subsequent editing and on learning-goal success.

use chrono::{DateTime, Utc};
use classlog_core::goals::goals_in_line;
use classlog_core::models::{
    AnalyserKind, Episode, Event, InteractionPayload, MetricRecord, MetricValue, Relation,
    Session, Source,
};
use classlog_core::settings::AnalysisConfig;
use classlog_core::stats;
use classlog_core::text::{code_snippets, contains_code};
use classlog_core::time_utils::seconds;

use super::executions::{attempt_success_rate, error_category, goal_attempts, GoalAttempt, NOT_DETECTED};
use super::{episodes_of, if_correlated, Analyser};

#[derive(Debug, Clone, Copy, Default)]
pub struct InteractionAnalyser;

impl Analyser for InteractionAnalyser {
    fn kind(&self) -> AnalyserKind {
        AnalyserKind::Interaction
    }

    fn analyse(
        &self,
        session: &Session,
        episodes: &[Episode],
        config: &AnalysisConfig,
    ) -> Vec<MetricRecord> {
        let messages: Vec<(f64, &InteractionPayload)> = session
            .events_of(Source::Interaction)
            .filter_map(|(_, e)| {
                e.as_interaction()
                    .map(|p| (seconds(e.timestamp - session.start), p))
            })
            .collect();
        if messages.is_empty() {
            return Vec::new();
        }

        let student: Vec<&InteractionPayload> = messages
            .iter()
            .map(|(_, p)| *p)
            .filter(|p| !p.automated)
            .collect();
        let assistant_count = messages.len() - student.len();

        // A student message directly answered by the assistant.
        let waits: Vec<f64> = messages
            .windows(2)
            .filter(|pair| !pair[0].1.automated && pair[1].1.automated)
            .map(|pair| pair[1].0 - pair[0].0)
            .collect();

        let with_code = student.iter().filter(|p| contains_code(&p.body)).count();
        let snippets: usize = student.iter().map(|p| code_snippets(&p.body).len()).sum();
        let lengths: Vec<f64> = student
            .iter()
            .map(|p| p.body.chars().count() as f64)
            .collect();

        let attempts = goal_attempts(session);
        let changes: Vec<f64> = session
            .events
            .iter()
            .filter(|e| e.is_student_message())
            .filter_map(|question| {
                let goals = question_goals(session, question);
                success_rate_change(&attempts, &goals, question.timestamp)
            })
            .collect();

        let bursts: Vec<&Episode> = episodes_of(episodes, Relation::Preceded).collect();
        let edits_after_chat: usize = bursts.iter().map(|e| e.targets().len()).sum();

        let record = MetricRecord::for_session(self.kind(), session)
            .with("message_count", MetricValue::Count(messages.len() as u64))
            .with("student_messages", MetricValue::Count(student.len() as u64))
            .with("assistant_messages", MetricValue::Count(assistant_count as u64))
            .with("question_answer_pairs", MetricValue::Count(waits.len() as u64))
            .with("mean_waiting_secs", MetricValue::number(stats::mean(&waits)))
            .with("median_waiting_secs", MetricValue::number(stats::median(&waits)))
            .with("messages_with_code", MetricValue::Count(with_code as u64))
            .with("code_snippets", MetricValue::Count(snippets as u64))
            .with("mean_question_length", MetricValue::number(stats::mean(&lengths)))
            .with(
                "edit_bursts_after_chat",
                if_correlated(config, Relation::Preceded, || {
                    MetricValue::Count(bursts.len() as u64)
                }),
            )
            .with(
                "edits_after_chat",
                if_correlated(config, Relation::Preceded, || {
                    MetricValue::Count(edits_after_chat as u64)
                }),
            )
            .with("questions_with_goal_history", MetricValue::Count(changes.len() as u64))
            .with(
                "mean_success_rate_increase",
                MetricValue::number(stats::mean(&changes)),
            );
        vec![record]
    }
}

// ── Learning-goal progress ────────────────────────────────────────────────────

/// Goals a question is about: those applied in the code it quotes, plus the
/// goal of the latest failed run before it.
fn question_goals(session: &Session, question: &Event) -> Vec<&'static str> {
    let mut goals: Vec<&'static str> = question
        .as_interaction()
        .map(|p| code_snippets(&p.body))
        .unwrap_or_default()
        .iter()
        .flat_map(|snippet| snippet.lines().flat_map(goals_in_line).collect::<Vec<_>>())
        .collect();

    let last_error = session
        .events
        .iter()
        .take_while(|e| e.timestamp < question.timestamp)
        .filter_map(|e| e.as_execution()?.error.as_ref())
        .last();
    if let Some(error) = last_error {
        let goal = error_category(error);
        if goal != NOT_DETECTED {
            goals.push(goal);
        }
    }
    goals.sort_unstable();
    goals.dedup();
    goals
}

/// Mean success rate of `goals` after `at` minus the mean before it, over
/// the goals attempted on both sides.
fn success_rate_change(
    attempts: &[GoalAttempt],
    goals: &[&str],
    at: DateTime<Utc>,
) -> Option<f64> {
    let mut before = Vec::new();
    let mut after = Vec::new();
    for goal in goals {
        let of_goal = || attempts.iter().filter(move |a| a.goal == *goal);
        let rates = (
            attempt_success_rate(of_goal().filter(|a| a.at < at)),
            attempt_success_rate(of_goal().filter(|a| a.at > at)),
        );
        if let (Some(b), Some(a)) = rates {
            before.push(b);
            after.push(a);
        }
    }
    Some(stats::mean(&after)? - stats::mean(&before)?)
}
