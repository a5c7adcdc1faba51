//! Execution outcomes: success rate, error kinds, recovery and progress, and
//! how often each learning goal was attempted successfully.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use classlog_core::goals::{all_goals, goal_slug, goals_in_lines, TYPO};
use classlog_core::models::{
    AnalyserKind, Episode, ExecutionError, ExecutionPayload, MetricRecord, MetricValue, Relation,
    Session, Source,
};
use classlog_core::settings::AnalysisConfig;
use classlog_core::stats;
use classlog_core::text::added_line_numbers;
use classlog_core::time_utils::seconds;

use super::{episodes_of, if_correlated, targets_of, Analyser};
use crate::aggregator::roll_up;

/// Category for an error no learning-goal rule recognises.
pub const NOT_DETECTED: &str = "Not detected";

// ── Learning-goal error rules ─────────────────────────────────────────────────

struct ErrorRule {
    goal: &'static str,
    matches: fn(&ErrorText) -> bool,
}

/// Lower-cased error fields the rules look at.
struct ErrorText {
    name: String,
    detail: String,
}

impl ErrorText {
    fn new(error: &ExecutionError) -> Self {
        Self {
            name: error.name.to_lowercase(),
            detail: format!("{}\n{}", error.value, error.traceback).to_lowercase(),
        }
    }

    fn syntax_with(&self, keyword: &str) -> bool {
        self.name.contains("syntaxerror") && self.detail.contains(keyword)
    }
}

fn is_subscript_error(e: &ErrorText) -> bool {
    e.name.contains("indexerror")
        || e.name.contains("keyerror")
        || (e.name.contains("typeerror") && e.detail.contains("object is not subscriptable"))
}

/// Checked in order; the first rule that matches names the category. Typos
/// come first since an unterminated string also mentions whatever keyword
/// sits on the same line.
const ERROR_RULES: &[ErrorRule] = &[
    ErrorRule {
        goal: TYPO,
        matches: |e| {
            e.name.contains("syntaxerror")
                && ["eol", "unexpected eof", "unterminated string literal"]
                    .iter()
                    .any(|k| e.detail.contains(k))
        },
    },
    ErrorRule {
        goal: "Print statement",
        matches: |e| e.syntax_with("print"),
    },
    ErrorRule {
        goal: "Variable assignment",
        matches: |e| e.name.contains("nameerror") && e.detail.contains("not defined"),
    },
    ErrorRule {
        goal: "For loop",
        matches: |e| e.syntax_with("for"),
    },
    ErrorRule {
        goal: "While loop",
        matches: |e| e.syntax_with("while"),
    },
    ErrorRule {
        goal: "Break statement",
        matches: |e| e.syntax_with("break"),
    },
    ErrorRule {
        goal: "Function definition",
        matches: |e| e.syntax_with("def"),
    },
    ErrorRule {
        goal: "Import statement",
        matches: |e| e.syntax_with("import"),
    },
    ErrorRule {
        goal: "Function call",
        matches: |e| e.name.contains("attributeerror"),
    },
    ErrorRule {
        goal: "List access",
        matches: is_subscript_error,
    },
    ErrorRule {
        goal: "Type casting",
        matches: |e| e.name.contains("typeerror"),
    },
];

/// Learning goal an execution error points at.
pub fn error_category(error: &ExecutionError) -> &'static str {
    let text = ErrorText::new(error);
    ERROR_RULES
        .iter()
        .find(|rule| (rule.matches)(&text))
        .map(|rule| rule.goal)
        .unwrap_or(NOT_DETECTED)
}

// ── Learning-goal attempts ────────────────────────────────────────────────────

/// A successful run whose added lines apply `goal`, or a failed run whose
/// error points at it.
#[derive(Debug, Clone, PartialEq)]
pub struct GoalAttempt {
    pub goal: &'static str,
    pub at: DateTime<Utc>,
    pub success: bool,
}

/// Every goal attempt of `session`, in timeline order.
///
/// A successful run is compared with the previous successful run of the same
/// cell; the first one counts all of its lines as added.
pub fn goal_attempts(session: &Session) -> Vec<GoalAttempt> {
    let mut last_success: HashMap<&str, &str> = HashMap::new();
    let mut attempts = Vec::new();

    for (_, event) in session.events_of(Source::Execution) {
        let Some(run) = event.as_execution() else {
            continue;
        };
        match &run.error {
            Some(error) => {
                let goal = error_category(error);
                if goal != NOT_DETECTED {
                    attempts.push(GoalAttempt {
                        goal,
                        at: event.timestamp,
                        success: false,
                    });
                }
            }
            None => {
                let previous = run
                    .file
                    .as_deref()
                    .and_then(|file| last_success.insert(file, run.code.as_str()))
                    .unwrap_or_default();
                let added = added_line_numbers(previous, &run.code);
                attempts.extend(goals_in_lines(&run.code, &added).into_iter().map(|goal| {
                    GoalAttempt {
                        goal,
                        at: event.timestamp,
                        success: true,
                    }
                }));
            }
        }
    }
    attempts
}

/// Share of successful attempts; `None` without attempts.
pub fn attempt_success_rate<'a>(attempts: impl IntoIterator<Item = &'a GoalAttempt>) -> Option<f64> {
    let (mut passed, mut total) = (0, 0);
    for attempt in attempts {
        total += 1;
        if attempt.success {
            passed += 1;
        }
    }
    stats::ratio(passed, total)
}

/// Metric name of a goal's success rate.
pub fn goal_rate_field(goal: &str) -> String {
    format!("{}_success_rate", goal_slug(goal))
}

// ── ExecutionAnalyser ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionAnalyser;

struct Run<'a> {
    position: usize,
    payload: &'a ExecutionPayload,
    secs: f64,
}

impl Analyser for ExecutionAnalyser {
    fn kind(&self) -> AnalyserKind {
        AnalyserKind::Execution
    }

    fn analyse(
        &self,
        session: &Session,
        episodes: &[Episode],
        config: &AnalysisConfig,
    ) -> Vec<MetricRecord> {
        let runs: Vec<Run<'_>> = session
            .events_of(Source::Execution)
            .filter_map(|(position, e)| {
                e.as_execution().map(|payload| Run {
                    position,
                    payload,
                    secs: seconds(e.timestamp - session.start),
                })
            })
            .collect();
        if runs.is_empty() {
            return Vec::new();
        }

        let execution_count = runs.len();
        let errors: Vec<&ExecutionError> = runs.iter().filter_map(|r| r.payload.error.as_ref()).collect();
        let success_count = execution_count - errors.len();

        let top_error = stats::mode(errors.iter().map(|e| e.name.as_str()));
        let categories: Vec<&str> = errors
            .iter()
            .map(|e| error_category(e))
            .filter(|c| *c != NOT_DETECTED)
            .collect();
        let category = stats::mode(categories.iter().copied())
            .or_else(|| (!errors.is_empty()).then_some(NOT_DETECTED));
        let recoveries = recovery_times(&runs);
        let lines_added = lines_added_per_success(&runs);

        let attempts = goal_attempts(session);
        let applied: Vec<&str> = attempts
            .iter()
            .filter(|a| a.success)
            .map(|a| a.goal)
            .collect();
        let distinct_applied: BTreeSet<&str> = applied.iter().copied().collect();

        let triggered = targets_of(episodes, Relation::TriggeredBy);
        let consultations = episodes_of(episodes, Relation::Consulted).count();
        let executions_after_edit = runs
            .iter()
            .filter(|r| triggered.contains(&r.position))
            .count();

        let record = MetricRecord::for_session(self.kind(), session)
            .with("execution_count", MetricValue::Count(execution_count as u64))
            .with("success_count", MetricValue::Count(success_count as u64))
            .with("error_count", MetricValue::Count(errors.len() as u64))
            .with(
                "success_rate",
                MetricValue::number(stats::ratio(success_count, execution_count)),
            )
            .with("top_error", MetricValue::category(top_error))
            .with("error_categories", MetricValue::category(category))
            .with("categorized_errors", MetricValue::Count(categories.len() as u64))
            .with("recovered_errors", MetricValue::Count(recoveries.len() as u64))
            .with("mean_recovery_secs", MetricValue::number(stats::mean(&recoveries)))
            .with(
                "longest_failure_streak",
                MetricValue::Count(longest_failure_streak(&runs) as u64),
            )
            .with(
                "mean_lines_added_per_success",
                MetricValue::number(stats::mean(&lines_added)),
            )
            .with(
                "executions_after_edit",
                if_correlated(config, Relation::TriggeredBy, || {
                    MetricValue::Count(executions_after_edit as u64)
                }),
            )
            .with(
                "consultations_after_error",
                if_correlated(config, Relation::Consulted, || {
                    MetricValue::Count(consultations as u64)
                }),
            )
            .with(
                "top_applied_goal",
                MetricValue::category(stats::mode(applied.iter().copied())),
            )
            .with("applied_goals", MetricValue::Count(distinct_applied.len() as u64));

        let record = all_goals().fold(record, |record, goal| {
            let rate = attempt_success_rate(attempts.iter().filter(|a| a.goal == goal));
            record.with(&goal_rate_field(goal), MetricValue::number(rate))
        });
        vec![record]
    }

    /// Goal success rates are recomputed over every attempt of the student
    /// rather than averaged over sessions.
    fn roll_up(
        &self,
        student_id: &str,
        sessions: &[Session],
        records: &[MetricRecord],
    ) -> Option<MetricRecord> {
        let student = roll_up(self.kind(), student_id, records)?;
        let attempts: Vec<GoalAttempt> = sessions.iter().flat_map(goal_attempts).collect();
        let applied: BTreeSet<&str> = attempts
            .iter()
            .filter(|a| a.success)
            .map(|a| a.goal)
            .collect();

        let student = student.set("applied_goals", MetricValue::Count(applied.len() as u64));
        Some(all_goals().fold(student, |student, goal| {
            let rate = attempt_success_rate(attempts.iter().filter(|a| a.goal == goal));
            student.set(&goal_rate_field(goal), MetricValue::number(rate))
        }))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// For every failed run, seconds until the next successful run of the same
/// cell. Failures never followed by a success are left out.
fn recovery_times(runs: &[Run<'_>]) -> Vec<f64> {
    runs.iter()
        .enumerate()
        .filter(|(_, run)| !run.payload.is_success())
        .filter_map(|(i, failed)| {
            let file = failed.payload.file.as_deref()?;
            runs[i + 1..]
                .iter()
                .find(|later| later.payload.is_success() && later.payload.file.as_deref() == Some(file))
                .map(|fixed| fixed.secs - failed.secs)
        })
        .collect()
}

/// Longest run of consecutive failed executions, across cells.
fn longest_failure_streak(runs: &[Run<'_>]) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for run in runs {
        if run.payload.is_success() {
            current = 0;
        } else {
            current += 1;
            longest = longest.max(current);
        }
    }
    longest
}

/// Lines added by each successful run relative to the previous successful
/// run of the same cell.
fn lines_added_per_success(runs: &[Run<'_>]) -> Vec<f64> {
    let mut last_success: HashMap<&str, &str> = HashMap::new();
    let mut added = Vec::new();
    for run in runs.iter().filter(|r| r.payload.is_success()) {
        let Some(file) = run.payload.file.as_deref() else {
            continue;
        };
        if let Some(previous) = last_success.insert(file, run.payload.code.as_str()) {
            added.push(added_line_numbers(previous, &run.payload.code).len() as f64);
        }
    }
    added
}
