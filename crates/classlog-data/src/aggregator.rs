//! Student-level roll-up of session metric records.

use classlog_core::models::{AnalyserKind, MetricRecord, MetricScope, MetricValue};
use classlog_core::stats;

/// Combine one analyser's session records for a single student.
///
/// Fields keep the order in which they first appear. Per field:
/// counts are summed, numbers are averaged over the sessions that have a
/// value, categories take the most frequent value and flags are OR-ed.
/// A field missing from every session stays missing. A leading `sessions`
/// count records how many session records contributed.
///
/// Returns `None` when no session record of `kind` belongs to `student_id`.
pub fn roll_up(
    kind: AnalyserKind,
    student_id: &str,
    records: &[MetricRecord],
) -> Option<MetricRecord> {
    let sessions: Vec<&MetricRecord> = records
        .iter()
        .filter(|r| {
            r.analyser == kind
                && r.student_id == student_id
                && matches!(r.scope, MetricScope::Session(_))
        })
        .collect();
    if sessions.is_empty() {
        return None;
    }

    let mut names: Vec<&str> = Vec::new();
    for record in &sessions {
        for field in &record.fields {
            if !names.contains(&field.name.as_str()) {
                names.push(&field.name);
            }
        }
    }

    let mut student = MetricRecord::for_student(kind, student_id)
        .with("sessions", MetricValue::Count(sessions.len() as u64));
    student.skew_affected = sessions.iter().any(|r| r.skew_affected);

    for name in names {
        let values: Vec<&MetricValue> = sessions
            .iter()
            .filter_map(|r| r.get(name))
            .filter(|v| !matches!(v, MetricValue::Missing))
            .collect();
        student = student.with(name, combine(&values));
    }
    Some(student)
}

/// Fold the present values of one field. The first value decides how the
/// rest are combined.
fn combine(values: &[&MetricValue]) -> MetricValue {
    match values.first() {
        None | Some(MetricValue::Missing) => MetricValue::Missing,
        Some(MetricValue::Count(_)) => MetricValue::Count(
            values
                .iter()
                .map(|v| match v {
                    MetricValue::Count(n) => *n,
                    _ => 0,
                })
                .sum(),
        ),
        Some(MetricValue::Number(_)) => {
            let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
            MetricValue::number(stats::mean(&numbers))
        }
        Some(MetricValue::Flag(_)) => {
            MetricValue::Flag(values.iter().any(|v| matches!(v, MetricValue::Flag(true))))
        }
        Some(MetricValue::Category(_)) => MetricValue::category(stats::mode(
            values.iter().filter_map(|v| match v {
                MetricValue::Category(c) => Some(c.as_str()),
                _ => None,
            }),
        )),
    }
}
