//! Metric table export.
//!
//! Each analyser gets two tables, `<analyser>_sessions` and
//! `<analyser>_students`, written as CSV or JSON Lines next to a
//! `run_summary.json`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use classlog_core::error::Result;
use classlog_core::models::{AnalyserKind, MetricRecord, MetricValue};
use classlog_core::settings::ExportFormat;
use classlog_data::analysis::AnalysisResult;
use serde_json::{Map, Value};
use tracing::{debug, info};

pub const SUMMARY_FILE: &str = "run_summary.json";

/// Write every table of `result` plus the run summary into `dir`, creating
/// it when absent. Returns the written paths in write order.
pub fn export(result: &AnalysisResult, dir: &Path, format: ExportFormat) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::new();

    for kind in &result.summary.analysers {
        let tables = [
            ("sessions", result.session_records(*kind)),
            ("students", result.student_records(*kind)),
        ];
        for (scope, records) in tables {
            if records.is_empty() {
                continue;
            }
            let path = dir.join(table_name(*kind, scope, format));
            write_table(&path, &records, format)?;
            debug!("Wrote {} rows to {}", records.len(), path.display());
            written.push(path);
        }
    }

    let summary_path = dir.join(SUMMARY_FILE);
    std::fs::write(&summary_path, serde_json::to_string_pretty(&result.summary)?)?;
    written.push(summary_path);

    info!("Exported {} files to {}", written.len(), dir.display());
    Ok(written)
}

/// Write one table in `format`.
pub fn write_table(path: &Path, records: &[&MetricRecord], format: ExportFormat) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    match format {
        ExportFormat::Csv => write_csv(&mut out, records)?,
        ExportFormat::Jsonl => write_jsonl(&mut out, records)?,
    }
    out.flush()?;
    Ok(())
}

// ── CSV ───────────────────────────────────────────────────────────────────────

/// Union of field names in first-seen order.
pub fn columns(records: &[&MetricRecord]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for record in records {
        for field in &record.fields {
            if !names.contains(&field.name) {
                names.push(field.name.clone());
            }
        }
    }
    names
}

fn write_csv(out: &mut impl Write, records: &[&MetricRecord]) -> std::io::Result<()> {
    let columns = columns(records);
    let with_session = records.iter().any(|r| r.session_id().is_some());

    let mut header = vec!["student_id".to_string()];
    if with_session {
        header.push("session_id".to_string());
    }
    header.push("skew_affected".to_string());
    header.extend(columns.iter().cloned());
    write_row(out, &header)?;

    for record in records {
        let mut row = vec![record.student_id.clone()];
        if with_session {
            row.push(record.session_id().unwrap_or_default().to_string());
        }
        row.push(record.skew_affected.to_string());
        for name in &columns {
            row.push(record.get(name).map(ToString::to_string).unwrap_or_default());
        }
        write_row(out, &row)?;
    }
    Ok(())
}

fn write_row(out: &mut impl Write, cells: &[String]) -> std::io::Result<()> {
    let line: Vec<String> = cells.iter().map(|c| quote(c)).collect();
    write!(out, "{}\r\n", line.join(","))
}

/// Quote a cell per RFC 4180 when it holds a separator, quote or line break.
pub fn quote(cell: &str) -> String {
    if cell.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

// ── JSON Lines ────────────────────────────────────────────────────────────────

fn write_jsonl(out: &mut impl Write, records: &[&MetricRecord]) -> Result<()> {
    for record in records {
        serde_json::to_writer(&mut *out, &flatten(record))?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

/// A record as one flat JSON object; missing values become `null`.
fn flatten(record: &MetricRecord) -> Value {
    let mut object = Map::new();
    object.insert("student_id".into(), Value::from(record.student_id.as_str()));
    if let Some(session_id) = record.session_id() {
        object.insert("session_id".into(), Value::from(session_id));
    }
    object.insert("skew_affected".into(), Value::from(record.skew_affected));
    for field in &record.fields {
        let value = match &field.value {
            MetricValue::Count(n) => Value::from(*n),
            MetricValue::Number(x) => Value::from(*x),
            MetricValue::Flag(b) => Value::from(*b),
            MetricValue::Category(s) => Value::from(s.as_str()),
            MetricValue::Missing => Value::Null,
        };
        object.insert(field.name.clone(), value);
    }
    Value::Object(object)
}

/// File name a table of `kind` and `scope` is written to.
pub fn table_name(kind: AnalyserKind, scope: &str, format: ExportFormat) -> String {
    format!("{}_{}.{}", kind, scope, format.extension())
}
