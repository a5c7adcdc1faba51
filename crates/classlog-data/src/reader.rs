//! Log discovery and loading for classlog.
//!
//! Turns the three raw log kinds collected in the classroom (notebook
//! telemetry, chatbot transcripts and pre-normalized event files) into
//! [`Event`]s. Records are produced lazily, one file at a time; a record that
//! cannot be mapped is reported as a [`LoadError`] and the stream carries on.

use std::collections::VecDeque;
use std::fmt;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use classlog_core::data_processors::{strip_ansi, text_of, truncate_output, EpochUnit, TimestampProcessor};
use classlog_core::error::{ClasslogError, LoadError, Result};
use classlog_core::models::{
    EditPayload, Event, ExecutionError, ExecutionOutput, ExecutionPayload, InteractionPayload,
    Payload, Source,
};
use classlog_core::time_utils::TimezoneHandler;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

const NOTEBOOK_PREFIX: &str = "jupyter-";
const NOTEBOOK_SUFFIX: &str = "-log";
const EXECUTE_EVENT: &str = "CellExecuteEvent";
/// Sender name the classroom chatbot uses for its own messages.
const ASSISTANT_SENDER: &str = "Juno";

// ── Log kinds ─────────────────────────────────────────────────────────────────

/// Shape of a raw log file. The declaration order is the ingestion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogKind {
    /// JupyterLab telemetry, `jupyter-<student>-log`.
    Notebook,
    /// Chatbot transcripts, `<student>/*.chat`.
    Chat,
    /// Normalized events, `*.jsonl`.
    Events,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogKind::Notebook => "notebook",
            LogKind::Chat => "chat",
            LogKind::Events => "events",
        })
    }
}

/// A discovered log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub kind: LogKind,
    pub path: PathBuf,
    /// Owner derived from the file layout; `None` for event files, whose
    /// records name their own student.
    pub student_id: Option<String>,
}

impl LogFile {
    fn origin(&self) -> String {
        self.path.display().to_string()
    }
}

// ── Discovery ─────────────────────────────────────────────────────────────────

/// Find all log files of `kind` under `root`, sorted by path.
pub fn find_log_files(kind: LogKind, root: &Path) -> Vec<LogFile> {
    if !root.exists() {
        warn!("Data path does not exist: {}", root.display());
        return Vec::new();
    }

    let mut walker = walkdir::WalkDir::new(root).follow_links(true);
    if kind == LogKind::Chat {
        walker = walker.min_depth(2).max_depth(2);
    }

    let mut files: Vec<LogFile> = walker
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            let student_id = match kind {
                LogKind::Notebook => Some(notebook_student(&name)?),
                LogKind::Chat => {
                    if !name.ends_with(".chat") || name.starts_with(".~") {
                        return None;
                    }
                    Some(entry.path().parent()?.file_name()?.to_str()?.to_string())
                }
                LogKind::Events => {
                    if entry.path().extension().map(|ext| ext != "jsonl").unwrap_or(true) {
                        return None;
                    }
                    None
                }
            };
            Some(LogFile {
                kind,
                path: entry.into_path(),
                student_id,
            })
        })
        .collect();

    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

/// `jupyter-alice-log` → `alice`.
fn notebook_student(file_name: &str) -> Option<String> {
    let student = file_name
        .strip_prefix(NOTEBOOK_PREFIX)?
        .strip_suffix(NOTEBOOK_SUFFIX)?;
    (!student.is_empty()).then(|| student.to_string())
}

// ── Loader ────────────────────────────────────────────────────────────────────

/// Counts surfaced in the run summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub files_read: usize,
    pub files_failed: usize,
    pub loaded: usize,
    pub malformed: usize,
    pub timestamp_errors: usize,
    /// Every rejected record, in load order.
    #[serde(skip)]
    pub errors: Vec<LoadError>,
}

impl LoadReport {
    pub fn record_error(&mut self, error: LoadError) {
        match error {
            LoadError::MalformedRecord { .. } => self.malformed += 1,
            LoadError::Timestamp { .. } => self.timestamp_errors += 1,
        }
        self.errors.push(error);
    }

    /// Records rejected for any reason.
    pub fn skipped(&self) -> usize {
        self.malformed + self.timestamp_errors
    }
}

/// Configured set of log roots.
#[derive(Debug, Clone, Default)]
pub struct Loader {
    tz: TimezoneHandler,
    student: Option<String>,
    roots: Vec<(LogKind, PathBuf)>,
}

impl Loader {
    pub fn new(tz: TimezoneHandler) -> Self {
        Self {
            tz,
            student: None,
            roots: Vec::new(),
        }
    }

    /// Only load records of `student`.
    pub fn with_student(mut self, student: Option<String>) -> Self {
        self.student = student;
        self
    }

    /// Register a directory to scan for logs of `kind`.
    pub fn add_root(&mut self, kind: LogKind, root: impl Into<PathBuf>) -> Result<()> {
        let root = root.into();
        if !root.exists() {
            return Err(ClasslogError::DataPathNotFound(root));
        }
        self.roots.push((kind, root));
        Ok(())
    }

    pub fn has_roots(&self) -> bool {
        !self.roots.is_empty()
    }

    /// Every file to load, in ingestion order: by kind, then by path.
    pub fn files(&self) -> Vec<LogFile> {
        let mut files: Vec<LogFile> = self
            .roots
            .iter()
            .flat_map(|(kind, root)| find_log_files(*kind, root))
            .filter(|file| match (&self.student, &file.student_id) {
                (Some(wanted), Some(owner)) => wanted == owner,
                _ => true,
            })
            .collect();
        files.sort_by(|a, b| (a.kind, &a.path).cmp(&(b.kind, &b.path)));
        files.dedup_by(|a, b| a.kind == b.kind && a.path == b.path);
        files
    }

    /// Lazy stream over every record, numbering events from zero.
    pub fn stream(&self) -> RecordStream {
        self.stream_from(0)
    }

    /// Lazy stream numbering events from `first_seq`, so that a later load
    /// pass continues the ingestion order of an earlier one.
    pub fn stream_from(&self, first_seq: u64) -> RecordStream {
        RecordStream {
            pending: self.files().into(),
            current: None,
            tz: self.tz,
            student: self.student.clone(),
            next_seq: first_seq,
            files_read: 0,
            files_failed: 0,
        }
    }

    /// Drain the stream into memory.
    pub fn load(&self) -> (Vec<Event>, LoadReport) {
        self.load_from(0)
    }

    pub fn load_from(&self, first_seq: u64) -> (Vec<Event>, LoadReport) {
        let mut stream = self.stream_from(first_seq);
        let mut events = Vec::new();
        let mut report = LoadReport::default();

        for item in stream.by_ref() {
            match item {
                Ok(event) => {
                    report.loaded += 1;
                    events.push(event);
                }
                Err(e) => {
                    debug!("Skipping record: {}", e);
                    report.record_error(e);
                }
            }
        }
        report.files_read = stream.files_read;
        report.files_failed = stream.files_failed;

        debug!(
            "Loaded {} events from {} files ({} skipped)",
            report.loaded,
            report.files_read,
            report.skipped()
        );
        (events, report)
    }
}

// ── RecordStream ──────────────────────────────────────────────────────────────

/// A mapped record that has not been numbered yet. `Ok(None)` marks a record
/// that is legitimately not an event.
type RecordIter = Box<dyn Iterator<Item = std::result::Result<Option<RawEvent>, LoadError>> + Send>;

struct RawEvent {
    student_id: String,
    timestamp: DateTime<Utc>,
    session_hint: Option<String>,
    payload: Payload,
}

impl RawEvent {
    fn into_event(self, ingest_seq: u64) -> Event {
        let mut event = Event::new(self.student_id, self.timestamp, self.payload, ingest_seq);
        event.session_hint = self.session_hint;
        event
    }
}

struct FileCursor {
    origin: String,
    records: RecordIter,
    loaded: usize,
    skipped: usize,
}

/// Lazy sequence of events over a list of files.
///
/// Files are opened one at a time, when the previous one is exhausted. An
/// unreadable file is logged and counted, never fatal.
pub struct RecordStream {
    pending: VecDeque<LogFile>,
    current: Option<FileCursor>,
    tz: TimezoneHandler,
    student: Option<String>,
    next_seq: u64,
    files_read: usize,
    files_failed: usize,
}

impl RecordStream {
    /// Sequence number the next event will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn files_read(&self) -> usize {
        self.files_read
    }

    pub fn files_failed(&self) -> usize {
        self.files_failed
    }
}

impl Iterator for RecordStream {
    type Item = std::result::Result<Event, LoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cursor) = self.current.as_mut() {
                match cursor.records.next() {
                    Some(Ok(Some(raw))) => {
                        cursor.loaded += 1;
                        let seq = self.next_seq;
                        self.next_seq += 1;
                        return Some(Ok(raw.into_event(seq)));
                    }
                    Some(Ok(None)) => continue,
                    Some(Err(e)) => {
                        cursor.skipped += 1;
                        return Some(Err(e));
                    }
                    None => {
                        debug!(
                            "File {}: {} loaded, {} skipped",
                            cursor.origin, cursor.loaded, cursor.skipped
                        );
                        self.current = None;
                    }
                }
            }

            let file = self.pending.pop_front()?;
            match open_records(&file, self.tz, self.student.clone()) {
                Ok(records) => {
                    self.files_read += 1;
                    self.current = Some(FileCursor {
                        origin: file.origin(),
                        records,
                        loaded: 0,
                        skipped: 0,
                    });
                }
                Err(e) => {
                    warn!("Failed to read file {}: {}", file.path.display(), e);
                    self.files_failed += 1;
                }
            }
        }
    }
}

fn open_records(
    file: &LogFile,
    tz: TimezoneHandler,
    student: Option<String>,
) -> std::io::Result<RecordIter> {
    match file.kind {
        LogKind::Notebook => notebook_records(file, tz),
        LogKind::Chat => chat_records(file, tz),
        LogKind::Events => event_records(file, tz, student),
    }
}

fn file_level_error(origin: &str, reason: String) -> RecordIter {
    Box::new(std::iter::once(Err(LoadError::malformed(origin, 0, reason))))
}

// ── Shared field helpers ──────────────────────────────────────────────────────

/// Missing timestamps are malformed records; present but unreadable ones are
/// timestamp errors.
fn parse_timestamp(
    raw: Option<&Value>,
    unit: EpochUnit,
    tz: &TimezoneHandler,
    origin: &str,
    index: usize,
    field: &str,
) -> std::result::Result<DateTime<Utc>, LoadError> {
    match raw {
        None | Some(Value::Null) => Err(LoadError::malformed(
            origin,
            index,
            format!("missing {field}"),
        )),
        Some(value) => TimestampProcessor::parse(value, unit, tz).ok_or_else(|| {
            let shown = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            LoadError::timestamp(origin, index, shown)
        }),
    }
}

fn cell_code(cell: &Value) -> Option<String> {
    cell.get("source").and_then(text_of).map(|s| s.replace('\t', ""))
}

// ── Notebook telemetry ────────────────────────────────────────────────────────

/// Telemetry files are a comma-separated stream of JSON objects, not a valid
/// JSON document on their own.
fn notebook_records(file: &LogFile, tz: TimezoneHandler) -> std::io::Result<RecordIter> {
    let content = std::fs::read_to_string(&file.path)?;
    let origin = file.origin();
    let student = file.student_id.clone().unwrap_or_default();

    let body = content.trim_end_matches(|c: char| c == ',' || c.is_whitespace());
    if body.trim().is_empty() {
        return Ok(Box::new(std::iter::empty()));
    }

    let values: Vec<Value> = match serde_json::from_str(&format!("[{body}]")) {
        Ok(values) => values,
        Err(e) => return Ok(file_level_error(&origin, format!("not a telemetry stream: {e}"))),
    };

    Ok(Box::new(values.into_iter().enumerate().map(move |(i, value)| {
        map_notebook_event(&value, &student, &origin, i + 1, &tz)
    })))
}

fn map_notebook_event(
    value: &Value,
    student: &str,
    origin: &str,
    index: usize,
    tz: &TimezoneHandler,
) -> std::result::Result<Option<RawEvent>, LoadError> {
    let detail = value
        .get("eventDetail")
        .filter(|d| d.is_object())
        .ok_or_else(|| LoadError::malformed(origin, index, "missing eventDetail"))?;
    let event_name = detail
        .get("eventName")
        .and_then(Value::as_str)
        .ok_or_else(|| LoadError::malformed(origin, index, "missing eventDetail.eventName"))?;
    let timestamp = parse_timestamp(
        detail.get("eventTime"),
        EpochUnit::Milliseconds,
        tz,
        origin,
        index,
        "eventDetail.eventTime",
    )?;

    let info = detail.get("eventInfo").filter(|i| !i.is_null());
    let state = value.get("notebookState").filter(|s| !s.is_null());
    let notebook_path = state
        .and_then(|s| s.get("notebookPath"))
        .and_then(Value::as_str);
    let cells = state
        .and_then(|s| s.get("notebookContent"))
        .and_then(|c| c.get("cells"))
        .and_then(Value::as_array);

    let payload = if event_name == EXECUTE_EVENT {
        match execution_payload(info, notebook_path, cells)
            .map_err(|reason| LoadError::malformed(origin, index, reason))?
        {
            Some(payload) => Payload::Execution(payload),
            None => return Ok(None),
        }
    } else {
        Payload::Edit(edit_payload(event_name, info, notebook_path, cells))
    };

    Ok(Some(RawEvent {
        student_id: student.to_string(),
        timestamp,
        session_hint: None,
        payload,
    }))
}

/// Cell index an event refers to: `eventInfo.index`, or the only entry of
/// `eventInfo.cells`.
fn cell_index(info: &Value) -> Option<usize> {
    if let Some(index) = info.get("index").and_then(Value::as_u64) {
        return Some(index as usize);
    }
    match info.get("cells").and_then(Value::as_array)?.as_slice() {
        [only] => only.get("index").and_then(Value::as_u64).map(|i| i as usize),
        _ => None,
    }
}

/// `Ok(None)` for executions of markdown/raw cells.
fn execution_payload(
    info: Option<&Value>,
    notebook_path: Option<&str>,
    cells: Option<&Vec<Value>>,
) -> std::result::Result<Option<ExecutionPayload>, String> {
    let cells = cells.ok_or("CellExecuteEvent without notebook content")?;
    let executed = info
        .and_then(|i| i.get("cells"))
        .and_then(Value::as_array)
        .ok_or("CellExecuteEvent without eventInfo.cells")?;
    if executed.len() != 1 {
        return Err(format!("expected one executed cell, found {}", executed.len()));
    }
    let index = executed[0]
        .get("index")
        .and_then(Value::as_u64)
        .ok_or("executed cell has no index")? as usize;
    let cell = cells
        .get(index)
        .ok_or_else(|| format!("executed cell {index} is not in the notebook"))?;
    if cell.get("cell_type").and_then(Value::as_str) != Some("code") {
        return Ok(None);
    }

    let mut outputs = Vec::new();
    let mut error = None;
    for output in cell.get("outputs").and_then(Value::as_array).into_iter().flatten() {
        let output_type = output
            .get("output_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        if output_type == "error" {
            if error.is_some() {
                continue;
            }
            let traceback = output
                .get("traceback")
                .and_then(Value::as_array)
                .map(|lines| {
                    lines
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            error = Some(ExecutionError {
                name: output.get("ename").and_then(Value::as_str).unwrap_or("Error").to_string(),
                value: output.get("evalue").and_then(Value::as_str).unwrap_or_default().to_string(),
                traceback: strip_ansi(&traceback),
            });
            continue;
        }

        let text = match output_type {
            "stream" => output.get("text").and_then(text_of),
            "execute_result" | "display_data" => output.get("data").map(|data| {
                data.get("text/plain")
                    .and_then(text_of)
                    .unwrap_or_else(|| data.to_string())
            }),
            _ => None,
        };
        outputs.push(ExecutionOutput {
            output_type: output_type.to_string(),
            text: text.map(|t| truncate_output(&t)),
        });
    }

    Ok(Some(ExecutionPayload {
        file: notebook_path.map(|path| format!("{path}_{index}")),
        code: cell_code(cell).unwrap_or_default(),
        outputs,
        error,
    }))
}

fn edit_payload(
    event_name: &str,
    info: Option<&Value>,
    notebook_path: Option<&str>,
    cells: Option<&Vec<Value>>,
) -> EditPayload {
    let index = info.and_then(cell_index);
    let file = match (notebook_path, index) {
        (Some(path), Some(i)) => Some(format!("{path}_{i}")),
        _ => None,
    };
    let selection = info
        .and_then(|i| i.get("selection"))
        .filter(|s| !s.is_null())
        .map(|s| s.as_str().map(str::to_string).unwrap_or_else(|| s.to_string()));
    let content = index
        .and_then(|i| cells?.get(i))
        .and_then(cell_code);

    EditPayload {
        event_type: event_name.to_string(),
        file,
        selection,
        content,
    }
}

// ── Chat transcripts ──────────────────────────────────────────────────────────

fn chat_records(file: &LogFile, tz: TimezoneHandler) -> std::io::Result<RecordIter> {
    let content = std::fs::read_to_string(&file.path)?;
    let origin = file.origin();
    let student = file.student_id.clone().unwrap_or_default();

    if content.trim().is_empty() {
        return Ok(Box::new(std::iter::empty()));
    }

    let mut document: Value = match serde_json::from_str(&content) {
        Ok(doc) => doc,
        Err(e) => return Ok(file_level_error(&origin, format!("not a chat document: {e}"))),
    };
    let messages = match document.get_mut("messages").map(Value::take) {
        Some(Value::Array(messages)) => messages,
        None | Some(Value::Null) => Vec::new(),
        Some(_) => return Ok(file_level_error(&origin, "messages is not a list".to_string())),
    };

    Ok(Box::new(messages.into_iter().enumerate().map(move |(i, message)| {
        map_chat_message(&message, &student, &origin, i + 1, &tz).map(Some)
    })))
}

fn map_chat_message(
    message: &Value,
    student: &str,
    origin: &str,
    index: usize,
    tz: &TimezoneHandler,
) -> std::result::Result<RawEvent, LoadError> {
    let timestamp = parse_timestamp(message.get("time"), EpochUnit::Seconds, tz, origin, index, "time")?;
    let sender = message
        .get("sender")
        .and_then(Value::as_str)
        .ok_or_else(|| LoadError::malformed(origin, index, "missing sender"))?;
    let body = message
        .get("body")
        .and_then(Value::as_str)
        .ok_or_else(|| LoadError::malformed(origin, index, "missing body"))?;
    let automated = message
        .get("automated")
        .and_then(Value::as_bool)
        .unwrap_or(sender == ASSISTANT_SENDER);

    Ok(RawEvent {
        student_id: student.to_string(),
        timestamp,
        session_hint: None,
        payload: Payload::Interaction(InteractionPayload {
            sender: sender.to_string(),
            body: body.to_string(),
            automated,
            model: message.get("model").and_then(Value::as_str).map(str::to_string),
        }),
    })
}

// ── Normalized events ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct EventLine {
    student_id: String,
    source: String,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    session_hint: Option<String>,
    #[serde(default)]
    payload: Value,
}

fn event_records(
    file: &LogFile,
    tz: TimezoneHandler,
    student: Option<String>,
) -> std::io::Result<RecordIter> {
    let handle = std::fs::File::open(&file.path)?;
    let origin = file.origin();

    let lines = std::io::BufReader::new(handle).lines().enumerate();
    Ok(Box::new(lines.filter_map(move |(i, line)| {
        let line_no = i + 1;
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                return Some(Err(LoadError::malformed(&origin, line_no, format!("unreadable line: {e}"))))
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(map_event_line(trimmed, &origin, line_no, &tz, student.as_deref()))
    })))
}

fn map_event_line(
    line: &str,
    origin: &str,
    index: usize,
    tz: &TimezoneHandler,
    student: Option<&str>,
) -> std::result::Result<Option<RawEvent>, LoadError> {
    let record: EventLine = serde_json::from_str(line)
        .map_err(|e| LoadError::malformed(origin, index, e.to_string()))?;
    if student.is_some_and(|wanted| wanted != record.student_id) {
        return Ok(None);
    }

    let source: Source = record
        .source
        .parse()
        .map_err(|e: String| LoadError::malformed(origin, index, e))?;
    let timestamp = parse_timestamp(
        record.timestamp.as_ref(),
        EpochUnit::Seconds,
        tz,
        origin,
        index,
        "timestamp",
    )?;

    let bad_payload = |e: serde_json::Error| LoadError::malformed(origin, index, format!("invalid {source} payload: {e}"));
    let payload = match source {
        Source::Edit => Payload::Edit(serde_json::from_value(record.payload).map_err(bad_payload)?),
        Source::Execution => Payload::Execution(serde_json::from_value(record.payload).map_err(bad_payload)?),
        Source::Interaction => {
            Payload::Interaction(serde_json::from_value(record.payload).map_err(bad_payload)?)
        }
    };

    Ok(Some(RawEvent {
        student_id: record.student_id,
        timestamp,
        session_hint: record.session_hint,
        payload,
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
