use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ── Source ────────────────────────────────────────────────────────────────────

/// The log an [`Event`] was read from.
///
/// The declaration order doubles as the tie-break priority when two events of
/// one student share a timestamp: edit < execution < interaction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// A code-edit event from the notebook telemetry.
    Edit,
    /// A code-execution event from the notebook telemetry.
    Execution,
    /// A chatbot message.
    Interaction,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Edit, Source::Execution, Source::Interaction];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Edit => "edit",
            Source::Execution => "execution",
            Source::Interaction => "interaction",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "edit" | "edits" => Ok(Source::Edit),
            "execution" | "executions" => Ok(Source::Execution),
            "interaction" | "interactions" | "chat" | "message" => Ok(Source::Interaction),
            other => Err(format!("unknown event source: {other}")),
        }
    }
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// Fields of a notebook edit (cell change, selection, cursor move, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EditPayload {
    /// Telemetry event name, e.g. `"CellEditEvent"`.
    pub event_type: String,
    /// Cell identifier `<notebook path>_<cell index>`, when the event targets a cell.
    #[serde(default)]
    pub file: Option<String>,
    /// Serialized selection/cursor position.
    #[serde(default)]
    pub selection: Option<String>,
    /// Cell content after the edit, when the notebook state carried it.
    #[serde(default)]
    pub content: Option<String>,
}

/// One non-error output of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub output_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// The error raised by a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Exception class, e.g. `"NameError"`.
    pub name: String,
    /// Exception message.
    #[serde(default)]
    pub value: String,
    /// Traceback with terminal escape sequences removed.
    #[serde(default)]
    pub traceback: String,
}

/// Fields of a cell execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionPayload {
    #[serde(default)]
    pub file: Option<String>,
    /// Code snapshot that was executed.
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub outputs: Vec<ExecutionOutput>,
    #[serde(default)]
    pub error: Option<ExecutionError>,
}

impl ExecutionPayload {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A single chat message, sent either by the student or by the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InteractionPayload {
    pub sender: String,
    #[serde(default)]
    pub body: String,
    /// `true` when the assistant produced the message.
    #[serde(default)]
    pub automated: bool,
    /// Model identifier reported by the chat backend.
    #[serde(default)]
    pub model: Option<String>,
}

/// Source-specific event data. The variant fixes the event's [`Source`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Payload {
    Edit(EditPayload),
    Execution(ExecutionPayload),
    Interaction(InteractionPayload),
}

impl Payload {
    pub fn source(&self) -> Source {
        match self {
            Payload::Edit(_) => Source::Edit,
            Payload::Execution(_) => Source::Execution,
            Payload::Interaction(_) => Source::Interaction,
        }
    }
}

// ── Event ─────────────────────────────────────────────────────────────────────

/// An atomic, timestamped occurrence in one student's activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Opaque student identifier, stable across sources.
    pub student_id: String,
    /// Session this event belongs to; set by the timeline builder.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Session label supplied by the raw log, if any.
    #[serde(default)]
    pub session_hint: Option<String>,
    /// Canonical UTC timestamp.
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
    /// Position in the overall load order, used as the final tie-break.
    pub ingest_seq: u64,
}

impl Event {
    pub fn new(
        student_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: Payload,
        ingest_seq: u64,
    ) -> Self {
        Self {
            student_id: student_id.into(),
            session_id: None,
            session_hint: None,
            timestamp,
            payload,
            ingest_seq,
        }
    }

    pub fn source(&self) -> Source {
        self.payload.source()
    }

    /// Deterministic ordering key within a student's timeline.
    pub fn timeline_key(&self) -> (DateTime<Utc>, Source, u64) {
        (self.timestamp, self.source(), self.ingest_seq)
    }

    /// The notebook cell the event refers to, if any.
    pub fn file(&self) -> Option<&str> {
        match &self.payload {
            Payload::Edit(p) => p.file.as_deref(),
            Payload::Execution(p) => p.file.as_deref(),
            Payload::Interaction(_) => None,
        }
    }

    /// Text content used by similarity heuristics: resulting cell content for
    /// edits, executed code for executions, message body for interactions.
    pub fn content(&self) -> Option<&str> {
        let text = match &self.payload {
            Payload::Edit(p) => p.content.as_deref()?,
            Payload::Execution(p) => p.code.as_str(),
            Payload::Interaction(p) => p.body.as_str(),
        };
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }

    pub fn as_edit(&self) -> Option<&EditPayload> {
        match &self.payload {
            Payload::Edit(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_execution(&self) -> Option<&ExecutionPayload> {
        match &self.payload {
            Payload::Execution(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_interaction(&self) -> Option<&InteractionPayload> {
        match &self.payload {
            Payload::Interaction(p) => Some(p),
            _ => None,
        }
    }

    /// A failed execution.
    pub fn is_failed_execution(&self) -> bool {
        self.as_execution().is_some_and(|p| !p.is_success())
    }

    /// A chat message written by the student rather than the assistant.
    pub fn is_student_message(&self) -> bool {
        self.as_interaction().is_some_and(|p| !p.automated)
    }
}

// ── ClockSkewWarning ──────────────────────────────────────────────────────────

/// A systematic timestamp offset detected between two sources of one student.
///
/// Non-fatal: it is attached to the affected sessions so that metrics derived
/// from them can be flagged instead of silently trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockSkewWarning {
    /// Source treated as the time reference (the cause).
    pub reference: Source,
    /// Source whose clock appears offset (the effect).
    pub skewed: Source,
    /// Median signed offset `effect - cause`, in seconds.
    pub median_offset_secs: f64,
    /// Configured maximum plausible latency, in seconds.
    pub max_latency_secs: f64,
    /// Number of causal pairs the median was computed from.
    pub samples: usize,
}

impl fmt::Display for ClockSkewWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "clock skew between {} and {}: median offset {:.1}s over {} samples (plausible range 0..={:.1}s)",
            self.reference, self.skewed, self.median_offset_secs, self.samples, self.max_latency_secs
        )
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// A maximal run of one student's events without an inactivity gap larger
/// than the configured threshold. Owns its events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// `<student>-s<NNN>`, numbered chronologically from 001.
    pub id: String,
    pub student_id: String,
    /// Timestamp of the first event.
    pub start: DateTime<Utc>,
    /// Timestamp of the last event.
    pub end: DateTime<Utc>,
    /// Events in timeline order.
    pub events: Vec<Event>,
    #[serde(default)]
    pub skew_warnings: Vec<ClockSkewWarning>,
}

impl Session {
    /// Build a session from already-ordered, non-empty `events`.
    ///
    /// Returns `None` for an empty event list.
    pub fn from_events(id: String, mut events: Vec<Event>) -> Option<Self> {
        let first = events.first()?;
        let student_id = first.student_id.clone();
        let start = first.timestamp;
        let end = events.last().map(|e| e.timestamp).unwrap_or(start);
        for event in events.iter_mut() {
            event.session_id = Some(id.clone());
        }
        Some(Self {
            id,
            student_id,
            start,
            end,
            events,
            skew_warnings: Vec::new(),
        })
    }

    /// Append events found in a later load pass and re-sort explicitly.
    pub fn append(&mut self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        for mut event in events {
            event.session_id = Some(self.id.clone());
            self.events.push(event);
        }
        self.events.sort_by_key(|e| e.timeline_key());
        if let (Some(first), Some(last)) = (self.events.first(), self.events.last()) {
            self.start = first.timestamp;
            self.end = last.timestamp;
        }
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Session length in minutes, never below 1.0 so rates stay finite.
    pub fn duration_minutes(&self) -> f64 {
        let minutes = self.duration().num_milliseconds() as f64 / 60_000.0;
        minutes.max(1.0)
    }

    pub fn is_skew_affected(&self) -> bool {
        !self.skew_warnings.is_empty()
    }

    /// Indexed events of one source, in timeline order.
    pub fn events_of(&self, source: Source) -> impl Iterator<Item = (usize, &Event)> {
        self.events
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.source() == source)
    }

    pub fn count_of(&self, source: Source) -> usize {
        self.events_of(source).count()
    }
}

// ── Relation / Episode ────────────────────────────────────────────────────────

/// How many targets one anchor may claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    OneToOne,
    OneToMany,
}

/// Kind of cross-source link an [`Episode`] represents.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// An execution caused by a preceding edit.
    TriggeredBy,
    /// A chat turn that precedes a burst of edits.
    Preceded,
    /// A failed execution followed by a student question to the chatbot.
    Consulted,
}

impl Relation {
    pub const ALL: [Relation; 3] = [Relation::TriggeredBy, Relation::Preceded, Relation::Consulted];

    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::TriggeredBy => "triggered_by",
            Relation::Preceded => "preceded",
            Relation::Consulted => "consulted",
        }
    }

    /// Source of the earlier event of the pair.
    pub fn anchor(&self) -> Source {
        match self {
            Relation::TriggeredBy => Source::Edit,
            Relation::Preceded => Source::Interaction,
            Relation::Consulted => Source::Execution,
        }
    }

    /// Source of the later event(s) of the pair.
    pub fn target(&self) -> Source {
        match self {
            Relation::TriggeredBy => Source::Execution,
            Relation::Preceded => Source::Edit,
            Relation::Consulted => Source::Interaction,
        }
    }

    pub fn cardinality(&self) -> Cardinality {
        match self {
            Relation::Preceded => Cardinality::OneToMany,
            Relation::TriggeredBy | Relation::Consulted => Cardinality::OneToOne,
        }
    }

    /// Whether `event` may act as the anchor of this relation.
    pub fn qualifies_anchor(&self, event: &Event) -> bool {
        match self {
            Relation::Consulted => event.is_failed_execution(),
            _ => event.source() == self.anchor(),
        }
    }

    /// Whether `event` may be claimed as a target of this relation.
    pub fn qualifies_target(&self, event: &Event) -> bool {
        match self {
            Relation::Consulted => event.is_student_message(),
            _ => event.source() == self.target(),
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Relation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "triggered_by" => Ok(Relation::TriggeredBy),
            "preceded" => Ok(Relation::Preceded),
            "consulted" => Ok(Relation::Consulted),
            other => Err(format!(
                "unknown relation '{other}' (expected triggered_by, preceded or consulted)"
            )),
        }
    }
}

/// Cross-source group of events judged to form one behavioral unit.
///
/// `members` are positions into the owning [`Session::events`]; the anchor
/// comes first, followed by its targets in timeline order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub relation: Relation,
    pub members: Vec<usize>,
}

impl Episode {
    /// Position of the anchor; `None` for an episode without members.
    pub fn anchor(&self) -> Option<usize> {
        self.members.first().copied()
    }

    pub fn targets(&self) -> &[usize] {
        self.members.get(1..).unwrap_or_default()
    }

    /// Resolve member positions against the owning session.
    pub fn events<'a>(&'a self, session: &'a Session) -> impl Iterator<Item = &'a Event> + 'a {
        self.members.iter().filter_map(move |&i| session.events.get(i))
    }

    /// Time from the anchor to the first target.
    pub fn latency(&self, session: &Session) -> Option<TimeDelta> {
        let anchor = session.events.get(self.anchor()?)?;
        let first = session.events.get(*self.targets().first()?)?;
        Some(first.timestamp - anchor.timestamp)
    }
}

// ── Metric records ────────────────────────────────────────────────────────────

/// Which analyser produced a record.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum AnalyserKind {
    Edit,
    Execution,
    Interaction,
}

impl AnalyserKind {
    pub const ALL: [AnalyserKind; 3] = [
        AnalyserKind::Edit,
        AnalyserKind::Execution,
        AnalyserKind::Interaction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyserKind::Edit => "edit",
            AnalyserKind::Execution => "execution",
            AnalyserKind::Interaction => "interaction",
        }
    }
}

impl fmt::Display for AnalyserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Count(u64),
    Number(f64),
    Flag(bool),
    Category(String),
    Missing,
}

impl MetricValue {
    pub fn number(value: Option<f64>) -> Self {
        value.map(MetricValue::Number).unwrap_or(MetricValue::Missing)
    }

    pub fn category(value: Option<impl Into<String>>) -> Self {
        value
            .map(|v| MetricValue::Category(v.into()))
            .unwrap_or(MetricValue::Missing)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Count(n) => Some(*n as f64),
            MetricValue::Number(x) => Some(*x),
            _ => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Count(n) => write!(f, "{n}"),
            MetricValue::Number(x) => write!(f, "{:.4}", x),
            MetricValue::Flag(b) => write!(f, "{b}"),
            MetricValue::Category(s) => f.write_str(s),
            MetricValue::Missing => Ok(()),
        }
    }
}

/// What a record describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "session_id", rename_all = "lowercase")]
pub enum MetricScope {
    Session(String),
    Student,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricField {
    pub name: String,
    pub value: MetricValue,
}

/// Immutable analyser output for one session or one student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub analyser: AnalyserKind,
    pub student_id: String,
    pub scope: MetricScope,
    /// Set when any contributing session carries a clock-skew warning.
    pub skew_affected: bool,
    /// Named values in analyser-defined order.
    pub fields: Vec<MetricField>,
}

impl MetricRecord {
    /// Start a session-scoped record.
    pub fn for_session(analyser: AnalyserKind, session: &Session) -> Self {
        Self {
            analyser,
            student_id: session.student_id.clone(),
            scope: MetricScope::Session(session.id.clone()),
            skew_affected: session.is_skew_affected(),
            fields: Vec::new(),
        }
    }

    /// Start a student-scoped roll-up record.
    pub fn for_student(analyser: AnalyserKind, student_id: impl Into<String>) -> Self {
        Self {
            analyser,
            student_id: student_id.into(),
            scope: MetricScope::Student,
            skew_affected: false,
            fields: Vec::new(),
        }
    }

    pub fn with(mut self, name: &str, value: MetricValue) -> Self {
        self.fields.push(MetricField {
            name: name.to_string(),
            value,
        });
        self
    }

    /// Replace the value of `name` in place, appending it when absent.
    pub fn set(mut self, name: &str, value: MetricValue) -> Self {
        match self.fields.iter().position(|f| f.name == name) {
            Some(i) => self.fields[i].value = value,
            None => self.fields.push(MetricField {
                name: name.to_string(),
                value,
            }),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    pub fn session_id(&self) -> Option<&str> {
        match &self.scope {
            MetricScope::Session(id) => Some(id),
            MetricScope::Student => None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
