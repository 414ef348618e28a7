//! Execution events
//!
//! Every record delivered by a transport, or synthesized from a polled
//! snapshot, becomes an [`Event`]. The set of kinds is closed; each kind
//! declares whether it may legitimately occur more than once in a session,
//! which is what the dedup layer keys on.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;

/// Closed set of event kinds understood by the client.
///
/// The planning kinds (`Started` through `Completed`) are ordered: their
/// position in [`crate::phases::PHASE_TEMPLATE`] is the phase index.
/// Execution kinds carry no ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS,
)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    IntentDetected,
    LlmStarted,
    LlmRetry,
    StepsGenerated,
    PlanValidated,
    FastPath,
    Completed,
    Failed,
    StepStarted,
    StepCompleted,
    StepFailed,
    CheckpointCreated,
    StreamComplete,
    Error,
}

/// How an event kind behaves under replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeatability {
    /// A one-time milestone. A second delivery is a replay.
    Once,
    /// Repeats once per distinct value of the named data field
    /// (any of the listed spellings).
    PerKey(&'static [&'static str]),
    /// Expected to repeat; every delivery is applied.
    Always,
}

const STEP_ID_FIELDS: &[&str] = &["step_id", "stepId"];
const CHECKPOINT_ID_FIELDS: &[&str] = &["checkpoint_id", "checkpointId"];

pub(crate) const INTENT_FIELDS: &[&str] = &["intent", "detail", "category"];
pub(crate) const COUNT_FIELDS: &[&str] = &["count", "step_count", "stepCount"];
pub(crate) const CONFIDENCE_FIELDS: &[&str] = &["confidence", "score"];
pub(crate) const DETAIL_FIELDS: &[&str] = &["detail"];

impl EventKind {
    pub const ALL: [EventKind; 15] = [
        EventKind::Started,
        EventKind::IntentDetected,
        EventKind::LlmStarted,
        EventKind::LlmRetry,
        EventKind::StepsGenerated,
        EventKind::PlanValidated,
        EventKind::FastPath,
        EventKind::Completed,
        EventKind::Failed,
        EventKind::StepStarted,
        EventKind::StepCompleted,
        EventKind::StepFailed,
        EventKind::CheckpointCreated,
        EventKind::StreamComplete,
        EventKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Started => "started",
            EventKind::IntentDetected => "intent_detected",
            EventKind::LlmStarted => "llm_started",
            EventKind::LlmRetry => "llm_retry",
            EventKind::StepsGenerated => "steps_generated",
            EventKind::PlanValidated => "plan_validated",
            EventKind::FastPath => "fast_path",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::StepStarted => "step_started",
            EventKind::StepCompleted => "step_completed",
            EventKind::StepFailed => "step_failed",
            EventKind::CheckpointCreated => "checkpoint_created",
            EventKind::StreamComplete => "stream_complete",
            EventKind::Error => "error",
        }
    }

    /// Declared replay behaviour of this kind.
    pub fn repeatability(&self) -> Repeatability {
        match self {
            EventKind::LlmRetry => Repeatability::Always,
            EventKind::StepStarted | EventKind::StepCompleted | EventKind::StepFailed => {
                Repeatability::PerKey(STEP_ID_FIELDS)
            }
            EventKind::CheckpointCreated => Repeatability::PerKey(CHECKPOINT_ID_FIELDS),
            _ => Repeatability::Once,
        }
    }

    /// Fields a milestone kind reports its phase detail under. Empty for
    /// kinds that carry no detail.
    pub fn detail_fields(&self) -> &'static [&'static str] {
        match self {
            EventKind::IntentDetected => INTENT_FIELDS,
            EventKind::StepsGenerated => COUNT_FIELDS,
            EventKind::PlanValidated => CONFIDENCE_FIELDS,
            EventKind::Started | EventKind::LlmStarted | EventKind::Completed => DETAIL_FIELDS,
            _ => &[],
        }
    }

    /// Kinds after which the tracked execution can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Completed | EventKind::FastPath | EventKind::Failed | EventKind::Error
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    /// Accepts `snake_case`, `kebab-case`, and the `planning_phase_` /
    /// `planning-phase-` prefixed spellings some servers emit.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        let name = normalized
            .strip_prefix("planning_phase_")
            .unwrap_or(normalized.as_str());

        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| format!("Unknown event type: {}", s))
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EventParseError {
    #[error("event payload is not a JSON object")]
    NotAnObject,
    #[error("event payload has no \"type\" field")]
    MissingType,
    #[error("{0}")]
    UnknownType(String),
}

/// Identity of an applied event within one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub kind: EventKind,
    pub run_id: Option<String>,
    pub key: Option<String>,
}

/// A decoded event. Immutable once constructed; the builder methods consume
/// and return `self`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Value>,
}

const ENVELOPE_FIELDS: &[&str] = &["type", "data", "sequence", "seq"];

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            data: Map::new(),
            sequence: None,
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn with_sequence(mut self, sequence: impl Into<Value>) -> Self {
        self.sequence = Some(sequence.into());
        self
    }

    /// Builds an event from a wire payload.
    ///
    /// Fields may be nested under `data` or sit flat beside `type`.
    pub fn from_value(value: Value) -> Result<Self, EventParseError> {
        let Value::Object(mut object) = value else {
            return Err(EventParseError::NotAnObject);
        };

        let kind = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EventParseError::MissingType)?
            .parse::<EventKind>()
            .map_err(EventParseError::UnknownType)?;

        let sequence = object
            .remove("sequence")
            .or_else(|| object.remove("seq"))
            .filter(|v| !v.is_null());

        let data = match object.remove("data") {
            Some(Value::Object(data)) => data,
            _ => object
                .into_iter()
                .filter(|(key, _)| !ENVELOPE_FIELDS.contains(&key.as_str()))
                .collect(),
        };

        Ok(Self {
            kind,
            data,
            sequence,
        })
    }

    fn lookup(&self, names: &[&str]) -> Option<&Value> {
        names.iter().find_map(|name| self.data.get(*name))
    }

    pub fn str_field(&self, names: &[&str]) -> Option<&str> {
        self.lookup(names).and_then(Value::as_str)
    }

    pub fn u64_field(&self, names: &[&str]) -> Option<u64> {
        self.lookup(names).and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
    }

    pub fn f64_field(&self, names: &[&str]) -> Option<f64> {
        self.lookup(names).and_then(|v| {
            v.as_f64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
    }

    /// Identifier-like field rendered as a string, whether sent as a string
    /// or a number.
    fn id_field(&self, names: &[&str]) -> Option<String> {
        match self.lookup(names)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn run_id(&self) -> Option<String> {
        self.id_field(&["run_id", "runId"])
    }

    pub fn step_id(&self) -> Option<String> {
        self.id_field(STEP_ID_FIELDS)
    }

    pub fn checkpoint_id(&self) -> Option<String> {
        self.id_field(CHECKPOINT_ID_FIELDS)
    }

    /// Human-readable failure message carried by `error` / `failed` events.
    pub fn message(&self) -> Option<&str> {
        self.str_field(&["message", "error", "reason", "detail"])
    }

    /// True for a milestone that omits the detail its kind can carry, such as
    /// one synthesized from a snapshot that only names the phase reached.
    pub fn lacks_detail(&self) -> bool {
        let fields = self.kind.detail_fields();
        !fields.is_empty() && self.lookup(fields).is_none_or(Value::is_null)
    }

    /// Key under which this event is recorded in the seen set, or `None` for
    /// kinds that are applied on every delivery.
    ///
    /// A per-key kind that arrives without its key falls back to the
    /// sequence number; with neither it cannot be told apart from a
    /// legitimate repeat and is applied.
    pub fn dedup_key(&self) -> Option<DedupKey> {
        let key = match self.kind.repeatability() {
            Repeatability::Always => return None,
            Repeatability::Once => None,
            Repeatability::PerKey(names) => {
                let key = self
                    .id_field(names)
                    .or_else(|| self.sequence.as_ref().map(Value::to_string));
                Some(key?)
            }
        };

        Some(DedupKey {
            kind: self.kind,
            run_id: self.run_id(),
            key,
        })
    }
}
