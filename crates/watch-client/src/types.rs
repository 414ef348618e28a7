//! Types for the execution snapshot API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::event::{Event, EventKind};
use crate::phases::{phase_index, StepStatus};

/// Server-side execution status. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Planning,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Statuses under which polling continues.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Pending
                | ExecutionStatus::Planning
                | ExecutionStatus::Running
                | ExecutionStatus::Paused
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Planning => "planning",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct StepSnapshot {
    pub id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub error: Option<String>,
}

/// Point-in-time view of one execution, as returned by
/// `GET /api/executions/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub status: ExecutionStatus,
    /// Latest planning phase reached, as an event type name.
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub step_count: Option<u64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub steps: Vec<StepSnapshot>,
    #[serde(default)]
    pub checkpoints: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    #[ts(type = "string | null")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn new(id: impl Into<String>, status: ExecutionStatus) -> Self {
        Self {
            id: id.into(),
            status,
            phase: None,
            intent: None,
            step_count: None,
            confidence: None,
            steps: Vec::new(),
            checkpoints: Vec::new(),
            error: None,
            updated_at: None,
        }
    }

    /// Synthesizes the events this snapshot implies, in phase order.
    ///
    /// They are applied through the same dedup path as streamed events, so
    /// anything the stream already delivered is discarded.
    pub fn to_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        if self.status != ExecutionStatus::Pending {
            events.push(Event::new(EventKind::Started));
        }
        if let Some(intent) = &self.intent {
            events.push(Event::new(EventKind::IntentDetected).with("intent", intent.as_str()));
        }
        if let Some(count) = self.step_count {
            events.push(Event::new(EventKind::StepsGenerated).with("count", count));
        }
        if let Some(confidence) = self.confidence {
            events.push(Event::new(EventKind::PlanValidated).with("confidence", confidence));
        }

        let phase = self
            .phase
            .as_deref()
            .and_then(|p| p.parse::<EventKind>().ok());
        if let Some(kind) = phase.filter(|k| phase_index(*k).is_some() && !k.is_terminal()) {
            if !events.iter().any(|e| e.kind == kind) {
                events.push(Event::new(kind));
            }
        }
        events.sort_by_key(|e| phase_index(e.kind).unwrap_or(usize::MAX));

        for step in &self.steps {
            let kind = match step.status {
                StepStatus::Running => EventKind::StepStarted,
                StepStatus::Completed => EventKind::StepCompleted,
                StepStatus::Failed => EventKind::StepFailed,
            };
            let mut event = Event::new(kind).with("step_id", step.id.as_str());
            if let Some(error) = &step.error {
                event = event.with("error", error.as_str());
            }
            events.push(event);
        }
        for checkpoint in &self.checkpoints {
            events.push(
                Event::new(EventKind::CheckpointCreated).with("checkpoint_id", checkpoint.as_str()),
            );
        }

        match self.status {
            ExecutionStatus::Completed if phase == Some(EventKind::FastPath) => {
                events.push(Event::new(EventKind::FastPath))
            }
            ExecutionStatus::Completed => events.push(Event::new(EventKind::Completed)),
            ExecutionStatus::Failed => events.push(
                Event::new(EventKind::Failed)
                    .with("message", self.error.as_deref().unwrap_or("Execution failed")),
            ),
            ExecutionStatus::Cancelled => events.push(
                Event::new(EventKind::Failed)
                    .with("message", self.error.as_deref().unwrap_or("Execution cancelled")),
            ),
            _ => {}
        }

        events
    }
}

/// Response of `POST /api/executions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct StartedExecution {
    pub id: String,
    #[serde(default = "default_started_status")]
    pub status: ExecutionStatus,
}

fn default_started_status() -> ExecutionStatus {
    ExecutionStatus::Pending
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartExecutionRequest {
    pub intent: String,
}

/// One persisted record of an execution's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: Option<String>,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    #[ts(type = "unknown")]
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kinds(events: &[Event]) -> Vec<EventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn test_parses_snapshot_with_defaults() {
        let snapshot: Snapshot = serde_json::from_value(json!({
            "id": "exec-1",
            "status": "running",
            "phase": "planning-phase-llm_started",
            "updatedAt": "2026-03-01T10:00:00Z"
        }))
        .unwrap();

        assert_eq!(snapshot.status, ExecutionStatus::Running);
        assert!(snapshot.steps.is_empty());
        assert!(snapshot.updated_at.is_some());
        assert_eq!(
            kinds(&snapshot.to_events()),
            vec![EventKind::Started, EventKind::LlmStarted]
        );
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let parsed = serde_json::from_value::<Snapshot>(json!({
            "id": "exec-1",
            "status": "exploded"
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_pending_snapshot_implies_nothing() {
        let snapshot = Snapshot::new("exec-1", ExecutionStatus::Pending);
        assert!(snapshot.to_events().is_empty());
        assert!(ExecutionStatus::Pending.is_active());
    }

    #[test]
    fn test_completed_snapshot_events_in_order() {
        let mut snapshot = Snapshot::new("exec-1", ExecutionStatus::Completed);
        snapshot.phase = Some("completed".into());
        snapshot.intent = Some("billing".into());
        snapshot.step_count = Some(2);
        snapshot.steps = vec![StepSnapshot {
            id: "s1".into(),
            status: StepStatus::Completed,
            error: None,
        }];
        snapshot.checkpoints = vec!["c1".into()];

        assert_eq!(
            kinds(&snapshot.to_events()),
            vec![
                EventKind::Started,
                EventKind::IntentDetected,
                EventKind::StepsGenerated,
                EventKind::StepCompleted,
                EventKind::CheckpointCreated,
                EventKind::Completed,
            ]
        );
    }

    #[test]
    fn test_fast_path_snapshot() {
        let mut snapshot = Snapshot::new("exec-1", ExecutionStatus::Completed);
        snapshot.phase = Some("fast_path".into());
        assert_eq!(
            kinds(&snapshot.to_events()),
            vec![EventKind::Started, EventKind::FastPath]
        );
    }

    #[test]
    fn test_cancelled_maps_to_failure() {
        let snapshot = Snapshot::new("exec-1", ExecutionStatus::Cancelled);
        let events = snapshot.to_events();
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Failed);
        assert_eq!(last.message(), Some("Execution cancelled"));
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }
}
