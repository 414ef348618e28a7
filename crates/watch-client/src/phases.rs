//! Multi-phase progress state machine
//!
//! [`Progress`] is derived entirely from applied events by [`reduce`], a pure
//! function. The ordered phase template is shared, read-only data; every
//! session builds its own phase list from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use ts_rs::TS;

use crate::event::{
    Event, EventKind, CONFIDENCE_FIELDS, COUNT_FIELDS, DETAIL_FIELDS, INTENT_FIELDS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Active,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    fn is_finished(self) -> bool {
        !matches!(self, StepStatus::Running)
    }
}

/// One entry of the ordered phase template.
#[derive(Debug)]
pub struct PhaseSpec {
    pub kind: EventKind,
    pub label: &'static str,
}

pub static PHASE_TEMPLATE: [PhaseSpec; 6] = [
    PhaseSpec {
        kind: EventKind::Started,
        label: "Request received",
    },
    PhaseSpec {
        kind: EventKind::IntentDetected,
        label: "Understanding intent",
    },
    PhaseSpec {
        kind: EventKind::LlmStarted,
        label: "Generating plan",
    },
    PhaseSpec {
        kind: EventKind::StepsGenerated,
        label: "Structuring steps",
    },
    PhaseSpec {
        kind: EventKind::PlanValidated,
        label: "Validating plan",
    },
    PhaseSpec {
        kind: EventKind::Completed,
        label: "Plan ready",
    },
];

/// Position of `kind` in the phase template, if it is a phase kind.
pub fn phase_index(kind: EventKind) -> Option<usize> {
    PHASE_TEMPLATE.iter().position(|spec| spec.kind == kind)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct PhaseItem {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub label: String,
    pub status: PhaseStatus,
    pub detail: Option<String>,
}

/// Everything the UI renders about one observed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub phases: Vec<PhaseItem>,
    pub current_phase: Option<EventKind>,
    pub error: Option<String>,
    pub is_complete: bool,
    pub is_failed: bool,
    pub intent: Option<String>,
    pub step_count: Option<u64>,
    pub confidence: Option<f64>,
    pub steps: BTreeMap<String, StepStatus>,
    pub checkpoints: Vec<String>,
}

impl Default for Progress {
    fn default() -> Self {
        Self::initial()
    }
}

impl Progress {
    /// Fresh all-pending progress, rebuilt from the template every time.
    pub fn initial() -> Self {
        Self {
            phases: PHASE_TEMPLATE
                .iter()
                .map(|spec| PhaseItem {
                    kind: spec.kind,
                    label: spec.label.to_string(),
                    status: PhaseStatus::Pending,
                    detail: None,
                })
                .collect(),
            current_phase: None,
            error: None,
            is_complete: false,
            is_failed: false,
            intent: None,
            step_count: None,
            confidence: None,
            steps: BTreeMap::new(),
            checkpoints: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.is_complete || self.is_failed
    }

    pub fn phase(&self, kind: EventKind) -> Option<&PhaseItem> {
        self.phases.iter().find(|p| p.kind == kind)
    }

    pub fn active_phase(&self) -> Option<&PhaseItem> {
        self.phases.iter().find(|p| p.status == PhaseStatus::Active)
    }

    pub fn steps_with(&self, status: StepStatus) -> usize {
        self.steps.values().filter(|s| **s == status).count()
    }

    fn advance_to(&mut self, index: usize) {
        for phase in &mut self.phases[..index] {
            if matches!(phase.status, PhaseStatus::Pending | PhaseStatus::Active) {
                phase.status = PhaseStatus::Done;
            }
        }

        let phase = &mut self.phases[index];
        if phase.status == PhaseStatus::Pending {
            phase.status = PhaseStatus::Active;
        }

        let current = self.current_phase.and_then(phase_index);
        if current.is_none_or(|c| index > c) {
            self.current_phase = Some(phase.kind);
        }
    }

    fn complete_remaining(&mut self) {
        for phase in &mut self.phases {
            if matches!(phase.status, PhaseStatus::Pending | PhaseStatus::Active) {
                phase.status = PhaseStatus::Done;
            }
        }
        self.current_phase = Some(EventKind::Completed);
        self.is_complete = true;
    }

    fn fail(&mut self, message: Option<&str>) {
        for phase in &mut self.phases {
            if phase.status == PhaseStatus::Active {
                phase.status = PhaseStatus::Failed;
            }
        }
        self.is_failed = true;
        self.error = Some(message.unwrap_or("Execution failed").to_string());
    }

    fn set_detail(&mut self, kind: EventKind, detail: String) {
        if let Some(phase) = self.phases.iter_mut().find(|p| p.kind == kind) {
            phase.detail = Some(detail);
        }
    }

    fn record_step(&mut self, event: &Event, status: StepStatus) {
        let Some(step_id) = event.step_id() else {
            debug!("Ignoring {} without a step id", event.kind);
            return;
        };

        match self.steps.get(&step_id) {
            Some(existing) if existing.is_finished() => {}
            _ => {
                self.steps.insert(step_id, status);
            }
        }
    }
}

fn format_confidence(raw: f64) -> (f64, String) {
    let fraction = if raw > 1.0 { raw / 100.0 } else { raw };
    (fraction, format!("Confidence {:.0}%", fraction * 100.0))
}

/// Applies the detail-bearing part of a phase event.
fn attach_detail(progress: &mut Progress, event: &Event) {
    match event.kind {
        EventKind::IntentDetected => {
            if let Some(intent) = event.str_field(INTENT_FIELDS) {
                progress.intent = Some(intent.to_string());
                progress.set_detail(EventKind::IntentDetected, intent.to_string());
            }
        }
        EventKind::StepsGenerated => {
            if let Some(count) = event.u64_field(COUNT_FIELDS) {
                progress.step_count = Some(count);
                let noun = if count == 1 { "step" } else { "steps" };
                progress.set_detail(EventKind::StepsGenerated, format!("{} {}", count, noun));
            }
        }
        EventKind::PlanValidated => {
            if let Some(raw) = event.f64_field(CONFIDENCE_FIELDS) {
                let (fraction, detail) = format_confidence(raw);
                progress.confidence = Some(fraction);
                progress.set_detail(EventKind::PlanValidated, detail);
            }
        }
        kind => {
            if let Some(detail) = event.str_field(DETAIL_FIELDS) {
                progress.set_detail(kind, detail.to_string());
            }
        }
    }
}

/// Pure reduction of one event into a new [`Progress`].
///
/// Phases only move forward; once the progress is terminal no phase
/// transitions are applied, only details of phases already reached. Step
/// and checkpoint records keep accumulating because replays of those are
/// harmless.
pub fn reduce(progress: &Progress, event: &Event) -> Progress {
    let mut next = progress.clone();

    match event.kind {
        EventKind::StepStarted => next.record_step(event, StepStatus::Running),
        EventKind::StepCompleted => next.record_step(event, StepStatus::Completed),
        EventKind::StepFailed => next.record_step(event, StepStatus::Failed),
        EventKind::CheckpointCreated => {
            if let Some(id) = event.checkpoint_id() {
                if !next.checkpoints.contains(&id) {
                    next.checkpoints.push(id);
                }
            }
        }
        EventKind::StreamComplete => {}
        // Details never change status, so a milestone that was reached can
        // still learn its detail after the progress turned terminal.
        kind if next.is_terminal() => {
            if next
                .phase(kind)
                .is_some_and(|p| p.status != PhaseStatus::Pending)
            {
                attach_detail(&mut next, event);
            } else {
                debug!("Ignoring {} after terminal state", kind);
            }
        }
        EventKind::FastPath => {
            for phase in &mut next.phases {
                phase.status = PhaseStatus::Done;
            }
            next.current_phase = Some(EventKind::Completed);
            next.is_complete = true;
        }
        EventKind::Completed => {
            attach_detail(&mut next, event);
            next.complete_remaining();
        }
        EventKind::Failed | EventKind::Error => next.fail(event.message()),
        EventKind::LlmRetry => {
            let attempt = event.u64_field(&["attempt", "retry"]).unwrap_or(1);
            let detail = match event.u64_field(&["max", "max_attempts", "maxAttempts"]) {
                Some(max) => format!("Retry {}/{}", attempt, max),
                None => format!("Retry {}", attempt),
            };
            next.set_detail(EventKind::LlmStarted, detail);
        }
        kind => match phase_index(kind) {
            Some(index) => {
                next.advance_to(index);
                attach_detail(&mut next, event);
            }
            None => debug!("No phase mapping for {}", kind),
        },
    }

    next
}
