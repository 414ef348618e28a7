//! Idempotent event application
//!
//! Events may arrive twice (reconnect replay, stream and poll reporting the
//! same thing) or out of order. The seen set records what has already been
//! applied so a replay is discarded before it reaches the reducer.
//!
//! A milestone seen without its detail is recorded apart from one that
//! carried it. A detail-bearing copy that arrives later is still applied, so
//! a bare snapshot milestone never hides the detail the stream reports.

use std::collections::HashSet;

use tracing::debug;

use crate::event::{DedupKey, Event};
use crate::phases::{reduce, Progress};

/// Keys of every event applied in one session.
#[derive(Debug, Default, Clone)]
pub struct SeenEventSet {
    keys: HashSet<DedupKey>,
    /// Milestones applied only without their detail.
    partial: HashSet<DedupKey>,
}

impl SeenEventSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.keys.contains(key) || self.partial.contains(key)
    }

    /// Records a fully applied event. Returns false when it was already
    /// applied with its detail.
    pub fn insert(&mut self, key: DedupKey) -> bool {
        self.partial.remove(&key);
        self.keys.insert(key)
    }

    /// Records an event applied without its detail. Returns false when any
    /// copy was already applied.
    pub fn insert_partial(&mut self, key: DedupKey) -> bool {
        !self.keys.contains(&key) && self.partial.insert(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len() + self.partial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.partial.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.partial.clear();
    }
}

/// Applies `event` unless an equivalent one was already seen. The key is
/// recorded before reducing.
pub fn apply_event(event: &Event, seen: &mut SeenEventSet, progress: &Progress) -> Option<Progress> {
    if let Some(key) = event.dedup_key() {
        let fresh = if event.lacks_detail() {
            seen.insert_partial(key)
        } else {
            seen.insert(key)
        };
        if !fresh {
            debug!("Discarding replayed {} event", event.kind);
            return None;
        }
    }

    Some(reduce(progress, event))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Accepted,
    Duplicate,
}

/// Seen set and derived progress for one session.
#[derive(Debug, Default, Clone)]
pub struct ProgressTracker {
    seen: SeenEventSet,
    progress: Progress,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn seen(&self) -> &SeenEventSet {
        &self.seen
    }

    pub fn apply(&mut self, event: &Event) -> Applied {
        match apply_event(event, &mut self.seen, &self.progress) {
            Some(next) => {
                self.progress = next;
                Applied::Accepted
            }
            None => Applied::Duplicate,
        }
    }

    /// Forgets everything; the next event starts a fresh session.
    pub fn reset(&mut self) {
        self.seen.clear();
        self.progress = Progress::initial();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::phases::PhaseStatus;
    use crate::types::{ExecutionStatus, Snapshot};

    fn straight_run() -> Vec<Event> {
        vec![
            Event::new(EventKind::Started),
            Event::new(EventKind::IntentDetected).with("intent", "billing"),
            Event::new(EventKind::LlmStarted),
            Event::new(EventKind::StepsGenerated).with("count", 3),
            Event::new(EventKind::StepStarted).with("step_id", "s1"),
            Event::new(EventKind::StepCompleted).with("step_id", "s1"),
            Event::new(EventKind::CheckpointCreated).with("checkpoint_id", "c1"),
            Event::new(EventKind::PlanValidated).with("confidence", 0.9),
            Event::new(EventKind::Completed),
        ]
    }

    #[test]
    fn test_second_application_is_discarded() {
        let mut seen = SeenEventSet::new();
        let event = Event::new(EventKind::IntentDetected).with("intent", "billing");

        let once = apply_event(&event, &mut seen, &Progress::initial()).unwrap();
        assert_eq!(apply_event(&event, &mut seen, &once), None);
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_llm_retry_applies_every_time() {
        let mut tracker = ProgressTracker::new();
        let retry = Event::new(EventKind::LlmRetry).with("attempt", 1).with("max", 3);

        assert_eq!(tracker.apply(&retry), Applied::Accepted);
        assert_eq!(tracker.apply(&retry), Applied::Accepted);
        assert!(tracker.seen().is_empty());
    }

    #[test]
    fn test_replaying_prefix_is_a_no_op() {
        let events = straight_run();
        let mut once = ProgressTracker::new();
        for event in &events {
            once.apply(event);
        }

        for split in 0..events.len() {
            let mut replayed = ProgressTracker::new();
            for event in &events[..split] {
                replayed.apply(event);
            }
            for event in &events[..split] {
                assert_eq!(replayed.apply(event), Applied::Duplicate);
            }
            for event in &events[split..] {
                replayed.apply(event);
            }
            assert_eq!(replayed.progress(), once.progress(), "split at {}", split);
        }
    }

    #[test]
    fn test_distinct_steps_are_not_collapsed() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(
            tracker.apply(&Event::new(EventKind::StepStarted).with("step_id", "a")),
            Applied::Accepted
        );
        assert_eq!(
            tracker.apply(&Event::new(EventKind::StepStarted).with("step_id", "b")),
            Applied::Accepted
        );
        assert_eq!(
            tracker.apply(&Event::new(EventKind::StepStarted).with("step_id", "a")),
            Applied::Duplicate
        );
        assert_eq!(tracker.progress().steps.len(), 2);
    }

    #[test]
    fn test_reset_clears_seen_and_progress() {
        let mut tracker = ProgressTracker::new();
        tracker.apply(&Event::new(EventKind::Started));
        assert_eq!(
            tracker.progress().phases[0].status,
            PhaseStatus::Active
        );

        tracker.reset();
        assert!(tracker.seen().is_empty());
        assert_eq!(tracker.progress(), &Progress::initial());
        assert_eq!(tracker.apply(&Event::new(EventKind::Started)), Applied::Accepted);
    }

    fn converge(first: &[Event], then: &[Event]) -> Progress {
        let mut tracker = ProgressTracker::new();
        for event in first.iter().chain(then) {
            tracker.apply(event);
        }
        tracker.progress().clone()
    }

    #[test]
    fn test_bare_snapshot_milestone_keeps_stream_detail() {
        let mut snapshot = Snapshot::new("exec-1", ExecutionStatus::Running);
        snapshot.phase = Some("steps_generated".into());
        let polled = snapshot.to_events();
        let streamed = straight_run();

        let stream_only = converge(&streamed, &[]);
        let poll_first = converge(&polled, &streamed);
        let stream_first = converge(&streamed, &polled);

        assert_eq!(poll_first, stream_only);
        assert_eq!(stream_first, stream_only);
        assert_eq!(poll_first.step_count, Some(3));
        assert_eq!(poll_first.intent.as_deref(), Some("billing"));
        assert_eq!(
            poll_first.phase(EventKind::StepsGenerated).unwrap().detail.as_deref(),
            Some("3 steps")
        );
    }

    #[test]
    fn test_terminal_snapshot_before_stream_still_learns_details() {
        let snapshot = Snapshot::new("exec-1", ExecutionStatus::Completed);
        let polled = snapshot.to_events();
        let streamed = straight_run();

        let poll_first = converge(&polled, &streamed);
        assert_eq!(poll_first, converge(&streamed, &polled));
        assert_eq!(poll_first.confidence, Some(0.9));
        assert_eq!(
            poll_first.phase(EventKind::PlanValidated).unwrap().detail.as_deref(),
            Some("Confidence 90%")
        );
    }

    #[test]
    fn test_bare_copy_after_detailed_one_is_a_duplicate() {
        let mut tracker = ProgressTracker::new();
        let detailed = Event::new(EventKind::StepsGenerated).with("count", 4);
        let bare = Event::new(EventKind::StepsGenerated);

        assert_eq!(tracker.apply(&bare), Applied::Accepted);
        assert_eq!(tracker.apply(&bare), Applied::Duplicate);
        assert_eq!(tracker.apply(&detailed), Applied::Accepted);
        assert_eq!(tracker.apply(&bare), Applied::Duplicate);
        assert_eq!(tracker.apply(&detailed), Applied::Duplicate);
        assert_eq!(tracker.seen().len(), 1);
        assert_eq!(tracker.progress().step_count, Some(4));
    }
}
