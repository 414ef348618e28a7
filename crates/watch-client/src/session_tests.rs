//! End-to-end tests for watch sessions over scripted transports and
//! snapshot sources.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::ApiError;
use crate::config::WatchConfig;
use crate::decoder::Frame;
use crate::dedup::ProgressTracker;
use crate::event::{Event, EventKind};
use crate::phases::{PhaseItem, PhaseStatus, Progress, StepStatus};
use crate::poller::testing::ScriptedSnapshots;
use crate::session::{ExecutionObserver, Watcher};
use crate::transport::testing::{Attempt, ScriptedTransport};
use crate::transport::{ConnectionState, TransportError};
use crate::types::{ExecutionStatus, Snapshot, StepSnapshot};

#[derive(Default)]
struct RecordingObserver {
    calls: Mutex<Vec<String>>,
    states: Mutex<Vec<ConnectionState>>,
}

impl RecordingObserver {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    fn states(&self) -> Vec<ConnectionState> {
        self.states.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ExecutionObserver for RecordingObserver {
    fn on_step_started(&self, step_id: &str, _event: &Event) {
        self.record(format!("step_started:{}", step_id));
    }

    fn on_step_completed(&self, step_id: &str, _event: &Event) {
        self.record(format!("step_completed:{}", step_id));
    }

    fn on_checkpoint_created(&self, checkpoint_id: &str, _event: &Event) {
        self.record(format!("checkpoint:{}", checkpoint_id));
    }

    fn on_phase_changed(&self, phase: &PhaseItem) {
        self.record(format!("phase:{}", phase.kind));
    }

    fn on_error(&self, message: &str) {
        self.record(format!("error:{}", message));
    }

    fn on_connection_state(&self, state: ConnectionState) {
        self.states.lock().unwrap().push(state);
    }
}

fn config() -> WatchConfig {
    WatchConfig::default()
}

fn frames(events: &[Event]) -> Vec<Frame> {
    events.iter().cloned().map(Frame::Event).collect()
}

fn reduce_all(events: &[Event]) -> Progress {
    let mut tracker = ProgressTracker::new();
    for event in events {
        tracker.apply(event);
    }
    tracker.progress().clone()
}

fn planning_run() -> Vec<Event> {
    vec![
        Event::new(EventKind::Started),
        Event::new(EventKind::IntentDetected).with("intent", "billing"),
        Event::new(EventKind::LlmStarted),
        Event::new(EventKind::LlmRetry).with("attempt", 1).with("max", 3),
        Event::new(EventKind::StepsGenerated).with("count", 4),
        Event::new(EventKind::Completed),
    ]
}

/// Events a snapshot can express, for comparing stream and poll paths.
fn execution_run() -> Vec<Event> {
    vec![
        Event::new(EventKind::Started),
        Event::new(EventKind::IntentDetected).with("intent", "billing"),
        Event::new(EventKind::LlmStarted),
        Event::new(EventKind::StepsGenerated).with("count", 3),
        Event::new(EventKind::StepStarted).with("step_id", "s1"),
        Event::new(EventKind::StepCompleted).with("step_id", "s1"),
        Event::new(EventKind::CheckpointCreated).with("checkpoint_id", "c1"),
        Event::new(EventKind::Completed),
    ]
}

fn snapshot(
    status: ExecutionStatus,
    phase: &str,
    steps: Vec<(&str, StepStatus)>,
) -> Result<Snapshot, ApiError> {
    let mut snapshot = Snapshot::new("exec-1", status);
    snapshot.phase = Some(phase.to_string());
    snapshot.intent = Some("billing".to_string());
    if phase != "intent_detected" {
        snapshot.step_count = Some(3);
    }
    snapshot.steps = steps
        .into_iter()
        .map(|(id, status)| StepSnapshot {
            id: id.to_string(),
            status,
            error: None,
        })
        .collect();
    if status == ExecutionStatus::Completed {
        snapshot.checkpoints = vec!["c1".to_string()];
    }
    Ok(snapshot)
}

fn completed_snapshot() -> Result<Snapshot, ApiError> {
    snapshot(
        ExecutionStatus::Completed,
        "completed",
        vec![("s1", StepStatus::Completed)],
    )
}

#[tokio::test(start_paused = true)]
async fn test_straight_run_over_stream() {
    let mut script = frames(&planning_run());
    script.push(Frame::Complete);
    let transport = ScriptedTransport::new(vec![Attempt::serve(script)]);

    let handle = Watcher::new(transport.clone())
        .with_config(config())
        .watch("exec-1", ExecutionStatus::Planning);
    let progress = handle.wait().await.unwrap();

    assert!(progress.phases.iter().all(|p| p.status == PhaseStatus::Done));
    assert_eq!(
        progress.phase(EventKind::LlmStarted).unwrap().detail.as_deref(),
        Some("Retry 1/3")
    );
    assert!(progress.is_complete);
    assert_eq!(transport.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_drop_after_llm_started_then_replay() {
    let first = planning_run()[..3].to_vec();
    let mut replay = planning_run();
    replay.insert(5, Event::new(EventKind::StepStarted).with("step_id", "s1"));
    replay.insert(6, Event::new(EventKind::StepCompleted).with("step_id", "s1"));

    let transport = ScriptedTransport::new(vec![
        Attempt::serve(frames(&first)),
        Attempt::serve(frames(&replay)),
    ]);
    let observer = Arc::new(RecordingObserver::default());

    let handle = Watcher::new(transport.clone())
        .with_config(config())
        .with_observer(observer.clone())
        .watch("exec-1", ExecutionStatus::Planning);
    let progress = handle.wait().await.unwrap();

    assert_eq!(progress, reduce_all(&replay));
    assert_eq!(
        progress.phase(EventKind::LlmStarted).unwrap().detail.as_deref(),
        Some("Retry 1/3")
    );
    assert!(progress.is_complete);
    assert_eq!(transport.opened(), 2);

    assert_eq!(observer.count("step_started:s1"), 1);
    assert_eq!(observer.count("step_completed:s1"), 1);
    assert_eq!(observer.count("phase:intent_detected"), 2);
    assert_eq!(
        observer.states()[..5],
        [
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closed,
            ConnectionState::Connecting,
            ConnectionState::Open,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stream_poll_and_interleaved_converge() {
    let events = execution_run();
    let expected = reduce_all(&events);

    // Stream only
    let mut script = frames(&events);
    script.push(Frame::Complete);
    let stream_only = Watcher::new(ScriptedTransport::new(vec![Attempt::serve(script)]))
        .with_config(config())
        .watch("exec-1", ExecutionStatus::Running)
        .wait()
        .await
        .unwrap();
    assert_eq!(stream_only, expected);

    // Poll only, over a connection that never says anything
    let snapshots = ScriptedSnapshots::new(vec![
        snapshot(ExecutionStatus::Planning, "intent_detected", vec![]),
        snapshot(
            ExecutionStatus::Running,
            "steps_generated",
            vec![("s1", StepStatus::Running)],
        ),
        completed_snapshot(),
    ]);
    let poll_only = Watcher::new(ScriptedTransport::new(vec![Attempt::serve_then_hang(vec![])]))
        .with_config(config())
        .with_snapshots(snapshots.clone())
        .watch("exec-1", ExecutionStatus::Running)
        .wait()
        .await
        .unwrap();
    assert_eq!(poll_only, expected);
    assert_eq!(snapshots.fetches(), 3);

    // Stream delivers the first half, a poll delivers the rest
    let interleaved = Watcher::new(ScriptedTransport::new(vec![Attempt::serve_then_hang(
        frames(&events[..5]),
    )]))
    .with_config(config())
    .with_snapshots(ScriptedSnapshots::new(vec![completed_snapshot()]))
    .watch("exec-1", ExecutionStatus::Running)
    .wait()
    .await
    .unwrap();
    assert_eq!(interleaved, expected);
}

#[tokio::test(start_paused = true)]
async fn test_bare_snapshot_polled_before_stream_keeps_details() {
    let events = execution_run();
    let expected = reduce_all(&events);

    // Names the phase reached but none of its details.
    let mut bare = Snapshot::new("exec-1", ExecutionStatus::Running);
    bare.phase = Some("steps_generated".to_string());

    let mut config = config();
    config.poll_interval_secs = 1;

    // The first attempt is refused, so the poll at 1s lands before the
    // stream reconnects at 2s.
    let mut script = frames(&events);
    script.push(Frame::Complete);
    let snapshots = ScriptedSnapshots::new(vec![Ok(bare)]);
    let progress = Watcher::new(ScriptedTransport::new(vec![
        Attempt::Refuse(TransportError::Timeout),
        Attempt::serve(script),
    ]))
    .with_config(config)
    .with_snapshots(snapshots.clone())
    .watch("exec-1", ExecutionStatus::Running)
    .wait()
    .await
    .unwrap();

    assert!(snapshots.fetches() >= 1);
    assert_eq!(progress, expected);
    assert_eq!(progress.step_count, Some(3));
    assert_eq!(progress.intent.as_deref(), Some("billing"));
    assert_eq!(
        progress.phase(EventKind::StepsGenerated).unwrap().detail.as_deref(),
        Some("3 steps")
    );
}

#[tokio::test(start_paused = true)]
async fn test_polling_carries_on_after_transport_gives_up() {
    let mut script: Vec<_> = (0..7)
        .map(|_| snapshot(ExecutionStatus::Running, "llm_started", vec![]))
        .collect();
    script.push(completed_snapshot());
    let snapshots = ScriptedSnapshots::new(script);
    let transport = ScriptedTransport::new(Vec::new());
    let observer = Arc::new(RecordingObserver::default());

    let started = tokio::time::Instant::now();
    let progress = Watcher::new(transport.clone())
        .with_config(config())
        .with_snapshots(snapshots.clone())
        .with_observer(observer.clone())
        .watch("exec-1", ExecutionStatus::Running)
        .wait()
        .await
        .unwrap();

    assert!(progress.is_complete);
    assert_eq!(transport.opened(), 5);
    assert_eq!(snapshots.fetches(), 8);
    assert_eq!(started.elapsed(), Duration::from_secs(40));
    assert!(observer
        .calls()
        .iter()
        .any(|c| c.starts_with("error:") && c.contains("may never have started")));
    assert_eq!(observer.states().last(), Some(&ConnectionState::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_without_polling_ends_session() {
    let transport = ScriptedTransport::new(Vec::new());
    let mut config = config();
    config.polling = false;

    let result = Watcher::new(transport.clone())
        .with_config(config)
        .with_snapshots(ScriptedSnapshots::new(vec![completed_snapshot()]))
        .watch("ghost", ExecutionStatus::Pending)
        .wait()
        .await;

    let err = result.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(transport.opened(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_application_error_fails_the_session() {
    let transport = ScriptedTransport::new(vec![Attempt::serve(vec![
        Frame::Event(Event::new(EventKind::Started)),
        Frame::Event(Event::new(EventKind::LlmStarted)),
        Frame::Event(Event::new(EventKind::Error).with("message", "planner crashed")),
    ])]);
    let observer = Arc::new(RecordingObserver::default());

    let progress = Watcher::new(transport.clone())
        .with_observer(observer.clone())
        .watch("exec-1", ExecutionStatus::Planning)
        .wait()
        .await
        .unwrap();

    assert!(progress.is_failed);
    assert_eq!(progress.error.as_deref(), Some("planner crashed"));
    assert_eq!(
        progress.phase(EventKind::LlmStarted).unwrap().status,
        PhaseStatus::Failed
    );
    assert_eq!(observer.count("error:planner crashed"), 1);
    assert_eq!(transport.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reset_starts_a_fresh_epoch() {
    let transport = ScriptedTransport::new(vec![
        Attempt::serve_then_hang(frames(&planning_run()[..2])),
        Attempt::serve_then_hang(frames(&planning_run()[..1])),
    ]);
    let handle = Watcher::new(transport.clone()).watch("exec-1", ExecutionStatus::Planning);
    let mut progress = handle.subscribe_progress();

    progress
        .wait_for(|p| p.current_phase == Some(EventKind::IntentDetected))
        .await
        .unwrap();
    assert_eq!(handle.epoch(), 0);

    handle.reset();
    assert_eq!(handle.epoch(), 1);

    progress
        .wait_for(|p| p.current_phase == Some(EventKind::Started))
        .await
        .unwrap();
    let current = handle.progress();
    assert_eq!(
        current.phase(EventKind::IntentDetected).unwrap().status,
        PhaseStatus::Pending
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.opened(), 2);
    assert_eq!(transport.live(), 1);

    handle.disconnect();
    let last = handle.wait().await.unwrap();
    assert!(!last.is_terminal());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_ends_with_current_progress() {
    let transport = ScriptedTransport::new(vec![
        Attempt::serve_then_hang(frames(&planning_run()[..1])),
        Attempt::serve(vec![Frame::Complete]),
    ]);
    let handle = Watcher::new(transport.clone()).watch("exec-1", ExecutionStatus::Planning);
    let mut connection = handle.subscribe_connection();
    let mut progress = handle.subscribe_progress();

    connection
        .wait_for(|s| *s == ConnectionState::Open)
        .await
        .unwrap();
    progress
        .wait_for(|p| p.current_phase == Some(EventKind::Started))
        .await
        .unwrap();

    handle.disconnect();
    let final_progress = handle.wait().await.unwrap();

    assert_eq!(final_progress.current_phase, Some(EventKind::Started));
    assert_eq!(*connection.borrow(), ConnectionState::Closed);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.opened(), 1);
    assert_eq!(transport.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handle_releases_connection() {
    let transport = ScriptedTransport::new(vec![Attempt::serve_then_hang(vec![])]);
    let handle = Watcher::new(transport.clone()).watch("exec-1", ExecutionStatus::Planning);
    let mut connection = handle.subscribe_connection();

    connection
        .wait_for(|s| *s == ConnectionState::Open)
        .await
        .unwrap();
    assert_eq!(transport.live(), 1);

    drop(handle);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.live(), 0);
}
