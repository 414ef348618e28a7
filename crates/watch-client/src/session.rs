//! Watch sessions
//!
//! A session observes one execution. Its loop is the only consumer of
//! transport updates, poll snapshots and caller commands, so progress,
//! connection state and the seen set have a single owner.
//!
//! Every update carries the epoch it was produced under. `reset` and
//! `disconnect` bump the shared epoch synchronously on the handle, so any
//! update still in flight from an older connection is discarded on arrival.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::api::SnapshotSource;
use crate::config::WatchConfig;
use crate::decoder::Frame;
use crate::dedup::{Applied, ProgressTracker};
use crate::event::{Event, EventKind};
use crate::phases::{PhaseItem, Progress};
use crate::poller::{PollEvent, PollUpdate, PollingCoordinator};
use crate::reconnect::ReconnectPolicy;
use crate::transport::{
    self, ConnectionHandle, ConnectionState, EndReason, Transport, TransportEvent, TransportUpdate,
};
use crate::types::ExecutionStatus;

/// UI-facing callbacks. Every method defaults to a no-op.
pub trait ExecutionObserver: Send + Sync {
    fn on_step_started(&self, _step_id: &str, _event: &Event) {}

    fn on_step_completed(&self, _step_id: &str, _event: &Event) {}

    fn on_step_failed(&self, _step_id: &str, _error: Option<&str>, _event: &Event) {}

    fn on_checkpoint_created(&self, _checkpoint_id: &str, _event: &Event) {}

    /// A phase changed status or detail.
    fn on_phase_changed(&self, _phase: &PhaseItem) {}

    /// The server closed the stream on purpose.
    fn on_stream_ended(&self) {}

    fn on_error(&self, _message: &str) {}

    fn on_connection_state(&self, _state: ConnectionState) {}

    fn on_progress(&self, _progress: &Progress) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("{}", exhausted_message(.attempts, .not_found, .last_error))]
    TransportExhausted {
        attempts: u32,
        not_found: bool,
        last_error: String,
    },

    #[error("Watch session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn exhausted_message(attempts: &u32, not_found: &bool, last_error: &str) -> String {
    if *not_found {
        format!(
            "Execution not found after {} attempts; it may never have started",
            attempts
        )
    } else {
        format!(
            "Lost connection after {} attempts: {}",
            attempts, last_error
        )
    }
}

impl WatchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, WatchError::TransportExhausted { not_found: true, .. })
    }
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Reset { epoch: u64 },
    Disconnect { epoch: u64 },
}

/// Starts watch sessions with a shared transport, snapshot source and
/// observer.
#[derive(Clone)]
pub struct Watcher {
    transport: Arc<dyn Transport>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    config: WatchConfig,
    observer: Arc<dyn ExecutionObserver>,
}

impl Watcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            snapshots: None,
            config: WatchConfig::default(),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_snapshots(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.snapshots = Some(source);
        self
    }

    pub fn with_config(mut self, config: WatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Starts observing `execution_id`. `initial_status` decides whether the
    /// poller has anything to do.
    pub fn watch(
        &self,
        execution_id: impl Into<String>,
        initial_status: ExecutionStatus,
    ) -> WatchHandle {
        let execution_id = execution_id.into();
        let epoch = Arc::new(AtomicU64::new(0));
        let root = CancellationToken::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = watch::channel(Progress::initial());
        let (connection_tx, connection_rx) = watch::channel(ConnectionState::Idle);

        let (session, channels) = WatchSession::new(
            self,
            execution_id.clone(),
            initial_status,
            epoch.clone(),
            progress_tx,
            connection_tx,
            root.clone(),
        );

        let span = info_span!("watch", execution = %execution_id, session = %Uuid::new_v4());
        let task = tokio::spawn(session.run(command_rx, channels).instrument(span));

        WatchHandle {
            execution_id,
            epoch,
            commands: command_tx,
            progress: progress_rx,
            connection: connection_rx,
            root,
            task: Some(task),
        }
    }
}

/// Caller's end of a running session. Dropping it cancels the session and
/// every task it started.
#[derive(Debug)]
pub struct WatchHandle {
    execution_id: String,
    epoch: Arc<AtomicU64>,
    commands: mpsc::UnboundedSender<Command>,
    progress: watch::Receiver<Progress>,
    connection: watch::Receiver<ConnectionState>,
    root: CancellationToken,
    task: Option<JoinHandle<Result<Progress, WatchError>>>,
}

impl WatchHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Starts over: fresh progress, fresh seen set, new connection.
    pub fn reset(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.commands.send(Command::Reset { epoch });
    }

    /// Stops observing. The session ends with the progress seen so far.
    pub fn disconnect(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.commands.send(Command::Disconnect { epoch });
    }

    /// Waits for the session to end and returns its final progress.
    pub async fn wait(mut self) -> Result<Progress, WatchError> {
        match self.task.take() {
            Some(task) => task.await?,
            None => Ok(self.progress()),
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

struct Channels {
    transport_rx: mpsc::Receiver<TransportUpdate>,
    poll_rx: mpsc::Receiver<PollUpdate>,
}

struct WatchSession {
    execution_id: String,
    initial_status: ExecutionStatus,
    transport: Arc<dyn Transport>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    config: WatchConfig,
    observer: Arc<dyn ExecutionObserver>,
    epoch: Arc<AtomicU64>,
    tracker: ProgressTracker,
    progress_tx: watch::Sender<Progress>,
    connection_tx: watch::Sender<ConnectionState>,
    root: CancellationToken,
    /// Parent of the current connection and poller; replaced on reset.
    generation: CancellationToken,
    connection: Option<ConnectionHandle>,
    transport_tx: mpsc::Sender<TransportUpdate>,
    poll_tx: mpsc::Sender<PollUpdate>,
    transport_active: bool,
    polling_active: bool,
    exhausted: Option<WatchError>,
}

impl WatchSession {
    fn new(
        watcher: &Watcher,
        execution_id: String,
        initial_status: ExecutionStatus,
        epoch: Arc<AtomicU64>,
        progress_tx: watch::Sender<Progress>,
        connection_tx: watch::Sender<ConnectionState>,
        root: CancellationToken,
    ) -> (Self, Channels) {
        let (transport_tx, transport_rx) = mpsc::channel(64);
        let (poll_tx, poll_rx) = mpsc::channel(16);

        let session = Self {
            execution_id,
            initial_status,
            transport: watcher.transport.clone(),
            snapshots: watcher.snapshots.clone(),
            config: watcher.config.clone(),
            observer: watcher.observer.clone(),
            epoch,
            tracker: ProgressTracker::new(),
            progress_tx,
            connection_tx,
            generation: root.child_token(),
            root,
            connection: None,
            transport_tx,
            poll_tx,
            transport_active: false,
            polling_active: false,
            exhausted: None,
        };

        (
            session,
            Channels {
                transport_rx,
                poll_rx,
            },
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut channels: Channels,
    ) -> Result<Progress, WatchError> {
        info!("Watching execution {}", self.execution_id);
        self.start();

        let root = self.root.clone();
        while !self.finished() {
            tokio::select! {
                biased;
                _ = root.cancelled() => {
                    debug!("Watch handle dropped");
                    break;
                }
                Some(command) = commands.recv() => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Some(update) = channels.transport_rx.recv() => self.handle_transport(update),
                Some(update) = channels.poll_rx.recv() => self.handle_poll(update),
                else => break,
            }
        }

        self.stop();
        self.finish()
    }

    fn finished(&self) -> bool {
        self.tracker.progress().is_terminal() || (!self.transport_active && !self.polling_active)
    }

    fn start(&mut self) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.generation = self.root.child_token();

        self.connection = Some(transport::connect(
            self.transport.clone(),
            self.execution_id.clone(),
            ReconnectPolicy::new(self.config.reconnect),
            epoch,
            self.transport_tx.clone(),
            self.generation.child_token(),
        ));
        self.transport_active = true;

        self.polling_active = match &self.snapshots {
            Some(source) if self.config.polling => {
                PollingCoordinator::new(self.config.poll_interval()).spawn(
                    source.clone(),
                    self.execution_id.clone(),
                    self.initial_status,
                    epoch,
                    self.poll_tx.clone(),
                    self.generation.child_token(),
                );
                true
            }
            _ => false,
        };
    }

    fn stop(&mut self) {
        self.generation.cancel();
        self.connection = None;
        self.transport_active = false;
        self.polling_active = false;

        if matches!(
            *self.connection_tx.borrow(),
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            self.set_connection(ConnectionState::Closed);
        }
    }

    fn finish(self) -> Result<Progress, WatchError> {
        let progress = self.tracker.progress().clone();
        if progress.is_terminal() {
            return Ok(progress);
        }
        match self.exhausted {
            Some(e) => Err(e),
            None => Ok(progress),
        }
    }

    fn is_stale(&self, epoch: u64) -> bool {
        epoch != self.epoch.load(Ordering::SeqCst)
    }

    /// Returns false when the session should end.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Reset { epoch } => {
                info!("Resetting watch of {} (epoch {})", self.execution_id, epoch);
                self.stop();
                self.tracker.reset();
                self.exhausted = None;
                self.publish();
                self.set_connection(ConnectionState::Idle);
                self.start();
                true
            }
            Command::Disconnect { epoch } => {
                info!("Disconnecting from {} (epoch {})", self.execution_id, epoch);
                false
            }
        }
    }

    fn handle_transport(&mut self, update: TransportUpdate) {
        if self.is_stale(update.epoch) {
            debug!("Dropping transport update from stale epoch {}", update.epoch);
            return;
        }

        match update.event {
            TransportEvent::State(state) => self.set_connection(state),
            TransportEvent::Frame(Frame::Event(event)) => self.apply(&event),
            TransportEvent::Frame(Frame::Complete) => {
                info!("Server completed the stream for {}", self.execution_id);
                self.observer.on_stream_ended();
            }
            TransportEvent::Ended(EndReason::Exhausted {
                attempts,
                not_found,
                last_error,
            }) => {
                self.transport_active = false;
                let e = WatchError::TransportExhausted {
                    attempts,
                    not_found,
                    last_error,
                };
                if self.polling_active {
                    warn!("{}; continuing on snapshot polling", e);
                } else {
                    error!("{}", e);
                }
                self.observer.on_error(&e.to_string());
                self.exhausted = Some(e);
            }
            TransportEvent::Ended(reason) => {
                debug!("Transport ended: {:?}", reason);
                self.transport_active = false;
            }
        }
    }

    fn handle_poll(&mut self, update: PollUpdate) {
        if self.is_stale(update.epoch) {
            debug!("Dropping snapshot from stale epoch {}", update.epoch);
            return;
        }

        match update.event {
            PollEvent::Snapshot(snapshot) => {
                for event in snapshot.to_events() {
                    self.apply(&event);
                }
            }
            PollEvent::Finished(outcome) => {
                debug!("Poller finished: {:?}", outcome);
                self.polling_active = false;
            }
        }
    }

    fn apply(&mut self, event: &Event) {
        let before = self.tracker.progress().clone();
        if self.tracker.apply(event) == Applied::Duplicate {
            return;
        }
        let after = self.tracker.progress().clone();

        if let Some(step_id) = event.step_id() {
            if before.steps.get(&step_id) != after.steps.get(&step_id) {
                match event.kind {
                    EventKind::StepStarted => self.observer.on_step_started(&step_id, event),
                    EventKind::StepCompleted => self.observer.on_step_completed(&step_id, event),
                    EventKind::StepFailed => {
                        self.observer
                            .on_step_failed(&step_id, event.message(), event)
                    }
                    _ => {}
                }
            }
        }
        if event.kind == EventKind::CheckpointCreated {
            if let Some(id) = event.checkpoint_id() {
                if !before.checkpoints.contains(&id) {
                    self.observer.on_checkpoint_created(&id, event);
                }
            }
        }

        for (old, new) in before.phases.iter().zip(&after.phases) {
            if old != new {
                self.observer.on_phase_changed(new);
            }
        }

        if after.is_failed && !before.is_failed {
            let message = after.error.as_deref().unwrap_or("Execution failed");
            warn!("Execution {} failed: {}", self.execution_id, message);
            self.observer.on_error(message);
        }
        if after.is_complete && !before.is_complete {
            info!("Execution {} complete", self.execution_id);
        }

        self.publish();
    }

    fn publish(&self) {
        let progress = self.tracker.progress().clone();
        self.observer.on_progress(&progress);
        self.progress_tx.send_replace(progress);
    }

    fn set_connection(&self, state: ConnectionState) {
        debug!("Connection state: {}", state);
        self.connection_tx.send_replace(state);
        self.observer.on_connection_state(state);
    }
}
