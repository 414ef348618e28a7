//! Streaming transports and the shared connection driver
//!
//! A [`Transport`] only knows how to open one connection attempt and turn it
//! into a stream of frames. Reconnection, connection-state reporting and
//! cancellation live in [`connect`], which both transports share.

pub mod sse;
pub mod websocket;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ts_rs::TS;

use crate::decoder::Frame;
use crate::reconnect::{ReconnectDecision, ReconnectPolicy};

pub use sse::SseTransport;
pub use websocket::WebSocketTransport;

/// Frames of one connection attempt. Dropping it closes the connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Execution {id} not found")]
    NotFound { id: String },

    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Connection attempt timed out")]
    Timeout,

    #[error("Stream ended without a completion marker")]
    UnexpectedEnd,
}

/// Opens connection attempts for one transport flavour.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn open(&self, execution_id: &str) -> Result<FrameStream, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a connection driver stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Completion marker or application error.
    Finished,
    /// Caller disconnect, or the session went away.
    Disconnected,
    /// The reconnection policy gave up.
    Exhausted {
        attempts: u32,
        not_found: bool,
        last_error: String,
    },
}

#[derive(Debug)]
pub enum TransportEvent {
    State(ConnectionState),
    Frame(Frame),
    /// Last event of every driver.
    Ended(EndReason),
}

/// A driver event tagged with the session epoch it was produced under.
#[derive(Debug)]
pub struct TransportUpdate {
    pub epoch: u64,
    pub event: TransportEvent,
}

/// Handle to a running connection driver.
///
/// Disconnecting (or dropping the handle) is terminal: the driver never
/// reconnects afterwards.
#[derive(Debug)]
pub struct ConnectionHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the driver task to wind down.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Connection driver task failed: {}", e);
            }
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum AttemptOutcome {
    /// Completion marker or application error; stop without reconnecting.
    Finished,
    Cancelled,
    Failed(TransportError),
}

struct Driver {
    transport: Arc<dyn Transport>,
    execution_id: String,
    policy: ReconnectPolicy,
    epoch: u64,
    sink: mpsc::Sender<TransportUpdate>,
    cancel: CancellationToken,
}

/// Starts driving connection attempts for `execution_id` until the stream
/// completes, the policy gives up, or `cancel` fires.
pub fn connect(
    transport: Arc<dyn Transport>,
    execution_id: impl Into<String>,
    policy: ReconnectPolicy,
    epoch: u64,
    sink: mpsc::Sender<TransportUpdate>,
    cancel: CancellationToken,
) -> ConnectionHandle {
    let driver = Driver {
        transport,
        execution_id: execution_id.into(),
        policy,
        epoch,
        sink,
        cancel: cancel.clone(),
    };

    ConnectionHandle {
        cancel,
        task: Some(tokio::spawn(driver.run())),
    }
}

impl Driver {
    async fn emit(&self, event: TransportEvent) -> bool {
        self.sink
            .send(TransportUpdate {
                epoch: self.epoch,
                event,
            })
            .await
            .is_ok()
    }

    async fn run(mut self) {
        let reason = self.drive().await;
        self.emit(TransportEvent::Ended(reason)).await;
    }

    async fn drive(&mut self) -> EndReason {
        loop {
            if self.cancel.is_cancelled() {
                return EndReason::Disconnected;
            }

            info!(
                "Connecting to execution {} over {} (attempt {})",
                self.execution_id,
                self.transport.name(),
                self.policy.failures() + 1
            );
            if !self.emit(TransportEvent::State(ConnectionState::Connecting)).await {
                return EndReason::Disconnected;
            }

            let outcome = self.attempt().await;
            if !self.emit(TransportEvent::State(ConnectionState::Closed)).await {
                return EndReason::Disconnected;
            }

            let e = match outcome {
                AttemptOutcome::Finished => {
                    info!("Stream for execution {} finished", self.execution_id);
                    return EndReason::Finished;
                }
                AttemptOutcome::Cancelled => {
                    debug!("Connection to execution {} cancelled", self.execution_id);
                    return EndReason::Disconnected;
                }
                AttemptOutcome::Failed(e) => e,
            };

            match self.policy.record_failure() {
                ReconnectDecision::Retry(delay) => {
                    warn!(
                        "Connection to execution {} lost: {}. Retrying in {:?}",
                        self.execution_id, e, delay
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return EndReason::Disconnected,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                ReconnectDecision::GiveUp => {
                    error!(
                        "Giving up on execution {} after {} attempts: {}",
                        self.execution_id,
                        self.policy.failures(),
                        e
                    );
                    self.emit(TransportEvent::State(ConnectionState::Failed)).await;
                    return EndReason::Exhausted {
                        attempts: self.policy.failures(),
                        not_found: matches!(e, TransportError::NotFound { .. }),
                        last_error: e.to_string(),
                    };
                }
            }
        }
    }

    async fn attempt(&mut self) -> AttemptOutcome {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return AttemptOutcome::Cancelled,
            opened = self.transport.open(&self.execution_id) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return AttemptOutcome::Failed(e),
        };

        info!("Connected to execution {}", self.execution_id);
        if !self.emit(TransportEvent::State(ConnectionState::Open)).await {
            return AttemptOutcome::Cancelled;
        }

        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return AttemptOutcome::Cancelled,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(frame)) => {
                    self.policy.record_success();
                    let finished = frame == Frame::Complete || frame.is_error();
                    if !self.emit(TransportEvent::Frame(frame)).await {
                        return AttemptOutcome::Cancelled;
                    }
                    if finished {
                        return AttemptOutcome::Finished;
                    }
                }
                Some(Err(e)) => return AttemptOutcome::Failed(e),
                None => return AttemptOutcome::Failed(TransportError::UnexpectedEnd),
            }
        }
    }
}
