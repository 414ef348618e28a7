//! # Watch Client - Execution observability
//!
//! Keeps a UI consistent with a long-running, multi-phase execution on a
//! server. State arrives over Server-Sent Events or a WebSocket, with
//! snapshot polling as the fallback.
//!
//! ```text
//! transport -> decoder -> dedup -> phases::reduce -> Progress / observer
//!                 ^                      ^
//!           reconnect policy      poller snapshots
//! ```

pub mod api;
pub mod config;
pub mod decoder;
pub mod dedup;
pub mod event;
pub mod phases;
pub mod poller;
pub mod reconnect;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
mod session_tests;

pub use api::{ApiClient, ApiError, SnapshotSource, DEFAULT_SERVER_URL};
pub use config::{TransportKind, WatchConfig};
pub use decoder::{decode_message, Frame, SseDecoder};
pub use dedup::{apply_event, Applied, ProgressTracker, SeenEventSet};
pub use event::{DedupKey, Event, EventKind, EventParseError, Repeatability};
pub use phases::{reduce, PhaseItem, PhaseStatus, Progress, StepStatus, PHASE_TEMPLATE};
pub use poller::PollingCoordinator;
pub use reconnect::{ReconnectConfig, ReconnectDecision, ReconnectPolicy};
pub use session::{ExecutionObserver, NoopObserver, WatchError, WatchHandle, Watcher};
pub use transport::{
    ConnectionHandle, ConnectionState, SseTransport, Transport, TransportError,
    WebSocketTransport,
};
pub use types::{ExecutionRecord, ExecutionStatus, Snapshot, StartedExecution, StepSnapshot};
