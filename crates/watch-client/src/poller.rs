//! Periodic snapshot polling
//!
//! Runs beside the stream while the execution is active so the session
//! converges even when streaming degrades. Snapshots are handed to the
//! session, which reduces them through the same dedup path as stream events.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::SnapshotSource;
use crate::types::{ExecutionStatus, Snapshot};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A fetched (or the initial) status was terminal.
    Terminal(ExecutionStatus),
    Cancelled,
}

#[derive(Debug)]
pub enum PollEvent {
    Snapshot(Snapshot),
    Finished(PollOutcome),
}

#[derive(Debug)]
pub struct PollUpdate {
    pub epoch: u64,
    pub event: PollEvent,
}

#[derive(Debug, Clone)]
pub struct PollingCoordinator {
    interval: Duration,
}

impl Default for PollingCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl PollingCoordinator {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Polls `execution_id` until its status is terminal or `cancel` fires.
    ///
    /// Each fetch is awaited before the next tick is taken, so fetches never
    /// overlap; a slow fetch delays the schedule instead of bunching ticks.
    pub async fn run(
        &self,
        source: Arc<dyn SnapshotSource>,
        execution_id: &str,
        initial_status: ExecutionStatus,
        epoch: u64,
        sink: &mpsc::Sender<PollUpdate>,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        if initial_status.is_terminal() {
            debug!("Not polling {}: already {}", execution_id, initial_status);
            return PollOutcome::Terminal(initial_status);
        }

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                _ = ticker.tick() => {}
            }

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                fetched = source.fetch_snapshot(execution_id) => fetched,
            };

            let snapshot = match fetched {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Polling execution {} failed: {}", execution_id, e);
                    continue;
                }
            };

            let status = snapshot.status;
            debug!("Polled execution {}: {}", execution_id, status);
            let update = PollUpdate {
                epoch,
                event: PollEvent::Snapshot(snapshot),
            };
            if sink.send(update).await.is_err() {
                return PollOutcome::Cancelled;
            }

            if status.is_terminal() {
                info!("Execution {} reached {}; polling stopped", execution_id, status);
                return PollOutcome::Terminal(status);
            }
        }
    }

    /// Runs the poll loop on its own task and reports how it ended.
    pub fn spawn(
        &self,
        source: Arc<dyn SnapshotSource>,
        execution_id: String,
        initial_status: ExecutionStatus,
        epoch: u64,
        sink: mpsc::Sender<PollUpdate>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let outcome = coordinator
                .run(source, &execution_id, initial_status, epoch, &sink, &cancel)
                .await;
            let _ = sink
                .send(PollUpdate {
                    epoch,
                    event: PollEvent::Finished(outcome),
                })
                .await;
        })
    }
}
