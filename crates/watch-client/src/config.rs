//! Watch session settings

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reconnect::ReconnectConfig;
use crate::transport::{SseTransport, Transport, TransportError, WebSocketTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Sse,
    Websocket,
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sse" => Ok(TransportKind::Sse),
            "websocket" | "ws" => Ok(TransportKind::Websocket),
            _ => Err(format!("Unknown transport: {} (expected sse or websocket)", s)),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Sse => write!(f, "sse"),
            TransportKind::Websocket => write!(f, "websocket"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub transport: TransportKind,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Run the snapshot poller beside the stream.
    #[serde(default = "default_true")]
    pub polling: bool,

    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            reconnect: ReconnectConfig::default(),
            poll_interval_secs: default_poll_interval_secs(),
            polling: true,
            keepalive_secs: default_keepalive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Builds the configured transport against `base_url`.
    pub fn build_transport(
        &self,
        base_url: &str,
        api_key: Option<String>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(match self.transport {
            TransportKind::Sse => Arc::new(
                SseTransport::new(base_url, self.connect_timeout())?.with_api_key(api_key),
            ),
            TransportKind::Websocket => Arc::new(
                WebSocketTransport::new(base_url)
                    .with_api_key(api_key)
                    .with_keepalive(self.keepalive())
                    .with_connect_timeout(self.connect_timeout()),
            ),
        })
    }
}
