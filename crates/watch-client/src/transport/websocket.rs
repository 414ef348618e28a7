//! WebSocket transport with an application-level keep-alive

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::SplitStream;
use futures::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::{FrameStream, Transport, TransportError};
use crate::decoder::{decode_message, Frame};

type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    ws_base: String,
    api_key: Option<String>,
    keepalive: Duration,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    /// `base_url` may be given as `http(s)://` or `ws(s)://`.
    pub fn new(base_url: &str) -> Self {
        let ws_base = base_url
            .trim_end_matches('/')
            .replace("http://", "ws://")
            .replace("https://", "wss://");

        Self {
            ws_base,
            api_key: None,
            keepalive: DEFAULT_KEEPALIVE,
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn socket_url(&self, execution_id: &str) -> String {
        format!(
            "{}/api/executions/{}/ws",
            self.ws_base,
            urlencoding::encode(execution_id)
        )
    }
}

/// Inbound half of one connection. Dropping it stops the keep-alive writer,
/// which releases the socket.
struct SocketFrames {
    read: WsRead,
    writer: JoinHandle<()>,
}

impl Stream for SocketFrames {
    type Item = Result<Frame, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let message = match this.read.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e.into()))),
                Poll::Ready(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => {
                    if let Some(frame) = decode_message(&text) {
                        return Poll::Ready(Some(Ok(frame)));
                    }
                }
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(text) => {
                        if let Some(frame) = decode_message(text) {
                            return Poll::Ready(Some(Ok(frame)));
                        }
                    }
                    Err(e) => warn!("Dropping non-UTF-8 binary message: {}", e),
                },
                Message::Close(reason) => {
                    debug!("Server closed socket: {:?}", reason);
                    return Poll::Ready(None);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}

impl Drop for SocketFrames {
    fn drop(&mut self) {
        self.writer.abort();
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn open(&self, execution_id: &str) -> Result<FrameStream, TransportError> {
        let url = self.socket_url(execution_id);
        debug!("Opening socket {}", url);

        let mut request = url.into_client_request()?;
        if let Some(key) = &self.api_key {
            match HeaderValue::from_str(&format!("Bearer {}", key)) {
                Ok(value) => {
                    request.headers_mut().insert("Authorization", value);
                }
                Err(_) => warn!("Ignoring API key that is not a valid header value"),
            }
        }

        let (socket, _) = timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| match e {
                tokio_tungstenite::tungstenite::Error::Http(ref response)
                    if response.status() == 404 =>
                {
                    TransportError::NotFound {
                        id: execution_id.to_string(),
                    }
                }
                other => TransportError::WebSocket(other),
            })?;

        let (mut write, read) = socket.split();
        let keepalive = self.keepalive;

        let writer = tokio::spawn(async move {
            let mut ticker = interval(keepalive);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let ping = serde_json::json!({ "type": "ping" }).to_string();
                if let Err(e) = write.send(Message::Text(ping)).await {
                    debug!("Keep-alive writer stopping: {}", e);
                    break;
                }
                debug!("Sent keep-alive ping");
            }
        });

        Ok(Box::pin(SocketFrames { read, writer }))
    }
}
