//! Server-Sent Events transport

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::{FrameStream, Transport, TransportError};
use crate::decoder::{Frame, SseDecoder};

/// One GET per connection attempt against `/api/executions/{id}/stream`.
#[derive(Debug, Clone)]
pub struct SseTransport {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl SseTransport {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn stream_url(&self, execution_id: &str) -> String {
        format!(
            "{}/api/executions/{}/stream",
            self.base_url,
            urlencoding::encode(execution_id)
        )
    }
}

fn map_http_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Http(e)
    }
}

struct BodyState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    queued: VecDeque<Frame>,
    ended: bool,
}

#[async_trait]
impl Transport for SseTransport {
    fn name(&self) -> &'static str {
        "sse"
    }

    async fn open(&self, execution_id: &str) -> Result<FrameStream, TransportError> {
        let url = self.stream_url(execution_id);
        debug!("Opening event stream {}", url);

        let mut request = self
            .client
            .get(&url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(map_http_error)?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(TransportError::NotFound {
                id: execution_id.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let state = BodyState {
            body: response.bytes_stream().boxed(),
            decoder: SseDecoder::new(),
            queued: VecDeque::new(),
            ended: false,
        };

        let frames = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(frame) = state.queued.pop_front() {
                    return Some((Ok(frame), state));
                }
                if state.ended || state.decoder.is_halted() {
                    return None;
                }

                match state.body.next().await {
                    Some(Ok(chunk)) => {
                        let decoded = state.decoder.push(&chunk);
                        state.queued.extend(decoded);
                    }
                    Some(Err(e)) => {
                        state.ended = true;
                        return Some((Err(map_http_error(e)), state));
                    }
                    None => {
                        state.ended = true;
                        let decoded = state.decoder.finish();
                        state.queued.extend(decoded);
                    }
                }
            }
        });

        Ok(Box::pin(frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    async fn drain(mut stream: FrameStream) -> Vec<Result<Frame, TransportError>> {
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item);
        }
        items
    }

    fn transport(url: &str) -> SseTransport {
        SseTransport::new(url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_streams_frames_until_completion() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/executions/exec-1/stream")
            .match_header("accept", "text/event-stream")
            .match_header("authorization", "Bearer secret")
            .with_header("content-type", "text/event-stream")
            .with_body(concat!(
                ": hello\n\n",
                "data: {\"type\":\"started\"}\n\n",
                "data: {\"type\":\"intent_detected\",\"intent\":\"billing\"}\n\n",
                "data: [DONE]\n\n",
                "data: {\"type\":\"failed\"}\n\n",
            ))
            .create_async()
            .await;

        let transport = transport(&server.url()).with_api_key(Some("secret".into()));
        let items = drain(transport.open("exec-1").await.unwrap()).await;
        mock.assert_async().await;

        let frames: Vec<Frame> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(frames.len(), 3);
        assert!(matches!(&frames[0], Frame::Event(e) if e.kind == EventKind::Started));
        assert!(matches!(&frames[1], Frame::Event(e) if e.kind == EventKind::IntentDetected));
        assert_eq!(frames[2], Frame::Complete);
    }

    #[tokio::test]
    async fn test_body_without_marker_just_ends() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/executions/exec-2/stream")
            .with_header("content-type", "text/event-stream")
            .with_body("data: {\"type\":\"started\"}\n\ndata: {\"type\":\"llm_started\"}")
            .create_async()
            .await;

        let items = drain(transport(&server.url()).open("exec-2").await.unwrap()).await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_missing_execution_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/executions/ghost/stream")
            .with_status(404)
            .create_async()
            .await;

        let result = transport(&server.url()).open("ghost").await;
        assert!(matches!(result, Err(TransportError::NotFound { id }) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_server_error_carries_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/executions/exec-3/stream")
            .with_status(503)
            .with_body("draining")
            .create_async()
            .await;

        let result = transport(&server.url()).open("exec-3").await;
        match result {
            Err(TransportError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "draining");
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn test_stream_url_escapes_id() {
        let transport = transport("http://localhost:3000/");
        assert_eq!(
            transport.stream_url("a b"),
            "http://localhost:3000/api/executions/a%20b/stream"
        );
    }
}
