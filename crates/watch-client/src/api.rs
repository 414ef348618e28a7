//! HTTP client for the execution snapshot and control API
//!
//! Used by the polling coordinator (through [`SnapshotSource`]) and directly
//! by callers that start executions or inspect their history.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, info, warn};

use crate::types::{ExecutionRecord, Snapshot, StartExecutionRequest, StartedExecution};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:3000";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Execution server not reachable at {url}: {source}")]
    NotReachable {
        url: String,
        source: reqwest::Error,
    },

    #[error("Execution {0} not found")]
    NotFound(String),

    #[error("Execution server returned error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse execution server response: {0}")]
    Parse(#[from] reqwest::Error),
}

impl ApiError {
    /// Transient failures worth another attempt.
    pub fn should_retry(&self) -> bool {
        match self {
            ApiError::NotReachable { .. } => true,
            ApiError::Api { status, .. } => *status >= 500 || *status == 429,
            ApiError::NotFound(_) | ApiError::Parse(_) => false,
        }
    }
}

/// Anything that can produce snapshots for the poller.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, execution_id: &str) -> Result<Snapshot, ApiError>;
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    client: Client,
    api_key: Option<String>,
}

fn retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(2)
        .with_jitter()
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| ApiError::NotReachable {
                url: base_url.clone(),
                source,
            })?;

        Ok(Self {
            base_url,
            client,
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn execution_url(&self, execution_id: &str, suffix: &str) -> String {
        format!(
            "{}/api/executions/{}{}",
            self.base_url,
            urlencoding::encode(execution_id),
            suffix
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        self.authorized(request)
            .send()
            .await
            .map_err(|source| ApiError::NotReachable {
                url: self.base_url.clone(),
                source,
            })
    }

    async fn check(response: Response, execution_id: Option<&str>) -> Result<Response, ApiError> {
        let status = response.status();
        if let (StatusCode::NOT_FOUND, Some(id)) = (status, execution_id) {
            return Err(ApiError::NotFound(id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Starts a new execution. Not retried: the request is not idempotent.
    pub async fn start_execution(&self, intent: &str) -> Result<StartedExecution, ApiError> {
        let request = self
            .client
            .post(format!("{}/api/executions", self.base_url))
            .json(&StartExecutionRequest {
                intent: intent.to_string(),
            });

        let response = self.send(request).await?;
        let started: StartedExecution = Self::check(response, None).await?.json().await?;
        info!("Started execution {}", started.id);
        Ok(started)
    }

    async fn get_snapshot_once(&self, execution_id: &str) -> Result<Snapshot, ApiError> {
        let response = self
            .send(self.client.get(self.execution_url(execution_id, "")))
            .await?;
        let snapshot: Snapshot = Self::check(response, Some(execution_id)).await?.json().await?;
        debug!("Fetched snapshot of {}: {}", execution_id, snapshot.status);
        Ok(snapshot)
    }

    /// Fetches the current snapshot, retrying transient failures.
    pub async fn get_snapshot(&self, execution_id: &str) -> Result<Snapshot, ApiError> {
        (|| async { self.get_snapshot_once(execution_id).await })
            .retry(retry_policy())
            .when(ApiError::should_retry)
            .notify(|err: &ApiError, dur: Duration| {
                warn!(
                    "Snapshot request failed, retrying after {:.2}s: {}",
                    dur.as_secs_f64(),
                    err
                );
            })
            .await
    }

    async fn list_recent_records_once(
        &self,
        execution_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, ApiError> {
        let request = self
            .client
            .get(self.execution_url(execution_id, "/records"))
            .query(&[("limit", limit)]);

        let response = self.send(request).await?;
        Ok(Self::check(response, Some(execution_id)).await?.json().await?)
    }

    /// Most recent history records, newest first as the server orders them.
    pub async fn list_recent_records(
        &self,
        execution_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, ApiError> {
        (|| async { self.list_recent_records_once(execution_id, limit).await })
            .retry(retry_policy())
            .when(ApiError::should_retry)
            .notify(|err: &ApiError, dur: Duration| {
                warn!(
                    "Records request failed, retrying after {:.2}s: {}",
                    dur.as_secs_f64(),
                    err
                );
            })
            .await
    }
}

/// One request per poll tick.
#[async_trait]
impl SnapshotSource for ApiClient {
    async fn fetch_snapshot(&self, execution_id: &str) -> Result<Snapshot, ApiError> {
        self.get_snapshot_once(execution_id).await
    }
}
