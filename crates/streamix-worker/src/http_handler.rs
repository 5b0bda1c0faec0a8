//! HTTP bridge to the sync handler service.
//!
//! The catalog application owns the actual sync routines (M3U parsing,
//! GIndex scraping, database upserts). The worker reaches them with
//! `POST {base_url}/{task_type}` carrying the task arguments as JSON and
//! expects the count map back.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use streamix_models::{SyncSummary, TaskArgs, TaskType};
use streamix_queue::redact_url;
use tracing::debug;

use crate::error::WorkerResult;
use crate::handlers::{HandlerError, HandlerResult, SyncHandler};

/// Longest response body quoted in an error.
const ERROR_BODY_LIMIT: usize = 256;

#[derive(Clone)]
pub struct HttpSyncHandler {
    http: Client,
    base_url: String,
}

impl HttpSyncHandler {
    /// Create a handler with a client whose timeout matches the task timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> WorkerResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("streamix-worker/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, task_type: TaskType) -> String {
        format!("{}/{}", self.base_url, task_type)
    }
}

#[async_trait]
impl SyncHandler for HttpSyncHandler {
    async fn handle(&self, args: &TaskArgs) -> HandlerResult {
        let url = self.url_for(args.task_type);
        // Reasons end up in logs and dead letters.
        let shown = redact_url(&url);

        let response = self
            .http
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(|e| {
                HandlerError::new(format!("request to {} failed: {}", shown, e.without_url()))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
            return Err(HandlerError::new(format!("{} returned {}: {}", shown, status, body)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| {
                HandlerError::new(format!(
                    "reading response from {} failed: {}",
                    shown,
                    e.without_url()
                ))
            })?;

        if body.iter().all(u8::is_ascii_whitespace) {
            debug!(url = %shown, "Sync handler returned an empty body");
            return Ok(SyncSummary::new());
        }

        serde_json::from_slice(&body)
            .map_err(|e| HandlerError::new(format!("invalid summary from {}: {}", shown, e)))
    }
}
