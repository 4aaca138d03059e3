use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{RunnerError, RunnerResult};

/// Timeout for one webhook request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared HTTP client for the stream webhook. Owns the connection pool,
/// endpoint and bearer token. Clone is a cheap Arc refcount bump.
#[derive(Clone)]
pub struct WebhookClient {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    url: String,
    token: Option<String>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl WebhookClient {
    pub fn new(url: String, token: Option<String>) -> RunnerResult<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| RunnerError::Internal(format!("http client: {e}")))?;

        info!(url = %url, authenticated = token.is_some(), "webhook client initialized");

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                url,
                token,
                max_attempts: 3,
                retry_delay: Duration::from_secs(1),
            }),
        })
    }

    /// Override retry behaviour. Only valid before the client is cloned.
    pub fn with_retries(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.max_attempts = max_attempts.max(1);
            inner.retry_delay = retry_delay;
        }
        self
    }

    /// POST `body` as JSON, retrying on transport errors and non-2xx replies.
    ///
    /// Returns `Err` only after all attempts are exhausted.
    pub async fn post_json(&self, body: &impl Serialize) -> RunnerResult<()> {
        let max = self.inner.max_attempts;
        for attempt in 1..=max {
            let mut req = self.inner.client.post(&self.inner.url).json(body);
            if let Some(token) = &self.inner.token {
                req = req.bearer_auth(token);
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    warn!(attempt, max, status = %resp.status(), "webhook POST failed");
                }
                Err(e) => {
                    warn!(attempt, max, error = %e, "webhook POST failed");
                }
            }

            if attempt < max {
                tokio::time::sleep(self.inner.retry_delay).await;
            }
        }

        Err(RunnerError::Sink(format!(
            "POST failed after {max} attempts to {}",
            self.inner.url
        )))
    }
}
