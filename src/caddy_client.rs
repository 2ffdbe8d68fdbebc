use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::ProxyPushError;
use crate::models::caddy::ProxyConfigDocument;

/// Backoff schedule for transport failures against the admin API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

#[async_trait]
pub trait ProxyAdmin: Send + Sync {
    /// Replace the proxy's entire configuration with `document`.
    async fn push(
        &self,
        document: &ProxyConfigDocument,
        cancel: &CancellationToken,
    ) -> Result<(), ProxyPushError>;
}

/// Client for Caddy's admin API.
///
/// `POST /load` swaps the running configuration atomically; Caddy keeps the
/// previous config if the new one fails to apply.
#[derive(Clone, Debug)]
pub struct CaddyClient {
    base_url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl CaddyClient {
    pub fn new(
        base_url: impl AsRef<str>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            base_url: base_url.as_ref().trim_end_matches('/').to_string(),
            http,
            retry,
        })
    }

    fn join_url(&self, url: &str) -> String {
        format!("{}/{}", self.base_url, url.trim_start_matches('/'))
    }

    async fn load(&self, document: &ProxyConfigDocument) -> Result<(), LoadError> {
        let resp = self
            .http
            .post(self.join_url("load"))
            .json(document)
            .send()
            .await
            .map_err(LoadError::Transport)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = rejection_body(resp.text().await);
        Err(LoadError::Rejected { status, body })
    }
}

fn rejection_body<E: fmt::Display>(read: Result<String, E>) -> String {
    read.unwrap_or_else(|e| format!("<unreadable body: {e}>"))
}

enum LoadError {
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    Transport(reqwest::Error),
}

#[async_trait]
impl ProxyAdmin for CaddyClient {
    async fn push(
        &self,
        document: &ProxyConfigDocument,
        cancel: &CancellationToken,
    ) -> Result<(), ProxyPushError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            // a request already on the wire is never abandoned
            if cancel.is_cancelled() {
                return Err(ProxyPushError::Cancelled);
            }
            attempt += 1;

            match self.load(document).await {
                Ok(()) => {
                    tracing::info!(admin = %self.base_url, attempt, "proxy configuration loaded");
                    return Ok(());
                }
                Err(LoadError::Rejected { status, body }) => {
                    tracing::error!(admin = %self.base_url, %status, %body, "proxy rejected configuration");
                    return Err(ProxyPushError::Rejected { status, body });
                }
                Err(LoadError::Transport(source)) => {
                    let retryable = source.is_connect() || source.is_timeout();
                    if !retryable || attempt >= max_attempts {
                        return Err(ProxyPushError::Transport {
                            attempts: attempt,
                            source,
                        });
                    }
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        admin = %self.base_url,
                        attempt,
                        max_attempts,
                        ?delay,
                        error = %source,
                        "proxy admin API unreachable, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ProxyPushError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
