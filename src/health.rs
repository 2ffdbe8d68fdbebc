//! Health gate for a freshly started instance.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::{HealthCheckError, HealthCheckTimeoutError};

#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub endpoint: String,
    pub timeout_per_attempt: Duration,
    pub interval: Duration,
    pub max_retries: u32,
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Poll `target` + `policy.endpoint` until it answers 2xx.
    ///
    /// Returns the number of attempts made. Total wall time never exceeds
    /// `max_retries * (timeout_per_attempt + interval)`.
    async fn wait_until_healthy(
        &self,
        target: &str,
        policy: &HealthPolicy,
        cancel: &CancellationToken,
    ) -> Result<u32, HealthCheckError>;
}

/// HTTP GET prober.
#[derive(Clone, Debug)]
pub struct HealthProbe {
    http: reqwest::Client,
}

impl HealthProbe {
    pub fn new() -> Result<Self, reqwest::Error> {
        // every request carries its own timeout from the policy
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self { http })
    }

    async fn probe_once(&self, url: &str, timeout: Duration) -> Result<(), String> {
        match self.http.get(url).timeout(timeout).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("status {}", resp.status())),
            Err(e) if e.is_timeout() => Err(format!("timed out after {timeout:?}")),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[async_trait]
impl HealthCheck for HealthProbe {
    async fn wait_until_healthy(
        &self,
        target: &str,
        policy: &HealthPolicy,
        cancel: &CancellationToken,
    ) -> Result<u32, HealthCheckError> {
        let url = health_url(target, &policy.endpoint);
        let attempts = policy.max_retries.max(1);
        let mut last = String::from("no response");

        for attempt in 1..=attempts {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(HealthCheckError::Cancelled { attempts: attempt - 1 });
                }
                outcome = self.probe_once(&url, policy.timeout_per_attempt) => outcome,
            };

            match outcome {
                Ok(()) => {
                    tracing::info!(%url, attempt, "instance healthy");
                    return Ok(attempt);
                }
                Err(observed) => {
                    tracing::debug!(%url, attempt, attempts, %observed, "health probe failed");
                    last = observed;
                }
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(HealthCheckError::Cancelled { attempts: attempt });
                    }
                    _ = tokio::time::sleep(policy.interval) => {}
                }
            }
        }

        Err(HealthCheckTimeoutError {
            target: url,
            attempts,
            last,
        }
        .into())
    }
}

fn health_url(target: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        target.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use axum::{Router, extract::State, http::StatusCode, routing::get};

    use super::*;

    /// Serves `/health`, answering 503 until `healthy_from` requests have been seen.
    async fn spawn_server(healthy_from: u32) -> (String, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let app = Router::new()
            .route(
                "/health",
                get(move |State(hits): State<Arc<AtomicU32>>| async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                    if n >= healthy_from {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }),
            )
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    fn policy(max_retries: u32, interval: Duration) -> HealthPolicy {
        HealthPolicy {
            endpoint: "/health".to_string(),
            timeout_per_attempt: Duration::from_secs(1),
            interval,
            max_retries,
        }
    }

    #[test]
    fn joins_target_and_endpoint() {
        assert_eq!(health_url("http://127.0.0.1:8000", "/health"), "http://127.0.0.1:8000/health");
        assert_eq!(health_url("http://127.0.0.1:8000/", "health"), "http://127.0.0.1:8000/health");
        assert_eq!(health_url("http://127.0.0.1:8000", "/"), "http://127.0.0.1:8000/");
    }

    #[tokio::test]
    async fn succeeds_on_first_healthy_answer() {
        let (target, hits) = spawn_server(1).await;
        let probe = HealthProbe::new().unwrap();
        let attempts = probe
            .wait_until_healthy(&target, &policy(3, Duration::from_millis(10)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(attempts, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stops_polling_once_healthy() {
        let (target, hits) = spawn_server(2).await;
        let probe = HealthProbe::new().unwrap();
        let attempts = probe
            .wait_until_healthy(&target, &policy(5, Duration::from_millis(10)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(attempts, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausts_retries_within_time_bounds() {
        let (target, hits) = spawn_server(u32::MAX).await;
        let probe = HealthProbe::new().unwrap();
        let policy = policy(3, Duration::from_secs(1));

        let started = Instant::now();
        let err = probe
            .wait_until_healthy(&target, &policy, &CancellationToken::new())
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(elapsed >= Duration::from_secs(2), "finished too early: {elapsed:?}");
        assert!(
            elapsed <= 3 * (policy.timeout_per_attempt + policy.interval),
            "took too long: {elapsed:?}"
        );
        match err {
            HealthCheckError::TimedOut(e) => {
                assert_eq!(e.attempts, 3);
                assert!(e.last.contains("503"), "last = {}", e.last);
                assert!(e.target.ends_with("/health"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reports_connection_errors() {
        // bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = HealthProbe::new().unwrap();
        let err = probe
            .wait_until_healthy(
                &format!("http://{addr}"),
                &policy(2, Duration::from_millis(10)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HealthCheckError::TimedOut(HealthCheckTimeoutError { attempts: 2, .. })));
    }

    #[tokio::test]
    async fn cancellation_interrupts_polling() {
        let (target, _hits) = spawn_server(u32::MAX).await;
        let probe = HealthProbe::new().unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = probe
            .wait_until_healthy(&target, &policy(10, Duration::from_secs(5)), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, HealthCheckError::Cancelled { attempts: 1 });
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
