//! HTTP delivery of location samples to the ingest endpoint.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use geotrack_core::{exponential_delay_ms, validate_sample, LocationPayload, LocationSample};
use reqwest::Client;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Fixed per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
}

/// Performs the single POST for one payload and reports the HTTP status.
#[async_trait]
pub trait LocationTransport: Send + Sync {
    async fn post_location(
        &self,
        payload: &LocationPayload,
        bearer_token: Option<&str>,
    ) -> Result<u16, TransportError>;
}

/// `reqwest`-backed transport posting JSON to `<base_url><path>`.
pub struct HttpTransport {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: &str, path: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: join_url(base_url, path),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl LocationTransport for HttpTransport {
    async fn post_location(
        &self,
        payload: &LocationPayload,
        bearer_token: Option<&str>,
    ) -> Result<u16, TransportError> {
        let mut req = self.client.post(&self.url).json(payload);
        if let Some(token) = bearer_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.timeout)
            } else {
                TransportError::Network(e.to_string())
            }
        })?;
        Ok(resp.status().as_u16())
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// What happened to one sample handed to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Endpoint answered 2xx.
    Delivered,
    /// Network failure, timeout or non-2xx. Safe to queue for a retry.
    Failed,
    /// Sample failed validation; nothing was sent and it must not be queued.
    Invalid(Vec<String>),
}

/// Validates, serializes and posts samples; never surfaces transport errors
/// to the caller beyond a `false`/[`DeliveryOutcome::Failed`].
pub struct DeliveryClient {
    transport: Arc<dyn LocationTransport>,
    timeout: Duration,
    auth_token: RwLock<Option<String>>,
}

impl DeliveryClient {
    pub fn new(transport: Arc<dyn LocationTransport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            auth_token: RwLock::new(None),
        }
    }

    pub fn set_auth_token(&self, token: impl Into<String>) {
        let mut slot = self.auth_token.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(token.into());
    }

    pub fn clear_auth_token(&self) {
        let mut slot = self.auth_token.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }

    fn token(&self) -> Option<String> {
        self.auth_token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Validates then makes one delivery attempt.
    pub async fn deliver(&self, sample: &LocationSample) -> DeliveryOutcome {
        let outcome = validate_sample(sample);
        if !outcome.is_valid() {
            warn!(
                "dropping invalid sample for user '{}': {}",
                sample.user_id,
                outcome.violations.join("; ")
            );
            return DeliveryOutcome::Invalid(outcome.violations);
        }
        if self.attempt(sample).await {
            DeliveryOutcome::Delivered
        } else {
            DeliveryOutcome::Failed
        }
    }

    /// True only when the endpoint answered 2xx.
    pub async fn send(&self, sample: &LocationSample) -> bool {
        self.deliver(sample).await == DeliveryOutcome::Delivered
    }

    /// Up to `max_retries` attempts with `base_delay * 2^(attempt-1)` between
    /// consecutive attempts.
    pub async fn send_with_retry(
        &self,
        sample: &LocationSample,
        max_retries: u32,
        base_delay: Duration,
    ) -> bool {
        let outcome = validate_sample(sample);
        if !outcome.is_valid() {
            warn!("dropping invalid sample: {}", outcome.violations.join("; "));
            return false;
        }

        let attempts = max_retries.max(1);
        for attempt in 1..=attempts {
            if self.attempt(sample).await {
                return true;
            }
            if attempt < attempts {
                let delay = exponential_delay_ms(base_delay.as_millis() as u64, attempt);
                debug!("send attempt {attempt}/{attempts} failed; retrying in {delay}ms");
                sleep(Duration::from_millis(delay)).await;
            }
        }
        warn!("giving up on sample for user '{}' after {attempts} attempts", sample.user_id);
        false
    }

    async fn attempt(&self, sample: &LocationSample) -> bool {
        let payload = sample.payload();
        let token = self.token();

        let res = timeout(
            self.timeout,
            self.transport.post_location(&payload, token.as_deref()),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout(self.timeout)));

        match res {
            Ok(status) if (200..300).contains(&status) => {
                debug!("delivered location for user '{}'", sample.user_id);
                true
            }
            Ok(status) => {
                warn!("location ingest returned HTTP {status}");
                false
            }
            Err(e) => {
                warn!("location delivery failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays a fixed list of responses and records what was posted.
    struct Scripted {
        responses: Mutex<Vec<Result<u16, TransportError>>>,
        seen: Mutex<Vec<(LocationPayload, Option<String>)>>,
    }

    impl Scripted {
        fn new(mut responses: Vec<Result<u16, TransportError>>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LocationTransport for Scripted {
        async fn post_location(
            &self,
            payload: &LocationPayload,
            bearer_token: Option<&str>,
        ) -> Result<u16, TransportError> {
            self.seen
                .lock()
                .unwrap()
                .push((payload.clone(), bearer_token.map(str::to_string)));
            self.responses.lock().unwrap().pop().unwrap_or(Ok(200))
        }
    }

    struct Hanging;

    #[async_trait]
    impl LocationTransport for Hanging {
        async fn post_location(
            &self,
            _payload: &LocationPayload,
            _bearer_token: Option<&str>,
        ) -> Result<u16, TransportError> {
            std::future::pending().await
        }
    }

    fn sample() -> LocationSample {
        LocationSample::new("42", -12.04, -77.04, 1_700_000_000_000)
    }

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(join_url("http://h:1/", "/api/x"), "http://h:1/api/x");
        assert_eq!(join_url("http://h:1", "api/x"), "http://h:1/api/x");
    }

    #[tokio::test]
    async fn classifies_status_codes() {
        let t = Scripted::new(vec![
            Ok(201),
            Ok(500),
            Ok(302),
            Err(TransportError::Network("refused".into())),
        ]);
        let client = DeliveryClient::new(t.clone(), DEFAULT_TIMEOUT);
        assert!(client.send(&sample()).await);
        assert!(!client.send(&sample()).await);
        assert!(!client.send(&sample()).await);
        assert!(!client.send(&sample()).await);
        assert_eq!(t.calls(), 4);
    }

    #[tokio::test]
    async fn invalid_sample_is_not_sent() {
        let t = Scripted::new(vec![]);
        let client = DeliveryClient::new(t.clone(), DEFAULT_TIMEOUT);
        let bad = LocationSample::new("", 0.0, 0.0, 1);
        assert!(matches!(client.deliver(&bad).await, DeliveryOutcome::Invalid(v) if v.len() == 1));
        assert!(!client.send_with_retry(&bad, 3, Duration::from_millis(1)).await);
        assert_eq!(t.calls(), 0);
    }

    #[tokio::test]
    async fn bearer_token_is_attached_when_set() {
        let t = Scripted::new(vec![]);
        let client = DeliveryClient::new(t.clone(), DEFAULT_TIMEOUT);
        client.send(&sample()).await;
        client.set_auth_token("tok");
        client.send(&sample()).await;
        client.clear_auth_token();
        client.send(&sample()).await;

        let seen = t.seen.lock().unwrap();
        assert_eq!(seen[0].1, None);
        assert_eq!(seen[1].1.as_deref(), Some("tok"));
        assert_eq!(seen[2].1, None);
        assert_eq!(seen[0].0.hijo_id, "42");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let client = DeliveryClient::new(Arc::new(Hanging), DEFAULT_TIMEOUT);
        let started = tokio::time::Instant::now();
        assert!(!client.send(&sample()).await);
        assert!(started.elapsed() >= DEFAULT_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn send_with_retry_backs_off_exponentially() {
        let t = Scripted::new(vec![Ok(503), Ok(503), Ok(200)]);
        let client = DeliveryClient::new(t.clone(), DEFAULT_TIMEOUT);
        let started = tokio::time::Instant::now();
        assert!(client.send_with_retry(&sample(), 3, Duration::from_millis(1000)).await);
        assert_eq!(t.calls(), 3);
        // 1000ms after the first failure, 2000ms after the second.
        assert!(started.elapsed() >= Duration::from_millis(3000));
        assert!(started.elapsed() < Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn send_with_retry_gives_up_after_max_attempts() {
        let t = Scripted::new(vec![Ok(500), Ok(500), Ok(500), Ok(200)]);
        let client = DeliveryClient::new(t.clone(), DEFAULT_TIMEOUT);
        assert!(!client.send_with_retry(&sample(), 3, Duration::from_millis(10)).await);
        assert_eq!(t.calls(), 3);
    }
}
