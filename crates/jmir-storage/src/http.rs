//! Authenticated JSON-over-HTTP transport with bounded retries.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Username + personal access token sent as HTTP basic auth.
#[derive(Clone)]
pub struct BasicAuth {
    pub username: String,
    pub token: String,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub auth: Option<BasicAuth>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(concat!("jmir/", env!("CARGO_PKG_VERSION")).to_string()),
            auth: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("request cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    auth: Option<BasicAuth>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            auth: config.auth,
            backoff: config.backoff,
        })
    }

    fn request(&self, url: &str, query: &[(&str, String)]) -> reqwest::RequestBuilder {
        let mut request = self.client.get(url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.username, Some(&auth.token));
        }
        request
    }

    /// GET with retries on transient failures; any other non-2xx is returned as an error.
    pub async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_get", url);
        async move {
            let mut attempt = 0usize;
            loop {
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    sent = self.request(url, query).send() => sent,
                };

                let (retryable, err) = match sent {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();
                        if status.is_success() {
                            let body = resp.bytes().await.map_err(|source| FetchError::Request {
                                url: final_url.clone(),
                                source,
                            })?;
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body: body.to_vec(),
                            });
                        }
                        let err = FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        };
                        (classify_status(status) == RetryDisposition::Retryable, err)
                    }
                    Err(source) => {
                        let retryable =
                            classify_reqwest_error(&source) == RetryDisposition::Retryable;
                        let err = FetchError::Request {
                            url: url.to_string(),
                            source,
                        };
                        (retryable, err)
                    }
                };

                if !retryable || attempt >= self.backoff.max_retries {
                    return Err(err);
                }

                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(attempt, ?delay, error = %err, "transient http failure, retrying");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<T, FetchError> {
        let response = self.get(url, query, cancel).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url,
            source,
        })
    }

    /// Single unretried GET, for reachability probes.
    pub async fn probe(&self, url: &str) -> Result<StatusCode, FetchError> {
        let resp = self
            .request(url, &[])
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
        debug!(url, status = resp.status().as_u16(), "probe finished");
        Ok(resp.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(350));
    }

    #[test]
    fn only_throttling_and_server_errors_are_retried() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn auth_debug_hides_token() {
        let auth = BasicAuth {
            username: "svc-jira".into(),
            token: "s3cr3t".into(),
        };
        let text = format!("{auth:?}");
        assert!(text.contains("svc-jira"));
        assert!(!text.contains("s3cr3t"));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_requests() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fetcher
            .get("http://127.0.0.1:9/never", &[], &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, FetchError::Cancelled));
    }
}
