//! HTTP delivery of encoded batches to the ingest API.
//!
//! This module provides the [`Transport`] seam used by the shipper, a reqwest
//! implementation of it with connection pooling, and the per-batch retry loop
//! with capped exponential backoff.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, error, warn};

use crate::payload::EncodedPayload;

/// Delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound on the delay between retries.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Default number of attempts per batch, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Header carrying the credential in [`AuthStyle::ApiKey`] mode.
pub const API_KEY_HEADER: &str = "x-api-key";

const CLIENT_USER_AGENT: &str = concat!("probe-collector/", env!("CARGO_PKG_VERSION"));

/// Longest server error message kept for diagnostics.
const MAX_ERROR_BODY: usize = 1024;

/// How the credential is presented to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthStyle {
    /// `X-API-Key: <key>`
    #[default]
    ApiKey,

    /// `Authorization: Bearer <token>`
    Bearer,
}

impl FromStr for AuthStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x-api-key" | "api-key" | "apikey" => Ok(AuthStyle::ApiKey),
            "bearer" => Ok(AuthStyle::Bearer),
            other => Err(format!("unknown auth style '{}' (expected x-api-key or bearer)", other)),
        }
    }
}

impl std::fmt::Display for AuthStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthStyle::ApiKey => write!(f, "x-api-key"),
            AuthStyle::Bearer => write!(f, "bearer"),
        }
    }
}

/// Errors that can occur while delivering a batch.
#[derive(Debug)]
pub enum ClientError {
    /// HTTP request failed at the transport level
    Request(reqwest::Error),

    /// Server returned a non-2xx status code
    Status { code: StatusCode, message: String },

    /// Request timeout
    Timeout,

    /// Client configuration error
    Config(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Request(e) => write!(f, "HTTP request failed: {}", e),
            ClientError::Status { code, message } => {
                write!(f, "Server error ({}): {}", code, message)
            }
            ClientError::Timeout => write!(f, "Request timed out"),
            ClientError::Config(e) => write!(f, "Client configuration error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Request(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Request(err)
        }
    }
}

impl ClientError {
    /// Whether another attempt may succeed.
    ///
    /// 4xx responses are permanent except 408, 409 and 429. Every 5xx,
    /// timeout and connection failure is transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Request(_) | ClientError::Timeout => true,
            ClientError::Status { code, .. } => {
                !code.is_client_error() || matches!(code.as_u16(), 408 | 409 | 429)
            }
            ClientError::Config(_) => false,
        }
    }

    /// Status code of the response, if the server answered.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// A single POST of an encoded batch, without retries.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request. `Ok` means the server answered 2xx.
    async fn post(&self, payload: &EncodedPayload) -> Result<(), ClientError>;

    /// Destination, for logging.
    fn endpoint(&self) -> &str;
}

/// reqwest-backed [`Transport`] with pooled connections.
pub struct HttpTransport {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpTransport {
    /// Build a transport posting to `url` with the given credential.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the URL or credential is empty or
    /// malformed, or the HTTP client cannot be built.
    pub fn new(
        url: &str,
        credential: &str,
        auth_style: AuthStyle,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        if url.trim().is_empty() {
            return Err(ClientError::Config("server url is required".to_string()));
        }
        if credential.is_empty() {
            return Err(ClientError::Config("api key is required".to_string()));
        }
        Url::parse(url).map_err(|e| ClientError::Config(format!("invalid url '{}': {}", url, e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

        let (name, value) = match auth_style {
            AuthStyle::ApiKey => (HeaderName::from_static(API_KEY_HEADER), credential.to_string()),
            AuthStyle::Bearer => (AUTHORIZATION, format!("Bearer {}", credential)),
        };
        let mut value = HeaderValue::from_str(&value)
            .map_err(|_| ClientError::Config("api key contains invalid header characters".to_string()))?;
        value.set_sensitive(true);
        headers.insert(name, value);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            url: url.to_string(),
            timeout,
        })
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, payload: &EncodedPayload) -> Result<(), ClientError> {
        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .body(payload.body.clone());
        if let Some(encoding) = payload.content_encoding() {
            request = request.header(CONTENT_ENCODING, encoding);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let mut message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        truncate_at_char_boundary(&mut message, MAX_ERROR_BODY);

        Err(ClientError::Status {
            code: status,
            message,
        })
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

fn truncate_at_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// Attempt budget and backoff schedule for one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per batch, including the first (at least 1)
    pub max_attempts: u32,

    /// Delay after the first failure
    pub initial_backoff: Duration,

    /// Cap on the doubling delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the `failures`-th consecutive failure (1-based).
    ///
    /// delay = min(initial * 2^(failures - 1), max)
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Final state of one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Server accepted the batch
    Delivered { attempts: u32 },

    /// Batch abandoned; its records are lost
    Dropped {
        attempts: u32,
        status: Option<StatusCode>,
        reason: String,
    },
}

impl DeliveryOutcome {
    /// Number of requests issued for the batch.
    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryOutcome::Delivered { attempts } | DeliveryOutcome::Dropped { attempts, .. } => *attempts,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// Deliver one encoded batch, retrying transient failures.
///
/// Never returns an error: a batch that fails permanently, or runs out of
/// attempts, is dropped and reported through the outcome and an `error` log.
pub async fn deliver<T>(transport: &T, payload: &EncodedPayload, policy: &RetryPolicy) -> DeliveryOutcome
where
    T: Transport + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        match transport.post(payload).await {
            Ok(()) => {
                debug!(
                    records = payload.record_count,
                    attempts = attempt,
                    url = %transport.endpoint(),
                    "Batch delivered"
                );
                return DeliveryOutcome::Delivered { attempts: attempt };
            }
            Err(e) => {
                let retryable = e.is_retryable();

                warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    status = ?e.status().map(|s| s.as_u16()),
                    retryable = retryable,
                    "Batch POST failed"
                );

                if !retryable || attempt >= max_attempts {
                    error!(
                        records = payload.record_count,
                        attempts = attempt,
                        status = ?e.status().map(|s| s.as_u16()),
                        "Dropping batch"
                    );
                    return DeliveryOutcome::Dropped {
                        attempts: attempt,
                        status: e.status(),
                        reason: e.to_string(),
                    };
                }

                tokio::time::sleep(policy.backoff(attempt)).await;
            }
        }
    }
}
