//! Periodic liveness reports to the status route.
//!
//! Until the first report is accepted the heartbeat retries every
//! `retry_interval`. After that it reports every `interval`; a failed report
//! is retried after `retry_interval` until it goes through, then the regular
//! schedule resumes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{AuthStyle, ClientError, HttpTransport, Transport};
use crate::config::Config;
use crate::payload::EncodedPayload;

/// Delay between attempts while a report keeps failing.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub status_url: String,
    pub api_key: String,
    pub endpoint_id: String,

    /// Time between successful reports
    pub interval: Duration,

    /// Time between attempts after a failure
    pub retry_interval: Duration,
}

impl HeartbeatConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            status_url: config.status_url.clone(),
            api_key: config.api_key.clone(),
            endpoint_id: config.endpoint_id.clone(),
            interval: config.heartbeat_interval,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Build the status report body.
pub fn build_report(endpoint_id: &str, hostname: &str, now: DateTime<Utc>) -> Value {
    json!({
        "endpoint_id": endpoint_id,
        "status": "online",
        "timestamp": now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "hostname": hostname,
    })
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

pub struct Heartbeat {
    transport: Arc<dyn Transport>,
    config: HeartbeatConfig,
    hostname: String,
}

impl Heartbeat {
    /// Heartbeat posting with an `x-api-key` header.
    pub fn new(config: HeartbeatConfig) -> Result<Self, ClientError> {
        let transport = HttpTransport::new(
            &config.status_url,
            &config.api_key,
            AuthStyle::ApiKey,
            HEARTBEAT_TIMEOUT,
        )?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: HeartbeatConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config,
            hostname: local_hostname(),
        }
    }

    /// Send a single report.
    pub async fn send_once(&self) -> Result<(), ClientError> {
        let report = build_report(&self.config.endpoint_id, &self.hostname, Utc::now());
        let payload = EncodedPayload {
            body: report.to_string().into_bytes(),
            record_count: 0,
            gzip: false,
        };
        self.transport.post(&payload).await
    }

    /// Report until cancelled. Returns the number of accepted reports.
    pub async fn run(&self, cancel: &CancellationToken) -> u64 {
        info!(
            url = %self.transport.endpoint(),
            interval_secs = self.config.interval.as_secs(),
            "Heartbeat started"
        );

        let mut accepted: u64 = 0;
        loop {
            let delay = match self.send_once().await {
                Ok(()) => {
                    if accepted == 0 {
                        info!("Initial status sent");
                    } else {
                        debug!(next_in_secs = self.config.interval.as_secs(), "Status sent");
                    }
                    accepted += 1;
                    self.config.interval
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in_secs = self.config.retry_interval.as_secs(),
                        "Status report failed"
                    );
                    self.config.retry_interval
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(accepted, "Heartbeat stopped");
        accepted
    }
}
