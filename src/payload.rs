//! Wire payload construction for batch delivery.
//!
//! A batch of [`Record`]s becomes one JSON envelope,
//! `{"records": [...], "endpointId": "..."}`, optionally gzip-compressed.

use std::io::Write;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{Map, Value};

use crate::record::Record;

/// Per-record key carrying the endpoint identifier.
pub const RECORD_ENDPOINT_KEY: &str = "endpoint_id";

/// Envelope key carrying the endpoint identifier.
pub const ENVELOPE_ENDPOINT_KEY: &str = "endpointId";

/// Calendar format used when timestamps are sent as text.
const TIMESTAMP_TEXT_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Errors raised while encoding a payload.
#[derive(Debug)]
pub enum PayloadError {
    /// JSON serialization failed
    Serialize(serde_json::Error),

    /// Gzip compression failed
    Compress(std::io::Error),
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadError::Serialize(e) => write!(f, "Failed to serialize payload: {}", e),
            PayloadError::Compress(e) => write!(f, "Failed to compress payload: {}", e),
        }
    }
}

impl std::error::Error for PayloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PayloadError::Serialize(e) => Some(e),
            PayloadError::Compress(e) => Some(e),
        }
    }
}

impl From<serde_json::Error> for PayloadError {
    fn from(err: serde_json::Error) -> Self {
        PayloadError::Serialize(err)
    }
}

impl From<std::io::Error> for PayloadError {
    fn from(err: std::io::Error) -> Self {
        PayloadError::Compress(err)
    }
}

/// An encoded request body ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPayload {
    pub body: Vec<u8>,

    /// Number of records in the envelope
    pub record_count: usize,

    /// Whether `body` is gzip-compressed
    pub gzip: bool,
}

impl EncodedPayload {
    /// Value for the `Content-Encoding` header, if any.
    pub fn content_encoding(&self) -> Option<&'static str> {
        self.gzip.then_some("gzip")
    }
}

/// Builds request bodies from batches of records.
#[derive(Debug, Clone, Default)]
pub struct PayloadEncoder {
    /// Identifier of this endpoint, stamped onto records and/or the envelope
    pub endpoint_id: Option<String>,

    /// Inject `endpoint_id` into each record
    pub include_endpoint_in_records: bool,

    /// Add `endpointId` at the envelope's top level
    pub include_endpoint_top_level: bool,

    /// Rewrite numeric timestamps to `YYYY-MM-DDTHH:MM:SSZ`
    pub timestamp_as_text: bool,

    /// Gzip the serialized body
    pub gzip: bool,
}

impl PayloadEncoder {
    /// Rewrite a single record into its outgoing form.
    pub fn prepare_record(&self, record: &Record) -> Map<String, Value> {
        let mut map = record.to_wire();

        if !map.contains_key("timestamp") {
            if let Some(ts) = map.remove("ts") {
                map.insert("timestamp".to_string(), ts);
            }
        }

        if self.timestamp_as_text {
            let text = map
                .get("timestamp")
                .and_then(Value::as_f64)
                .and_then(timestamp_text);
            if let Some(text) = text {
                map.insert("timestamp".to_string(), Value::String(text));
            }
        }

        if let Some(endpoint_id) = &self.endpoint_id {
            if self.include_endpoint_in_records && !map.contains_key(RECORD_ENDPOINT_KEY) {
                map.insert(
                    RECORD_ENDPOINT_KEY.to_string(),
                    Value::String(endpoint_id.clone()),
                );
                map.remove(ENVELOPE_ENDPOINT_KEY);
            }
        }

        map
    }

    /// Build the JSON envelope for a batch.
    pub fn envelope(&self, records: &[Record]) -> Value {
        let prepared: Vec<Value> = records
            .iter()
            .map(|r| Value::Object(self.prepare_record(r)))
            .collect();

        let mut envelope = Map::new();
        envelope.insert("records".to_string(), Value::Array(prepared));
        if let Some(endpoint_id) = &self.endpoint_id {
            if self.include_endpoint_top_level {
                envelope.insert(
                    ENVELOPE_ENDPOINT_KEY.to_string(),
                    Value::String(endpoint_id.clone()),
                );
            }
        }
        Value::Object(envelope)
    }

    /// Serialize (and optionally compress) a batch into a request body.
    pub fn encode(&self, records: &[Record]) -> Result<EncodedPayload, PayloadError> {
        let json = serde_json::to_vec(&self.envelope(records))?;

        let body = if self.gzip {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&json)?;
            encoder.finish()?
        } else {
            json
        };

        Ok(EncodedPayload {
            body,
            record_count: records.len(),
            gzip: self.gzip,
        })
    }
}

/// Format epoch seconds as a UTC calendar string, truncating sub-seconds.
///
/// Returns `None` for values chrono cannot represent.
pub fn timestamp_text(epoch_secs: f64) -> Option<String> {
    if !epoch_secs.is_finite() {
        return None;
    }
    let secs = epoch_secs.floor();
    if secs < i64::MIN as f64 || secs > i64::MAX as f64 {
        return None;
    }
    DateTime::<Utc>::from_timestamp(secs as i64, 0).map(|dt| dt.format(TIMESTAMP_TEXT_FORMAT).to_string())
}
