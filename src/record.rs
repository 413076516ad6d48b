//! Record types flowing through the collector.
//!
//! An [`Observation`] is one probe sighting extracted from a capture line, a
//! [`Summary`] is the statistical reduction of one per-MAC window, and a
//! [`Record`] is whatever gets queued for delivery. Every record maps to a
//! JSON object through [`Record::to_wire`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Channel value used when the capture line carried no frequency.
pub const UNKNOWN_CHANNEL: i32 = -1;

/// A single probe sighting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Lowercase hardware address of the transmitter
    #[serde(rename = "mac")]
    pub key: String,

    /// Signal strength in dBm
    #[serde(rename = "rssi")]
    pub value: i32,

    /// Capture timestamp in seconds, as reported by the capture tool
    #[serde(rename = "ts")]
    pub captured_at: f64,

    /// 802.11 channel, or [`UNKNOWN_CHANNEL`]
    #[serde(default = "unknown_channel")]
    pub channel: i32,
}

fn unknown_channel() -> i32 {
    UNKNOWN_CHANNEL
}

impl Observation {
    /// Create an observation with an unknown channel.
    pub fn new(key: impl Into<String>, value: i32, captured_at: f64) -> Self {
        Self {
            key: key.into(),
            value,
            captured_at,
            channel: UNKNOWN_CHANNEL,
        }
    }

    /// Set the channel the observation was captured on.
    pub fn with_channel(mut self, channel: i32) -> Self {
        self.channel = channel;
        self
    }

    /// Wire form: `{"mac", "rssi", "ts"}` plus `"channel"` when known.
    fn to_wire(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("mac".to_string(), json!(self.key));
        map.insert("rssi".to_string(), json!(self.value));
        map.insert("ts".to_string(), json!(self.captured_at));
        if self.channel != UNKNOWN_CHANNEL {
            map.insert("channel".to_string(), json!(self.channel));
        }
        map
    }
}

/// Statistical summary of one closed per-MAC window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    #[serde(rename = "mac")]
    pub key: String,

    /// Timestamp of the first sample in the window
    pub first_seen: f64,

    /// Timestamp of the most recently added sample
    pub last_seen: f64,

    pub sample_count: usize,

    #[serde(rename = "median_rssi")]
    pub median_value: f64,

    #[serde(rename = "avg_rssi")]
    pub mean_value: f64,

    /// Population standard deviation, 0.0 for a single sample
    #[serde(rename = "rssi_stddev")]
    pub stddev_value: f64,

    /// Channel of the last sample appended to the window
    pub last_channel: i32,

    /// Configured window length in milliseconds
    #[serde(rename = "window_ms")]
    pub window_duration_ms: u64,

    pub aggregated: bool,
}

impl Summary {
    /// Median signal rounded half-to-even, as downstream consumers expect an integer.
    pub fn rounded_median(&self) -> i64 {
        self.median_value.round_ties_even() as i64
    }
}

/// A record queued for delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Per-packet observation, sent without aggregation
    Raw(Observation),

    /// Window summary in the three-field compatibility shape
    Aggregated {
        summary: Summary,
        /// Also attach the full summary under a nested `summary` object
        with_metadata: bool,
    },

    /// Arbitrary caller-built object, sent as is
    Fields(Map<String, Value>),
}

impl Record {
    /// Compatibility record for a summary, without metadata.
    pub fn aggregated(summary: Summary) -> Self {
        Record::Aggregated {
            summary,
            with_metadata: false,
        }
    }

    /// Map this record to the JSON object placed in the `records` array.
    pub fn to_wire(&self) -> Map<String, Value> {
        match self {
            Record::Raw(observation) => observation.to_wire(),
            Record::Aggregated {
                summary,
                with_metadata,
            } => {
                let mut map = Map::new();
                map.insert("mac".to_string(), json!(summary.key));
                map.insert("rssi".to_string(), json!(summary.rounded_median()));
                map.insert("timestamp".to_string(), json!(summary.last_seen));
                if *with_metadata {
                    let meta = serde_json::to_value(summary).unwrap_or(Value::Null);
                    map.insert("summary".to_string(), meta);
                }
                map
            }
            Record::Fields(fields) => fields.clone(),
        }
    }
}

impl From<Observation> for Record {
    fn from(observation: Observation) -> Self {
        Record::Raw(observation)
    }
}

impl From<Summary> for Record {
    fn from(summary: Summary) -> Self {
        Record::aggregated(summary)
    }
}
