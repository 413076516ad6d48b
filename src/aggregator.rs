//! Per-MAC tumbling-window aggregation of RSSI samples.
//!
//! Each MAC address gets at most one open window. A window closes when a
//! sample arrives at least `window_length` after the window's first sample,
//! when [`WindowAggregator::flush_expired`] is called with a reference time that
//! far past it, or unconditionally on [`WindowAggregator::flush_all`]. Closing
//! emits one [`Summary`] to the sink and forgets the window.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::trace;

use crate::record::Summary;

/// Default aggregation window in seconds.
pub const DEFAULT_WINDOW_SECS: f64 = 2.0;

/// The operations a pipeline needs from an aggregator.
pub trait Aggregate {
    /// Feed one sample; may close and emit the key's window.
    fn add(&mut self, key: &str, value: i32, ts: f64, channel: i32);

    /// Close every window whose age at `reference_ts` reached the window
    /// length. `None` means the current wall-clock time.
    fn flush_expired(&mut self, reference_ts: Option<f64>);

    /// Close every open window regardless of age.
    fn flush_all(&mut self);
}

/// Errors raised when constructing an aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorError {
    /// Window length was zero, negative or not finite
    InvalidWindow(f64),
}

impl std::fmt::Display for AggregatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregatorError::InvalidWindow(secs) => {
                write!(f, "window length must be a positive number of seconds, got {}", secs)
            }
        }
    }
}

impl std::error::Error for AggregatorError {}

#[derive(Debug)]
struct WindowState {
    first_ts: f64,
    last_ts: f64,
    /// (ts, value, channel) in arrival order
    samples: Vec<(f64, i32, i32)>,
}

impl WindowState {
    fn open(ts: f64) -> Self {
        Self {
            first_ts: ts,
            last_ts: ts,
            samples: Vec::new(),
        }
    }
}

/// Windowed aggregator emitting one [`Summary`] per closed window.
///
/// Not internally synchronized; callers sharing it across tasks must wrap it
/// in a lock.
pub struct WindowAggregator<F>
where
    F: FnMut(Summary),
{
    window_length: f64,
    emit: F,
    windows: HashMap<String, WindowState>,
}

impl<F> WindowAggregator<F>
where
    F: FnMut(Summary),
{
    /// Create an aggregator with a window of `window_secs` seconds.
    pub fn new(window_secs: f64, emit: F) -> Result<Self, AggregatorError> {
        if !window_secs.is_finite() || window_secs <= 0.0 {
            return Err(AggregatorError::InvalidWindow(window_secs));
        }

        Ok(Self {
            window_length: window_secs,
            emit,
            windows: HashMap::new(),
        })
    }

    /// Window length in seconds.
    pub fn window_length(&self) -> f64 {
        self.window_length
    }

    /// Number of windows currently open.
    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    /// Whether a window is open for `key`.
    pub fn is_open(&self, key: &str) -> bool {
        self.windows.contains_key(key)
    }

    fn close(&mut self, key: &str) {
        let Some(state) = self.windows.remove(key) else {
            return;
        };
        let Some(&(_, _, last_channel)) = state.samples.last() else {
            return;
        };

        let values: Vec<f64> = state.samples.iter().map(|&(_, v, _)| v as f64).collect();
        let mean_value = mean(&values);
        let stddev_value = if values.len() > 1 {
            population_std_dev(&values, mean_value)
        } else {
            0.0
        };

        let summary = Summary {
            key: key.to_string(),
            first_seen: state.first_ts,
            last_seen: state.last_ts,
            sample_count: values.len(),
            median_value: median(values),
            mean_value,
            stddev_value,
            last_channel,
            window_duration_ms: (self.window_length * 1000.0) as u64,
            aggregated: true,
        };

        trace!(
            mac = %summary.key,
            samples = summary.sample_count,
            median = summary.median_value,
            "Window closed"
        );

        (self.emit)(summary);
    }
}

impl<F> Aggregate for WindowAggregator<F>
where
    F: FnMut(Summary),
{
    fn add(&mut self, key: &str, value: i32, ts: f64, channel: i32) {
        let state = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowState::open(ts));

        state.samples.push((ts, value, channel));
        state.last_ts = ts;

        if ts - state.first_ts >= self.window_length {
            self.close(key);
        }
    }

    fn flush_expired(&mut self, reference_ts: Option<f64>) {
        let now = reference_ts.unwrap_or_else(wall_clock_secs);

        let expired: Vec<String> = self
            .windows
            .iter()
            .filter(|(_, state)| now - state.first_ts >= self.window_length)
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            self.close(&key);
        }
    }

    fn flush_all(&mut self) {
        let keys: Vec<String> = self.windows.keys().cloned().collect();
        for key in keys {
            self.close(&key);
        }
    }
}

fn wall_clock_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn population_std_dev(values: &[f64], mean: f64) -> f64 {
    let variance = values.iter().map(|&v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}
