//! Probe Collector Library
//!
//! Components for turning wireless capture output into batches on a remote
//! ingest API:
//!
//! - **config**: Environment-based configuration
//! - **record**: Observations, window summaries and queued records
//! - **extract**: Capture line extraction
//! - **aggregator**: Per-MAC tumbling-window RSSI aggregation
//! - **payload**: JSON envelope and gzip encoding
//! - **client**: HTTP transport with retry and backoff
//! - **shipper**: Bounded-queue batching shipper with a background worker
//! - **pipeline**: Line → observation → summary → shipper driver
//! - **heartbeat**: Periodic liveness reports
//! - **launch**: Scheduled capture start
//!
//! # Example
//!
//! ```no_run
//! use probe_collector::aggregator::{Aggregate, WindowAggregator};
//! use probe_collector::config::Config;
//! use probe_collector::record::Record;
//! use probe_collector::shipper::BatchShipper;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!     let shipper = BatchShipper::new(config.shipper_config()).expect("Failed to create shipper");
//!
//!     // Collect closed windows, then hand them to the shipper
//!     let mut closed = Vec::new();
//!     {
//!         let mut aggregator = WindowAggregator::new(config.window_secs, |s| closed.push(s))
//!             .expect("valid window");
//!         aggregator.add("aa:bb:cc:dd:ee:ff", -48, 1_700_000_000.0, 6);
//!         aggregator.flush_all();
//!     }
//!     for summary in closed {
//!         shipper.add(Record::aggregated(summary)).await;
//!     }
//!
//!     shipper.close().await;
//! }
//! ```

// Module declarations
pub mod aggregator;
pub mod client;
pub mod config;
pub mod extract;
pub mod heartbeat;
pub mod launch;
pub mod payload;
pub mod pipeline;
pub mod record;
pub mod shipper;

// Re-export commonly used types at crate root for convenience
pub use aggregator::{Aggregate, AggregatorError, WindowAggregator};
pub use client::{AuthStyle, ClientError, DeliveryOutcome, HttpTransport, RetryPolicy, Transport};
pub use config::{Config, ConfigError};
pub use extract::parse_line;
pub use payload::{EncodedPayload, PayloadEncoder, PayloadError};
pub use pipeline::{PipelineError, PipelineOptions, PipelineStats};
pub use record::{Observation, Record, Summary};
pub use shipper::{BatchShipper, RecordSink, ShipperConfig, ShipperError, ShipperStats};
