//! Batching shipper with a bounded queue and a background sender.
//!
//! Producers hand records to [`BatchShipper::add`], which places them on a
//! bounded tokio mpsc queue. A single background worker moves queued records
//! into the live batch and sends it when the batch reaches `batch_size`, when
//! `flush_interval` has passed since the last send, or when a caller forces a
//! flush. Delivery retries transient failures with capped exponential backoff
//! and drops a batch that fails permanently.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{deliver, AuthStyle, ClientError, DeliveryOutcome, HttpTransport, RetryPolicy, Transport};
use crate::payload::PayloadEncoder;
use crate::record::Record;

/// Default number of records per batch.
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Default time between sends when the batch stays below `batch_size`.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Default capacity of the delivery queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// How long `add` waits for queue space before rejecting a record.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `close` waits for the worker before flushing itself.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Worker poll on the queue; bounds reaction time to cancellation and timers.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for a [`BatchShipper`].
#[derive(Debug, Clone)]
pub struct ShipperConfig {
    /// Full ingest URL the batches are POSTed to
    pub server_url: String,

    /// API key or bearer token
    pub api_key: String,

    pub auth_style: AuthStyle,

    /// Number of records that triggers a send
    pub batch_size: usize,

    /// Maximum time between sends while records are pending
    pub flush_interval: Duration,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Attempt budget and backoff
    pub retry: RetryPolicy,

    /// Gzip request bodies
    pub use_gzip: bool,

    /// Identifier of this endpoint
    pub endpoint_id: Option<String>,

    /// Stamp `endpoint_id` on every record
    pub include_endpoint_in_records: bool,

    /// Send `endpointId` at the envelope's top level
    pub include_endpoint_top_level: bool,

    /// Send timestamps as `YYYY-MM-DDTHH:MM:SSZ` text
    pub timestamp_as_text: bool,

    /// Capacity of the delivery queue
    pub queue_capacity: usize,

    /// Backpressure limit for `add`
    pub enqueue_timeout: Duration,

    /// Bound on waiting for the worker in `close`
    pub close_timeout: Duration,
}

impl ShipperConfig {
    /// Create a config with default thresholds for the given endpoint.
    pub fn new(server_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            api_key: api_key.into(),
            auth_style: AuthStyle::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
            use_gzip: false,
            endpoint_id: None,
            include_endpoint_in_records: true,
            include_endpoint_top_level: true,
            timestamp_as_text: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// Check the settings a shipper cannot run without.
    pub fn validate(&self) -> Result<(), ShipperError> {
        if self.server_url.trim().is_empty() {
            return Err(ShipperError::invalid("server_url", "is required"));
        }
        if self.api_key.is_empty() {
            return Err(ShipperError::invalid("api_key", "is required"));
        }
        if self.batch_size == 0 {
            return Err(ShipperError::invalid("batch_size", "must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ShipperError::invalid("max_attempts", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(ShipperError::invalid("queue_capacity", "must be greater than 0"));
        }
        Ok(())
    }

    fn encoder(&self) -> PayloadEncoder {
        PayloadEncoder {
            endpoint_id: self.endpoint_id.clone().filter(|id| !id.is_empty()),
            include_endpoint_in_records: self.include_endpoint_in_records,
            include_endpoint_top_level: self.include_endpoint_top_level,
            timestamp_as_text: self.timestamp_as_text,
            gzip: self.use_gzip,
        }
    }
}

/// Errors raised when constructing a shipper.
#[derive(Debug)]
pub enum ShipperError {
    /// A required setting is missing or out of range
    InvalidConfig { field: &'static str, message: String },

    /// The HTTP transport could not be built
    Client(ClientError),
}

impl ShipperError {
    fn invalid(field: &'static str, message: &str) -> Self {
        ShipperError::InvalidConfig {
            field,
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for ShipperError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShipperError::InvalidConfig { field, message } => {
                write!(f, "Invalid shipper config: {} {}", field, message)
            }
            ShipperError::Client(e) => write!(f, "Failed to create HTTP client: {}", e),
        }
    }
}

impl std::error::Error for ShipperError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShipperError::Client(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ClientError> for ShipperError {
    fn from(err: ClientError) -> Self {
        ShipperError::Client(err)
    }
}

/// Statistics about shipper operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShipperStats {
    /// Records accepted onto the queue
    pub records_enqueued: u64,

    /// Records refused because the queue stayed full past the enqueue timeout
    pub records_rejected: u64,

    pub batches_sent: u64,
    pub records_sent: u64,

    /// Batches abandoned after a permanent failure or exhausted retries
    pub batches_dropped: u64,
    pub records_dropped: u64,

    /// HTTP requests issued, retries included
    pub send_attempts: u64,

    pub size_flushes: u64,
    pub time_flushes: u64,
    pub forced_flushes: u64,
}

#[derive(Default)]
struct Counters {
    records_enqueued: AtomicU64,
    records_rejected: AtomicU64,
    batches_sent: AtomicU64,
    records_sent: AtomicU64,
    batches_dropped: AtomicU64,
    records_dropped: AtomicU64,
    send_attempts: AtomicU64,
    size_flushes: AtomicU64,
    time_flushes: AtomicU64,
    forced_flushes: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ShipperStats {
        ShipperStats {
            records_enqueued: self.records_enqueued.load(Ordering::Relaxed),
            records_rejected: self.records_rejected.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            records_sent: self.records_sent.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            send_attempts: self.send_attempts.load(Ordering::Relaxed),
            size_flushes: self.size_flushes.load(Ordering::Relaxed),
            time_flushes: self.time_flushes.load(Ordering::Relaxed),
            forced_flushes: self.forced_flushes.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// Why a batch left the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Forced,
    Size,
    Time,
}

struct Batch {
    records: Vec<Record>,
    last_flush: Instant,
}

/// State shared between the shipper handle and its worker.
struct Shared {
    queue: tokio::sync::Mutex<mpsc::Receiver<Record>>,

    /// The live batch. Locked only to append or to snapshot-and-clear.
    batch: Mutex<Batch>,

    /// Serializes sends so batches leave in formation order.
    send_lock: tokio::sync::Mutex<()>,

    transport: Arc<dyn Transport>,
    encoder: PayloadEncoder,
    retry: RetryPolicy,
    batch_size: usize,
    flush_interval: Duration,
    counters: Counters,
}

impl Shared {
    fn batch(&self) -> MutexGuard<'_, Batch> {
        self.batch.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn batch_full(&self) -> bool {
        self.batch().records.len() >= self.batch_size
    }

    /// Wait briefly for queued records and move them into the batch.
    ///
    /// A full batch takes nothing more; records stay in the bounded queue.
    /// Returns `false` once the worker should stop.
    async fn pull(&self, token: &CancellationToken) -> bool {
        if self.batch_full() {
            return !token.is_cancelled();
        }

        let mut rx = self.queue.lock().await;

        tokio::select! {
            _ = token.cancelled() => false,
            received = tokio::time::timeout(POLL_INTERVAL, rx.recv()) => match received {
                Ok(Some(record)) => {
                    let mut batch = self.batch();
                    batch.records.push(record);
                    while batch.records.len() < self.batch_size {
                        match rx.try_recv() {
                            Ok(record) => batch.records.push(record),
                            Err(_) => break,
                        }
                    }
                    true
                }
                // Every sender is gone
                Ok(None) => false,
                Err(_) => true,
            },
        }
    }

    /// Move everything currently queued into the batch.
    async fn drain_queue(&self) {
        let mut rx = self.queue.lock().await;
        let mut batch = self.batch();
        while let Ok(record) = rx.try_recv() {
            batch.records.push(record);
        }
    }

    /// Send the batch if a trigger fired.
    async fn send_if_needed(&self, force: bool) {
        let _sending = match self.send_lock.try_lock() {
            Ok(guard) => guard,
            // A full batch waits out the send in flight
            Err(_) if force || self.batch_full() => self.send_lock.lock().await,
            // Otherwise keep accumulating
            Err(_) => return,
        };

        let (records, trigger) = {
            let mut batch = self.batch();
            let now = Instant::now();

            if batch.records.is_empty() {
                if force {
                    batch.last_flush = now;
                }
                return;
            }

            let trigger = if force {
                FlushTrigger::Forced
            } else if batch.records.len() >= self.batch_size {
                FlushTrigger::Size
            } else if now.duration_since(batch.last_flush) >= self.flush_interval {
                FlushTrigger::Time
            } else {
                return;
            };

            batch.last_flush = now;
            (std::mem::take(&mut batch.records), trigger)
        };

        match trigger {
            FlushTrigger::Forced => bump(&self.counters.forced_flushes, 1),
            FlushTrigger::Size => bump(&self.counters.size_flushes, 1),
            FlushTrigger::Time => bump(&self.counters.time_flushes, 1),
        }
        debug!(batch_size = records.len(), trigger = ?trigger, "Flushing batch");

        self.ship(records).await;
    }

    async fn ship(&self, records: Vec<Record>) {
        let count = records.len() as u64;

        let payload = match self.encoder.encode(&records) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, records = count, "Dropping batch: payload encoding failed");
                bump(&self.counters.batches_dropped, 1);
                bump(&self.counters.records_dropped, count);
                return;
            }
        };

        let outcome = deliver(self.transport.as_ref(), &payload, &self.retry).await;
        bump(&self.counters.send_attempts, outcome.attempts() as u64);

        match outcome {
            DeliveryOutcome::Delivered { .. } => {
                bump(&self.counters.batches_sent, 1);
                bump(&self.counters.records_sent, count);
            }
            DeliveryOutcome::Dropped { .. } => {
                bump(&self.counters.batches_dropped, 1);
                bump(&self.counters.records_dropped, count);
            }
        }
    }

    /// Drain the queue and send whatever is pending.
    async fn flush(&self) {
        self.drain_queue().await;
        self.send_if_needed(true).await;
    }
}

/// Anything records can be handed to for delivery.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn add(&self, record: Record);

    /// Deliver everything handed over so far.
    async fn flush(&self);
}

/// Batching HTTP shipper.
///
/// Must be created inside a tokio runtime; construction spawns the worker.
///
/// # Example
///
/// ```no_run
/// use probe_collector::record::{Observation, Record};
/// use probe_collector::shipper::{BatchShipper, ShipperConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let config = ShipperConfig::new("https://collector.example/api/endpoint/scan-data", "key");
///     let shipper = BatchShipper::new(config).expect("valid config");
///
///     shipper.add(Record::Raw(Observation::new("aa:bb:cc:dd:ee:ff", -42, 1.0))).await;
///     shipper.close().await;
/// }
/// ```
pub struct BatchShipper {
    tx: mpsc::Sender<Record>,
    shared: Arc<Shared>,
    token: CancellationToken,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    enqueue_timeout: Duration,
    close_timeout: Duration,
}

impl BatchShipper {
    /// Create a shipper posting over HTTP.
    ///
    /// # Errors
    ///
    /// Returns `ShipperError` if a required setting is missing or the HTTP
    /// client cannot be built.
    pub fn new(config: ShipperConfig) -> Result<Self, ShipperError> {
        config.validate()?;
        let transport = HttpTransport::new(
            &config.server_url,
            &config.api_key,
            config.auth_style,
            config.request_timeout,
        )?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a shipper over any transport.
    pub fn with_transport(config: ShipperConfig, transport: Arc<dyn Transport>) -> Result<Self, ShipperError> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let shared = Arc::new(Shared {
            queue: tokio::sync::Mutex::new(rx),
            batch: Mutex::new(Batch {
                records: Vec::with_capacity(config.batch_size),
                last_flush: Instant::now(),
            }),
            send_lock: tokio::sync::Mutex::new(()),
            transport,
            encoder: config.encoder(),
            retry: config.retry,
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
            counters: Counters::default(),
        });

        let token = CancellationToken::new();
        let worker = tokio::spawn(supervise_worker(shared.clone(), token.clone()));

        info!(
            url = %shared.transport.endpoint(),
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            max_attempts = config.retry.max_attempts,
            gzip = config.use_gzip,
            "Shipper started"
        );

        Ok(Self {
            tx,
            shared,
            token,
            closed: AtomicBool::new(false),
            worker: Mutex::new(Some(worker)),
            enqueue_timeout: config.enqueue_timeout,
            close_timeout: config.close_timeout,
        })
    }

    /// Queue a record for delivery.
    ///
    /// Waits up to the enqueue timeout when the queue is full; a record that
    /// still does not fit is rejected with a warning. After [`close`] this
    /// does nothing.
    ///
    /// [`close`]: BatchShipper::close
    pub async fn add(&self, record: Record) {
        if self.closed.load(Ordering::Acquire) {
            debug!("Shipper closed, ignoring record");
            return;
        }

        match self.tx.send_timeout(record, self.enqueue_timeout).await {
            Ok(()) => bump(&self.shared.counters.records_enqueued, 1),
            Err(SendTimeoutError::Timeout(_)) => {
                bump(&self.shared.counters.records_rejected, 1);
                warn!(
                    timeout_ms = self.enqueue_timeout.as_millis() as u64,
                    "Delivery queue full, record rejected"
                );
            }
            Err(SendTimeoutError::Closed(_)) => {
                debug!("Delivery queue closed, ignoring record");
            }
        }
    }

    /// Drain the queue and send everything pending now.
    ///
    /// Returns once the send (including retries) has finished.
    pub async fn flush(&self) {
        self.shared.flush().await;
    }

    /// Stop the worker and flush what is left.
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.token.cancel();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            match tokio::time::timeout(self.close_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Shipper worker failed during shutdown"),
                Err(_) => warn!(
                    timeout_ms = self.close_timeout.as_millis() as u64,
                    "Shipper worker shutdown timed out"
                ),
            }
        }

        self.shared.flush().await;

        let stats = self.stats();
        info!(
            batches_sent = stats.batches_sent,
            records_sent = stats.records_sent,
            batches_dropped = stats.batches_dropped,
            records_dropped = stats.records_dropped,
            records_rejected = stats.records_rejected,
            "Shipper closed"
        );
    }

    /// Whether [`close`](BatchShipper::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Records queued or in the live batch, not yet handed to the transport.
    pub fn pending(&self) -> usize {
        let queued = self.tx.max_capacity() - self.tx.capacity();
        queued + self.shared.batch().records.len()
    }

    /// Get current shipper statistics.
    pub fn stats(&self) -> ShipperStats {
        self.shared.counters.snapshot()
    }
}

impl Drop for BatchShipper {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[async_trait]
impl RecordSink for BatchShipper {
    async fn add(&self, record: Record) {
        BatchShipper::add(self, record).await;
    }

    async fn flush(&self) {
        BatchShipper::flush(self).await;
    }
}

/// Run the worker loop, then always attempt a final flush.
async fn supervise_worker(shared: Arc<Shared>, token: CancellationToken) {
    let run = tokio::spawn(worker_loop(shared.clone(), token));
    if let Err(e) = run.await {
        error!(error = %e, "Shipper worker crashed");
    }

    shared.flush().await;
    debug!("Shipper worker stopped");
}

async fn worker_loop(shared: Arc<Shared>, token: CancellationToken) {
    while !token.is_cancelled() {
        if !shared.pull(&token).await {
            break;
        }
        shared.send_if_needed(false).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::ScriptedTransport;
    use crate::payload::EncodedPayload;
    use serde_json::{json, Value};

    fn test_config() -> ShipperConfig {
        ShipperConfig {
            flush_interval: Duration::from_secs(60),
            retry: RetryPolicy {
                max_attempts: 5,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
            },
            ..ShipperConfig::new("http://collector.test/ingest", "test-key")
        }
    }

    fn seq_record(seq: u64) -> Record {
        match json!({"mac": "aa:bb:cc:dd:ee:ff", "rssi": -50, "seq": seq}) {
            Value::Object(map) => Record::Fields(map),
            _ => unreachable!(),
        }
    }

    fn seqs(body: &Value) -> Vec<u64> {
        body["records"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["seq"].as_u64().unwrap())
            .collect()
    }

    async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_config_validation() {
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::always(200));

        let cases = [
            ShipperConfig::new("", "key"),
            ShipperConfig::new("http://collector.test", ""),
            ShipperConfig {
                batch_size: 0,
                ..test_config()
            },
            ShipperConfig {
                queue_capacity: 0,
                ..test_config()
            },
            ShipperConfig {
                retry: RetryPolicy {
                    max_attempts: 0,
                    ..RetryPolicy::default()
                },
                ..test_config()
            },
        ];
        for config in cases {
            let result = BatchShipper::with_transport(config, transport.clone());
            assert!(matches!(result, Err(ShipperError::InvalidConfig { .. })));
        }

        assert!(BatchShipper::new(ShipperConfig::new("http://collector.test/ingest", "key")).is_ok());
    }

    #[test]
    fn test_shipper_error_display() {
        let err = ShipperError::invalid("api_key", "is required");
        assert_eq!(format!("{}", err), "Invalid shipper config: api_key is required");
    }

    #[tokio::test]
    async fn test_flush_sends_all_records_in_order() {
        let transport = Arc::new(ScriptedTransport::always(200));
        let shipper = BatchShipper::with_transport(test_config(), transport.clone()).unwrap();

        for seq in 0..5 {
            shipper.add(seq_record(seq)).await;
        }
        shipper.flush().await;

        assert_eq!(transport.request_count(), 1);
        assert_eq!(seqs(&transport.bodies()[0]), vec![0, 1, 2, 3, 4]);

        let stats = shipper.stats();
        assert_eq!(stats.records_enqueued, 5);
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.records_sent, 5);
        assert_eq!(stats.forced_flushes, 1);
        assert_eq!(shipper.pending(), 0);

        shipper.close().await;
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_flush_with_nothing_pending() {
        let transport = Arc::new(ScriptedTransport::always(200));
        let shipper = BatchShipper::with_transport(test_config(), transport.clone()).unwrap();

        shipper.flush().await;
        shipper.close().await;

        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_size_threshold_triggers_send() {
        let transport = Arc::new(ScriptedTransport::always(200));
        let config = ShipperConfig {
            batch_size: 3,
            ..test_config()
        };
        let shipper = BatchShipper::with_transport(config, transport.clone()).unwrap();

        for seq in 0..7 {
            shipper.add(seq_record(seq)).await;
        }

        let t = transport.clone();
        assert!(wait_until(move || t.request_count() >= 2, Duration::from_secs(2)).await);
        assert_eq!(shipper.stats().size_flushes, 2);

        shipper.close().await;

        let bodies = transport.bodies();
        assert_eq!(bodies.len(), 3);
        assert_eq!(seqs(&bodies[0]), vec![0, 1, 2]);
        assert_eq!(seqs(&bodies[1]), vec![3, 4, 5]);
        assert_eq!(seqs(&bodies[2]), vec![6]);
    }

    #[tokio::test]
    async fn test_time_threshold_triggers_send() {
        let transport = Arc::new(ScriptedTransport::always(200));
        let config = ShipperConfig {
            flush_interval: Duration::from_millis(50),
            ..test_config()
        };
        let shipper = BatchShipper::with_transport(config, transport.clone()).unwrap();

        shipper.add(seq_record(1)).await;
        shipper.add(seq_record(2)).await;

        let t = transport.clone();
        assert!(wait_until(move || t.request_count() == 1, Duration::from_secs(2)).await);
        assert_eq!(seqs(&transport.bodies()[0]), vec![1, 2]);
        assert!(shipper.stats().time_flushes >= 1);

        shipper.close().await;
    }

    #[tokio::test]
    async fn test_persistent_server_errors_drop_batch() {
        let transport = Arc::new(ScriptedTransport::new(&[500, 500, 500], 500));
        let shipper = BatchShipper::with_transport(test_config(), transport.clone()).unwrap();

        shipper.add(seq_record(1)).await;
        shipper.flush().await;

        assert_eq!(transport.request_count(), 5);
        let stats = shipper.stats();
        assert_eq!(stats.send_attempts, 5);
        assert_eq!(stats.batches_dropped, 1);
        assert_eq!(stats.records_dropped, 1);
        assert_eq!(stats.batches_sent, 0);

        // Dropped records are not merged into the next batch
        shipper.add(seq_record(2)).await;
        shipper.flush().await;
        let bodies = transport.bodies();
        assert_eq!(seqs(bodies.last().unwrap()), vec![2]);

        shipper.close().await;
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(&[400], 200));
        let shipper = BatchShipper::with_transport(test_config(), transport.clone()).unwrap();

        shipper.add(seq_record(1)).await;
        shipper.flush().await;

        assert_eq!(transport.request_count(), 1);
        assert_eq!(shipper.stats().batches_dropped, 1);

        shipper.close().await;
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_then_success() {
        let transport = Arc::new(ScriptedTransport::new(&[503, 429], 200));
        let shipper = BatchShipper::with_transport(test_config(), transport.clone()).unwrap();

        shipper.add(seq_record(1)).await;
        shipper.flush().await;

        // Every retry carries the same batch
        let bodies = transport.bodies();
        assert_eq!(bodies.len(), 3);
        assert!(bodies.iter().all(|b| seqs(b) == vec![1]));
        assert_eq!(shipper.stats().batches_sent, 1);

        shipper.close().await;
    }

    #[tokio::test]
    async fn test_close_flushes_and_add_becomes_noop() {
        let transport = Arc::new(ScriptedTransport::always(200));
        let shipper = BatchShipper::with_transport(test_config(), transport.clone()).unwrap();

        shipper.add(seq_record(1)).await;
        shipper.add(seq_record(2)).await;
        shipper.close().await;

        assert!(shipper.is_closed());
        assert_eq!(transport.request_count(), 1);
        assert_eq!(seqs(&transport.bodies()[0]), vec![1, 2]);

        shipper.add(seq_record(3)).await;
        shipper.close().await;
        assert_eq!(transport.request_count(), 1);
        assert_eq!(shipper.stats().records_enqueued, 2);
    }

    #[tokio::test]
    async fn test_payload_carries_endpoint_and_text_timestamps() {
        let transport = Arc::new(ScriptedTransport::always(200));
        let config = ShipperConfig {
            endpoint_id: Some("ep-7".to_string()),
            timestamp_as_text: true,
            ..test_config()
        };
        let shipper = BatchShipper::with_transport(config, transport.clone()).unwrap();

        shipper
            .add(Record::Raw(crate::record::Observation::new("aa:bb:cc:dd:ee:ff", -40, 0.0)))
            .await;
        shipper.close().await;

        let body = &transport.bodies()[0];
        assert_eq!(body["endpointId"], "ep-7");
        assert_eq!(body["records"][0]["endpoint_id"], "ep-7");
        assert_eq!(body["records"][0]["timestamp"], "1970-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_concurrent_producers_keep_per_producer_order() {
        let transport = Arc::new(ScriptedTransport::always(200));
        let config = ShipperConfig {
            batch_size: 16,
            ..test_config()
        };
        let shipper = Arc::new(BatchShipper::with_transport(config, transport.clone()).unwrap());

        let mut producers = Vec::new();
        for producer in 0..4u64 {
            let shipper = shipper.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..25u64 {
                    shipper.add(seq_record(producer * 1000 + i)).await;
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        shipper.close().await;

        let all: Vec<u64> = transport.bodies().iter().flat_map(seqs).collect();
        assert_eq!(all.len(), 100);
        for producer in 0..4u64 {
            let mine: Vec<u64> = all.iter().copied().filter(|s| s / 1000 == producer).collect();
            let expected: Vec<u64> = (0..25).map(|i| producer * 1000 + i).collect();
            assert_eq!(mine, expected);
        }
        assert_eq!(shipper.stats().records_sent, 100);
    }

    /// Transport that takes a while to answer 200.
    struct SlowTransport {
        delay: Duration,
        records: Mutex<usize>,
    }

    #[async_trait]
    impl Transport for SlowTransport {
        async fn post(&self, payload: &EncodedPayload) -> Result<(), ClientError> {
            tokio::time::sleep(self.delay).await;
            *self.records.lock().unwrap() += payload.record_count;
            Ok(())
        }

        fn endpoint(&self) -> &str {
            "slow://collector"
        }
    }

    #[tokio::test]
    async fn test_batch_stays_bounded_while_flush_in_flight() {
        let transport = Arc::new(SlowTransport {
            delay: Duration::from_millis(200),
            records: Mutex::new(0),
        });
        let config = ShipperConfig {
            batch_size: 2,
            close_timeout: Duration::from_secs(5),
            ..test_config()
        };
        let shipper = Arc::new(BatchShipper::with_transport(config, transport.clone()).unwrap());

        shipper.add(seq_record(0)).await;
        let flushing = {
            let shipper = shipper.clone();
            tokio::spawn(async move { shipper.flush().await })
        };
        assert!(
            wait_until(|| shipper.shared.send_lock.try_lock().is_err(), Duration::from_secs(1)).await,
            "flush never started sending"
        );

        for seq in 1..=20 {
            shipper.add(seq_record(seq)).await;
        }

        // Sample the live batch while the first send is still in flight
        for _ in 0..10 {
            let live = shipper.shared.batch().records.len();
            assert!(live <= 2, "live batch grew to {}", live);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        flushing.await.unwrap();
        shipper.close().await;

        assert_eq!(*transport.records.lock().unwrap(), 21);
        let stats = shipper.stats();
        assert_eq!(stats.records_sent, 21);
        assert_eq!(stats.records_rejected, 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_after_timeout() {
        let transport = Arc::new(SlowTransport {
            delay: Duration::from_millis(200),
            records: Mutex::new(0),
        });
        let config = ShipperConfig {
            batch_size: 1,
            queue_capacity: 1,
            enqueue_timeout: Duration::from_millis(20),
            close_timeout: Duration::from_secs(2),
            ..test_config()
        };
        let shipper = BatchShipper::with_transport(config, transport.clone()).unwrap();

        shipper.add(seq_record(1)).await;
        // Let the worker pick it up and block in the slow send
        tokio::time::sleep(Duration::from_millis(50)).await;

        shipper.add(seq_record(2)).await; // fills the queue
        shipper.add(seq_record(3)).await; // waits 20ms, then rejected

        let stats = shipper.stats();
        assert_eq!(stats.records_enqueued, 2);
        assert_eq!(stats.records_rejected, 1);

        shipper.close().await;
        assert_eq!(*transport.records.lock().unwrap(), 2);
    }
}
