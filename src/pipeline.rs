//! Capture stream driver: line → observation → (window summary) → sink.

use std::time::{Duration, Instant};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::aggregator::Aggregate;
use crate::extract::parse_line;
use crate::record::{Observation, Record, Summary};
use crate::shipper::RecordSink;

/// Default interval between progress log lines.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Default interval between expiry checks while the input is quiet.
pub const DEFAULT_IDLE_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// How observations reach the sink.
pub enum Mode<A> {
    /// Every observation is shipped as is
    Raw,

    /// Observations are windowed; closed windows are shipped as summaries
    Aggregated {
        aggregator: A,
        /// Receiving end of the aggregator's emit closure
        summaries: mpsc::UnboundedReceiver<Summary>,
        /// Attach full summary metadata to each record
        with_metadata: bool,
    },
}

/// Build an emit closure that forwards summaries into a channel.
///
/// Pass the closure to `WindowAggregator::new` and the receiver to
/// [`Mode::Aggregated`].
pub fn summary_channel() -> (impl FnMut(Summary) + Send + 'static, mpsc::UnboundedReceiver<Summary>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let emit = move |summary: Summary| {
        // Receiver lives as long as the pipeline; a send after it is gone has nowhere to go.
        let _ = tx.send(summary);
    };
    (emit, rx)
}

/// Optional behavior of [`run`].
pub struct PipelineOptions {
    /// Also write every parsed observation as one JSON line here
    pub tee: Option<Box<dyn AsyncWrite + Unpin + Send>>,

    pub progress_interval: Duration,

    /// How often open windows are checked for expiry between lines
    pub idle_flush_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            tee: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            idle_flush_interval: DEFAULT_IDLE_FLUSH_INTERVAL,
        }
    }
}

/// Counters for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Lines read
    pub seen: u64,

    /// Lines that yielded an observation
    pub parsed: u64,

    /// Lines that did not
    pub skipped: u64,

    /// Records handed to the sink
    pub enqueued: u64,

    /// Window summaries emitted by the aggregator
    pub summaries: u64,
}

/// Errors that end a pipeline run early.
#[derive(Debug)]
pub enum PipelineError {
    /// Reading the input failed
    Read(std::io::Error),

    /// Writing the tee file failed
    Tee(std::io::Error),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Read(e) => write!(f, "Failed to read capture input: {}", e),
            PipelineError::Tee(e) => write!(f, "Failed to write tee file: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Read(e) | PipelineError::Tee(e) => Some(e),
        }
    }
}

/// Drive `input` to completion or cancellation.
///
/// Whatever the outcome, open windows are closed and the sink is flushed
/// before returning, so nothing already read is left behind.
pub async fn run<R, A, S>(
    input: R,
    mut mode: Mode<A>,
    sink: &S,
    mut options: PipelineOptions,
    cancel: &CancellationToken,
) -> Result<PipelineStats, PipelineError>
where
    R: AsyncBufRead + Unpin,
    A: Aggregate,
    S: RecordSink + ?Sized,
{
    let mut stats = PipelineStats::default();
    let result = drive(input, &mut mode, sink, &mut options, cancel, &mut stats).await;

    if let Mode::Aggregated { aggregator, .. } = &mut mode {
        aggregator.flush_all();
    }
    drain_summaries(&mut mode, sink, &mut stats).await;

    if let Some(tee) = options.tee.as_mut() {
        if let Err(e) = tee.flush().await {
            debug!(error = %e, "Failed to flush tee file");
        }
    }

    info!(
        seen = stats.seen,
        parsed = stats.parsed,
        enqueued = stats.enqueued,
        "Stopping stream, flushing remaining records"
    );
    sink.flush().await;

    result.map(|()| stats)
}

async fn drive<R, A, S>(
    mut input: R,
    mode: &mut Mode<A>,
    sink: &S,
    options: &mut PipelineOptions,
    cancel: &CancellationToken,
    stats: &mut PipelineStats,
) -> Result<(), PipelineError>
where
    R: AsyncBufRead + Unpin,
    A: Aggregate,
    S: RecordSink + ?Sized,
{
    let mut buf = Vec::new();
    let mut last_ts: Option<f64> = None;
    let mut last_parsed_at = Instant::now();
    let mut last_progress = Instant::now();

    let mut idle_check = tokio::time::interval(options.idle_flush_interval.max(Duration::from_millis(1)));
    idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // A partial line survives an interrupted read_until in `buf`
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Stream cancelled");
                return Ok(());
            }
            _ = idle_check.tick() => {
                // Data time keeps moving while the input is quiet
                if let (Mode::Aggregated { aggregator, .. }, Some(ts)) = (&mut *mode, last_ts) {
                    aggregator.flush_expired(Some(ts + last_parsed_at.elapsed().as_secs_f64()));
                }
                drain_summaries(mode, sink, stats).await;
                continue;
            }
            read = input.read_until(b'\n', &mut buf) => read.map_err(PipelineError::Read)?,
        };
        if read == 0 && buf.is_empty() {
            return Ok(());
        }

        stats.seen += 1;
        let line = String::from_utf8_lossy(&buf).into_owned();
        buf.clear();

        match parse_line(&line) {
            None => {
                stats.skipped += 1;
                debug!(line = %line.trim_end(), "Skipped line");

                // Unparseable lines still advance data time for idle windows
                if let (Mode::Aggregated { aggregator, .. }, Some(ts)) = (&mut *mode, last_ts) {
                    aggregator.flush_expired(Some(ts));
                }
            }
            Some(observation) => {
                stats.parsed += 1;
                last_ts = Some(observation.captured_at);
                last_parsed_at = Instant::now();

                if let Some(tee) = options.tee.as_mut() {
                    write_tee(tee, &observation).await?;
                }

                match &mut *mode {
                    Mode::Raw => {
                        sink.add(Record::Raw(observation)).await;
                        stats.enqueued += 1;
                    }
                    Mode::Aggregated { aggregator, .. } => {
                        let ts = observation.captured_at;
                        aggregator.add(&observation.key, observation.value, ts, observation.channel);
                        aggregator.flush_expired(Some(ts));
                    }
                }
            }
        }

        drain_summaries(mode, sink, stats).await;

        if last_progress.elapsed() >= options.progress_interval {
            info!(
                seen = stats.seen,
                parsed = stats.parsed,
                skipped = stats.skipped,
                enqueued = stats.enqueued,
                summaries = stats.summaries,
                "Stream progress"
            );
            last_progress = Instant::now();
        }
    }
}

async fn drain_summaries<A, S>(mode: &mut Mode<A>, sink: &S, stats: &mut PipelineStats)
where
    S: RecordSink + ?Sized,
{
    let Mode::Aggregated {
        summaries,
        with_metadata,
        ..
    } = mode
    else {
        return;
    };

    while let Ok(summary) = summaries.try_recv() {
        stats.summaries += 1;
        sink.add(Record::Aggregated {
            summary,
            with_metadata: *with_metadata,
        })
        .await;
        stats.enqueued += 1;
    }
}

async fn write_tee(
    tee: &mut Box<dyn AsyncWrite + Unpin + Send>,
    observation: &Observation,
) -> Result<(), PipelineError> {
    let mut line = serde_json::to_vec(observation)
        .map_err(|e| PipelineError::Tee(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    line.push(b'\n');
    tee.write_all(&line).await.map_err(PipelineError::Tee)
}
