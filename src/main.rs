//! Probe Collector - wireless probe capture to cloud ingest
//!
//! Reads tcpdump output (stdin or a file), extracts per-MAC signal
//! observations, aggregates them into short windows, and batch-transmits the
//! results to the collection server.
//!
//! ## Commands
//!
//! - `stream` (default): capture lines → windows → batched HTTP delivery
//! - `heartbeat`: periodic online status reports
//! - `start-at`: launch the capture script at a scheduled UTC time
//!
//! ## Configuration
//!
//! Loaded from environment variables; see [`probe_collector::config::Config`].
//! `RUST_LOG` overrides `LOG_LEVEL` for the logging filter.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use probe_collector::aggregator::WindowAggregator;
use probe_collector::config::Config;
use probe_collector::heartbeat::{Heartbeat, HeartbeatConfig};
use probe_collector::launch::{self, CaptureJob, DEFAULT_NTP_TIMEOUT};
use probe_collector::pipeline::{self, summary_channel, Mode, PipelineOptions};
use probe_collector::record::Summary;
use probe_collector::shipper::BatchShipper;

/// How long a stopped capture gets to exit before we stop waiting.
const CAPTURE_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Bound on runtime shutdown; a stdin read parked on a blocking thread never
/// returns on its own.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "probe-collector", version, about = "Collect wireless probe sightings and ship them to the server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream capture output → parse → aggregate → batch → ship (default)
    Stream(StreamArgs),

    /// Post online status to the server on a fixed interval
    Heartbeat,

    /// Wait for a UTC time, then launch the capture script
    StartAt(StartAtArgs),
}

#[derive(Args, Default)]
struct StreamArgs {
    /// File containing tcpdump output (otherwise read from stdin)
    #[arg(long = "from")]
    source: Option<PathBuf>,

    /// Also append every parsed observation to this JSONL file
    #[arg(long)]
    tee_jsonl: Option<PathBuf>,

    /// Ship every observation without aggregation
    #[arg(long)]
    raw: bool,

    /// Attach full window statistics to each aggregated record
    #[arg(long)]
    with_metadata: bool,

    /// Aggregation window in seconds (overrides AGG_WINDOW_SEC)
    #[arg(long)]
    agg_window: Option<f64>,
}

#[derive(Args)]
struct StartAtArgs {
    /// Target UTC time, e.g. 2025-10-25T12:00:00Z
    #[arg(long)]
    time: String,

    /// Path to the capture script
    #[arg(long, default_value = "./capture_wifi.sh")]
    capture_script: PathBuf,

    /// Wireless interface
    #[arg(long, default_value = "wlan1")]
    iface: String,

    /// Directory for capture logs
    #[arg(long, default_value = "./logs")]
    logdir: PathBuf,

    /// Channel to set before capture
    #[arg(long)]
    channel: Option<String>,

    /// Auto-stop after N seconds (0 runs until stopped externally)
    #[arg(long, default_value_t = 0)]
    duration_sec: u64,

    /// Do not wait for NTP sync
    #[arg(long)]
    no_ntp_check: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing subscriber with environment filter
    init_tracing();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(run(cli));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    code
}

async fn run(cli: Cli) -> ExitCode {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, stopping...");
            cancel.cancel();
        }
    });

    match cli.command.unwrap_or(Commands::Stream(StreamArgs::default())) {
        Commands::Stream(args) => run_stream(args, &cancel).await,
        Commands::Heartbeat => run_heartbeat(&cancel).await,
        Commands::StartAt(args) => run_start_at(args, &cancel).await,
    }
}

/// Initialize the tracing subscriber: `RUST_LOG`, then `LOG_LEVEL`, then `info`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .and_then(|level| EnvFilter::try_new(level.to_lowercase()).ok())
        })
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Resolve on Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn load_config() -> Option<Config> {
    match Config::from_env() {
        Ok(config) => {
            info!(
                endpoint_id = %config.endpoint_id,
                server_url = %config.server_url,
                iface = %config.wlan_iface,
                batch_size = config.batch_size,
                flush_interval_secs = config.flush_interval.as_secs(),
                max_attempts = config.max_attempts,
                log_level = %config.log_level,
                "Configuration loaded"
            );
            Some(config)
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            None
        }
    }
}

async fn run_stream(args: StreamArgs, cancel: &CancellationToken) -> ExitCode {
    let Some(config) = load_config() else {
        return ExitCode::FAILURE;
    };

    let window_secs = args.agg_window.unwrap_or(config.window_secs);
    let aggregator_parts = if args.raw {
        None
    } else {
        let (emit, summaries) = summary_channel();
        match WindowAggregator::new(window_secs, emit) {
            Ok(aggregator) => Some((aggregator, summaries)),
            Err(e) => {
                error!(error = %e, "Invalid aggregation window");
                return ExitCode::FAILURE;
            }
        }
    };

    let input: Box<dyn AsyncBufRead + Unpin + Send> = match &args.source {
        Some(path) => match tokio::fs::File::open(path).await {
            Ok(file) => Box::new(BufReader::new(file)),
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to open capture file");
                return ExitCode::FAILURE;
            }
        },
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let mut options = PipelineOptions::default();
    if let Some(path) = &args.tee_jsonl {
        match tokio::fs::OpenOptions::new().create(true).append(true).open(path).await {
            Ok(file) => {
                info!(path = %path.display(), "Teeing parsed JSONL");
                options.tee = Some(Box::new(file));
            }
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to open tee file");
                return ExitCode::FAILURE;
            }
        }
    }

    let shipper = match BatchShipper::new(config.shipper_config()) {
        Ok(shipper) => shipper,
        Err(e) => {
            error!(error = %e, "Failed to create shipper");
            return ExitCode::FAILURE;
        }
    };

    info!(
        endpoint_id = %config.endpoint_id,
        ingest_url = %config.ingest_url,
        mode = if args.raw { "raw" } else { "aggregated" },
        window_secs,
        "Starting stream"
    );

    let result = match aggregator_parts {
        None => {
            pipeline::run(input, Mode::<WindowAggregator<fn(Summary)>>::Raw, &shipper, options, cancel).await
        }
        Some((aggregator, summaries)) => {
            let mode = Mode::Aggregated {
                aggregator,
                summaries,
                with_metadata: args.with_metadata,
            };
            pipeline::run(input, mode, &shipper, options, cancel).await
        }
    };

    shipper.close().await;

    match result {
        Ok(stats) => {
            info!(
                seen = stats.seen,
                parsed = stats.parsed,
                skipped = stats.skipped,
                enqueued = stats.enqueued,
                summaries = stats.summaries,
                "Stream stopped cleanly"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Fatal error in stream");
            ExitCode::FAILURE
        }
    }
}

async fn run_heartbeat(cancel: &CancellationToken) -> ExitCode {
    let Some(config) = load_config() else {
        return ExitCode::FAILURE;
    };

    match Heartbeat::new(HeartbeatConfig::from_config(&config)) {
        Ok(heartbeat) => {
            heartbeat.run(cancel).await;
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Failed to create heartbeat client");
            ExitCode::FAILURE
        }
    }
}

async fn run_start_at(args: StartAtArgs, cancel: &CancellationToken) -> ExitCode {
    let target = match launch::parse_target_time(&args.time) {
        Ok(target) => target,
        Err(e) => {
            error!(error = %e, "Invalid target time");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = launch::wait_until(target, !args.no_ntp_check, DEFAULT_NTP_TIMEOUT, cancel).await {
        warn!(error = %e, "Not launching capture");
        return ExitCode::FAILURE;
    }

    let job = CaptureJob {
        script: args.capture_script,
        iface: args.iface,
        logdir: args.logdir,
        channel: args.channel,
    };
    let mut child = match launch::launch_capture(&job).await {
        Ok((child, _log)) => child,
        Err(e) => {
            error!(error = %e, "Failed to launch capture");
            return ExitCode::FAILURE;
        }
    };

    let limit = (args.duration_sec > 0).then(|| Duration::from_secs(args.duration_sec));
    if let Some(limit) = limit {
        info!(duration_secs = limit.as_secs(), "Running for fixed duration");
    }

    match launch::wait_for_exit(&mut child, limit, cancel).await {
        Ok(Some(status)) => {
            info!(code = ?status.code(), "Capture exited");
            return if status.success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };
        }
        Ok(None) => {}
        Err(e) => {
            error!(error = %e, "Lost track of capture");
            return ExitCode::FAILURE;
        }
    }

    if limit.is_none() {
        info!(pid = child.id().unwrap_or_default(), "Leaving capture running");
        return ExitCode::SUCCESS;
    }

    if let Err(e) = launch::stop_capture().await {
        error!(error = %e, "Failed to stop capture");
        return ExitCode::FAILURE;
    }
    match tokio::time::timeout(CAPTURE_EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => info!(code = ?status.code(), "Capture exited"),
        Ok(Err(e)) => warn!(error = %e, "Failed to wait for capture"),
        Err(_) => warn!(
            grace_secs = CAPTURE_EXIT_GRACE.as_secs(),
            "Capture still running after stop"
        ),
    }

    ExitCode::SUCCESS
}
