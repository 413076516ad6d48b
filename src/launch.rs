//! Start a capture at a scheduled UTC time.
//!
//! Waits (optionally) for the system clock to report NTP synchronization,
//! sleeps until the target instant, then launches the capture script under
//! `sudo` with its output going to a timestamped log file.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Longest single sleep while waiting for the target time.
const MAX_SLEEP_CHUNK: Duration = Duration::from_secs(60);

/// Delay between NTP status checks.
const NTP_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default bound on waiting for NTP synchronization.
pub const DEFAULT_NTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum LaunchError {
    /// Target time is not `YYYY-MM-DDTHH:MM:SS[Z]`
    InvalidTime(String),

    /// Log directory or log file could not be created
    LogFile { path: PathBuf, source: std::io::Error },

    /// Capture process could not be started
    Spawn(std::io::Error),

    /// Stop command could not be run
    Stop(std::io::Error),

    /// Waiting on the capture process failed
    Wait(std::io::Error),

    /// Wait was cancelled before the target time
    Cancelled,
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::InvalidTime(value) => {
                write!(f, "Invalid time format: {} -- use YYYY-MM-DDTHH:MM:SSZ", value)
            }
            LaunchError::LogFile { path, source } => {
                write!(f, "Failed to create capture log {}: {}", path.display(), source)
            }
            LaunchError::Spawn(e) => write!(f, "Failed to start capture: {}", e),
            LaunchError::Stop(e) => write!(f, "Failed to stop capture: {}", e),
            LaunchError::Wait(e) => write!(f, "Failed to wait for capture: {}", e),
            LaunchError::Cancelled => write!(f, "Wait cancelled before target time"),
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::LogFile { source, .. } => Some(source),
            LaunchError::Spawn(e) | LaunchError::Stop(e) | LaunchError::Wait(e) => Some(e),
            _ => None,
        }
    }
}

/// Parse a UTC target time such as `2025-10-25T12:00:00Z`.
///
/// The trailing `Z` is optional; fractional seconds are accepted.
pub fn parse_target_time(value: &str) -> Result<DateTime<Utc>, LaunchError> {
    let trimmed = value.trim();
    let naive = trimmed.strip_suffix('Z').unwrap_or(trimmed);

    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(naive, format).ok())
        .map(|dt| dt.and_utc())
        .ok_or_else(|| LaunchError::InvalidTime(value.to_string()))
}

/// Interpret `timedatectl show -p NTPSynchronized` output.
pub fn parse_ntp_status(output: &str) -> bool {
    output
        .trim()
        .split_once('=')
        .map(|(_, v)| v.trim().eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
}

/// Whether the system clock reports NTP synchronization.
pub async fn ntp_synchronized() -> bool {
    match Command::new("timedatectl")
        .args(["show", "-p", "NTPSynchronized"])
        .output()
        .await
    {
        Ok(output) => parse_ntp_status(&String::from_utf8_lossy(&output.stdout)),
        Err(_) => false,
    }
}

/// Sleep until `target`, optionally after waiting for NTP sync.
///
/// A target at or before now returns immediately. NTP is waited on for at
/// most `ntp_timeout`, after which the wait proceeds with a warning.
pub async fn wait_until(
    target: DateTime<Utc>,
    check_ntp: bool,
    ntp_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), LaunchError> {
    if check_ntp {
        let started = tokio::time::Instant::now();
        while !ntp_synchronized().await {
            if started.elapsed() > ntp_timeout {
                warn!(timeout_secs = ntp_timeout.as_secs(), "NTP not synced after timeout, proceeding anyway");
                break;
            }
            info!("Waiting for NTP sync");
            sleep_or_cancel(NTP_POLL_INTERVAL, cancel).await?;
        }
    }

    let mut remaining = time_until(target);
    if remaining.is_zero() {
        info!(target = %target, "Target time is now or in the past, starting immediately");
        return Ok(());
    }

    info!(target = %target, sleep_secs = remaining.as_secs(), "Sleeping until target time");
    while !remaining.is_zero() {
        sleep_or_cancel(remaining.min(MAX_SLEEP_CHUNK), cancel).await?;
        remaining = time_until(target);
        if !remaining.is_zero() {
            info!(remaining_secs = remaining.as_secs(), "Waiting for target time");
        }
    }

    info!("Reached target time");
    Ok(())
}

fn time_until(target: DateTime<Utc>) -> Duration {
    (target - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<(), LaunchError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(LaunchError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// What to launch and where its output goes.
#[derive(Debug, Clone)]
pub struct CaptureJob {
    pub script: PathBuf,
    pub iface: String,
    pub logdir: PathBuf,

    /// Channel passed through to the script when set
    pub channel: Option<String>,
}

impl CaptureJob {
    /// `capture_<iface>_<YYYYmmdd_HHMMSS>.log` inside the log directory.
    pub fn log_path(&self, now: DateTime<Utc>) -> PathBuf {
        self.logdir
            .join(format!("capture_{}_{}.log", self.iface, now.format("%Y%m%d_%H%M%S")))
    }

    /// `sudo /bin/bash <script> <iface> <logdir> [channel]`
    pub fn command(&self) -> Command {
        let mut command = Command::new("sudo");
        command
            .arg("/bin/bash")
            .arg(&self.script)
            .arg(&self.iface)
            .arg(&self.logdir);
        if let Some(channel) = &self.channel {
            command.arg(channel);
        }
        command
    }
}

/// Start the capture script; stdout and stderr go to a fresh log file.
///
/// Returns the child and the log file path.
pub async fn launch_capture(job: &CaptureJob) -> Result<(Child, PathBuf), LaunchError> {
    tokio::fs::create_dir_all(&job.logdir)
        .await
        .map_err(|e| log_error(&job.logdir, e))?;

    let path = job.log_path(Utc::now());
    let stdout = std::fs::File::create(&path).map_err(|e| log_error(&path, e))?;
    let stderr = stdout.try_clone().map_err(|e| log_error(&path, e))?;

    let child = job
        .command()
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .map_err(LaunchError::Spawn)?;

    info!(
        pid = child.id().unwrap_or_default(),
        script = %job.script.display(),
        iface = %job.iface,
        log = %path.display(),
        "Started capture"
    );
    Ok((child, path))
}

fn log_error(path: &Path, source: std::io::Error) -> LaunchError {
    LaunchError::LogFile {
        path: path.to_path_buf(),
        source,
    }
}

/// Wait for the capture to exit on its own.
///
/// Gives up after `limit` when one is set, or on cancellation; `None` means
/// the capture is still running.
pub async fn wait_for_exit(
    child: &mut Child,
    limit: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<Option<ExitStatus>, LaunchError> {
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        status = child.wait() => status.map(Some).map_err(LaunchError::Wait),
        _ = deadline => Ok(None),
        _ = cancel.cancelled() => Ok(None),
    }
}

/// Stop every running tcpdump (`sudo pkill tcpdump`).
pub async fn stop_capture() -> Result<(), LaunchError> {
    let status = Command::new("sudo")
        .args(["pkill", "tcpdump"])
        .status()
        .await
        .map_err(LaunchError::Stop)?;
    info!(code = ?status.code(), "Auto-stopped capture");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_target_time() {
        let expected = Utc.with_ymd_and_hms(2025, 10, 25, 12, 0, 0).unwrap();
        assert_eq!(parse_target_time("2025-10-25T12:00:00Z").unwrap(), expected);
        assert_eq!(parse_target_time("2025-10-25T12:00:00").unwrap(), expected);
        assert_eq!(parse_target_time(" 2025-10-25T12:00:00Z\n").unwrap(), expected);

        let fractional = parse_target_time("2025-10-25T12:00:00.250Z").unwrap();
        assert_eq!(fractional.timestamp_millis(), expected.timestamp_millis() + 250);
    }

    #[test]
    fn test_parse_target_time_rejects_garbage() {
        for bad in ["", "tomorrow", "2025-10-25", "2025-13-01T00:00:00Z", "12:00:00Z"] {
            let err = parse_target_time(bad).unwrap_err();
            assert!(matches!(err, LaunchError::InvalidTime(_)), "{:?}", bad);
        }
        assert_eq!(
            format!("{}", parse_target_time("nope").unwrap_err()),
            "Invalid time format: nope -- use YYYY-MM-DDTHH:MM:SSZ"
        );
    }

    #[test]
    fn test_parse_ntp_status() {
        assert!(parse_ntp_status("NTPSynchronized=yes\n"));
        assert!(parse_ntp_status("NTPSynchronized=YES"));
        assert!(!parse_ntp_status("NTPSynchronized=no"));
        assert!(!parse_ntp_status(""));
        assert!(!parse_ntp_status("garbage"));
    }

    fn job(channel: Option<&str>) -> CaptureJob {
        CaptureJob {
            script: PathBuf::from("/opt/capture_wifi.sh"),
            iface: "wlan1".to_string(),
            logdir: PathBuf::from("/var/log/probe"),
            channel: channel.map(str::to_string),
        }
    }

    #[test]
    fn test_command_line() {
        let command = job(Some("6")).command();
        let std = command.as_std();
        assert_eq!(std.get_program(), "sudo");
        let args: Vec<_> = std.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["/bin/bash", "/opt/capture_wifi.sh", "wlan1", "/var/log/probe", "6"]);

        let command = job(None).command();
        assert_eq!(command.as_std().get_args().count(), 4);
    }

    #[test]
    fn test_log_path() {
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            job(None).log_path(now),
            PathBuf::from("/var/log/probe/capture_wlan1_20250102_030405.log")
        );
    }

    #[tokio::test]
    async fn test_wait_for_exit_reaps_finished_capture() {
        let mut child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let cancel = CancellationToken::new();

        let status = wait_for_exit(&mut child, None, &cancel).await.unwrap().unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_wait_for_exit_gives_up_at_limit() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let cancel = CancellationToken::new();

        let status = wait_for_exit(&mut child, Some(Duration::from_millis(50)), &cancel)
            .await
            .unwrap();
        assert!(status.is_none());

        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_exit_stops_on_cancel() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(wait_for_exit(&mut child, None, &cancel).await.unwrap().is_none());

        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_until_past_target_returns_immediately() {
        let cancel = CancellationToken::new();
        let target = Utc::now() - chrono::Duration::seconds(10);

        let started = std::time::Instant::now();
        wait_until(target, false, DEFAULT_NTP_TIMEOUT, &cancel).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_wait_until_near_target() {
        let cancel = CancellationToken::new();
        let target = Utc::now() + chrono::Duration::milliseconds(200);

        wait_until(target, false, DEFAULT_NTP_TIMEOUT, &cancel).await.unwrap();
        assert!(Utc::now() >= target);
    }

    #[tokio::test]
    async fn test_wait_until_cancelled() {
        let cancel = CancellationToken::new();
        let target = Utc::now() + chrono::Duration::hours(1);

        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { wait_until(target, false, DEFAULT_NTP_TIMEOUT, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert!(matches!(waiter.await.unwrap(), Err(LaunchError::Cancelled)));
    }
}
