//! Configuration module for the probe collector.
//!
//! Settings come from environment variables. `ENDPOINT_ID`, `SERVER_URL` and
//! `API_KEY` are required; everything else falls back to a default.

use std::env;
use std::time::Duration;

use crate::aggregator::DEFAULT_WINDOW_SECS;
use crate::client::{AuthStyle, RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::shipper::ShipperConfig;

/// Route the batches are POSTed to, relative to `SERVER_URL`
const INGEST_PATH: &str = "/api/endpoint/scan-data";

/// Route the heartbeat is POSTed to, relative to `SERVER_URL`
const STATUS_PATH: &str = "/api/endpoint/status";

/// Default batch size (number of records per batch)
const DEFAULT_BATCH_SIZE: usize = 200;

/// Default flush interval in seconds
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5;

/// Maximum allowed batch size to prevent memory issues
const MAX_BATCH_SIZE: usize = 10_000;

const MIN_FLUSH_INTERVAL_SECS: u64 = 1;
const MAX_FLUSH_INTERVAL_SECS: u64 = 300;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

const DEFAULT_HEARTBEAT_SECS: u64 = 30;

const DEFAULT_LOG_LEVEL: &str = "info";

/// Configuration for the probe collector.
///
/// Environment variables:
/// - `ENDPOINT_ID`, `SERVER_URL`, `API_KEY`, `WLAN_IFACE`: required
/// - `AUTH_STYLE`: `x-api-key` (default) or `bearer`
/// - `BATCH_MAX`: records per batch (default: 200)
/// - `BATCH_INTERVAL_SEC`: seconds between sends (default: 5)
/// - `REQUEST_TIMEOUT_SEC`: HTTP timeout (default: 15)
/// - `MAX_RETRIES`: attempts per batch (default: 5)
/// - `USE_GZIP`, `TIMESTAMP_AS_ISO`: booleans (default: false)
/// - `AGG_WINDOW_SEC`: aggregation window (default: 2.0)
/// - `HEARTBEAT_SEC`: heartbeat interval (default: 30)
/// - `LOG_LEVEL`: tracing filter when `RUST_LOG` is unset (default: info)
/// - `ALLOW_INSECURE_HTTP`: accept an `http://` server URL
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of this endpoint
    pub endpoint_id: String,

    /// Base URL of the collection server, without trailing slash
    pub server_url: String,

    /// Full URL for the scan-data ingestion route
    pub ingest_url: String,

    /// Full URL for the heartbeat route
    pub status_url: String,

    pub api_key: String,

    /// Wireless interface the capture runs on
    pub wlan_iface: String,

    pub auth_style: AuthStyle,

    /// Number of records to accumulate before sending a batch
    pub batch_size: usize,

    /// Duration to wait before flushing buffered records, even if batch size not reached
    pub flush_interval: Duration,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Total attempts per batch, including the first
    pub max_attempts: u32,

    pub use_gzip: bool,

    /// Send timestamps as UTC text instead of epoch seconds
    pub timestamp_as_text: bool,

    /// Aggregation window length in seconds
    pub window_secs: f64,

    pub heartbeat_interval: Duration,

    pub log_level: String,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - any of `ENDPOINT_ID`, `SERVER_URL`, `API_KEY`, `WLAN_IFACE` is missing or empty
    /// - `SERVER_URL` is not an `https://` URL with a host
    /// - a numeric or boolean variable does not parse or is out of range
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use probe_collector::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Ingest URL: {}", config.ingest_url);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint_id = non_empty("ENDPOINT_ID");
        let server_url = non_empty("SERVER_URL");
        let api_key = non_empty("API_KEY");
        let wlan_iface = non_empty("WLAN_IFACE");

        let (endpoint_id, server_url, api_key, wlan_iface) = match (endpoint_id, server_url, api_key, wlan_iface) {
            (Some(e), Some(s), Some(a), Some(w)) => (e, s, a, w),
            (e, s, a, w) => {
                let missing: Vec<&str> = [
                    ("ENDPOINT_ID", e.is_none()),
                    ("SERVER_URL", s.is_none()),
                    ("API_KEY", a.is_none()),
                    ("WLAN_IFACE", w.is_none()),
                ]
                .into_iter()
                    .filter_map(|(name, absent)| absent.then_some(name))
                    .collect();
                return Err(ConfigError {
                    message: format!("Missing required settings: {}", missing.join(", ")),
                    env_var: None,
                });
            }
        };

        let allow_insecure = parse_bool("ALLOW_INSECURE_HTTP", false)?;
        let server_url = Self::validate_server_url(&server_url, allow_insecure)?;

        let auth_style = match env::var("AUTH_STYLE") {
            Ok(value) => value
                .parse()
                .map_err(|e: String| ConfigError::for_var("AUTH_STYLE", e))?,
            Err(_) => AuthStyle::default(),
        };

        let batch_size = Self::parse_batch_size()?;
        let flush_interval = Duration::from_secs(Self::parse_flush_interval()?);
        let request_timeout = Duration::from_secs(parse_number("REQUEST_TIMEOUT_SEC", DEFAULT_REQUEST_TIMEOUT_SECS)?);

        let max_attempts: u32 = parse_number("MAX_RETRIES", DEFAULT_MAX_ATTEMPTS)?;
        if max_attempts == 0 {
            return Err(ConfigError::for_var("MAX_RETRIES", "must be at least 1"));
        }

        let window_secs: f64 = parse_number("AGG_WINDOW_SEC", DEFAULT_WINDOW_SECS)?;
        if !window_secs.is_finite() || window_secs <= 0.0 {
            return Err(ConfigError::for_var(
                "AGG_WINDOW_SEC",
                format!("window {} must be a positive number of seconds", window_secs),
            ));
        }

        let heartbeat_secs: u64 = parse_number("HEARTBEAT_SEC", DEFAULT_HEARTBEAT_SECS)?;
        if heartbeat_secs == 0 {
            return Err(ConfigError::for_var("HEARTBEAT_SEC", "must be greater than 0"));
        }

        Ok(Self {
            ingest_url: format!("{}{}", server_url, INGEST_PATH),
            status_url: format!("{}{}", server_url, STATUS_PATH),
            endpoint_id,
            server_url,
            api_key,
            wlan_iface,
            auth_style,
            batch_size,
            flush_interval,
            request_timeout,
            max_attempts,
            use_gzip: parse_bool("USE_GZIP", false)?,
            timestamp_as_text: parse_bool("TIMESTAMP_AS_ISO", false)?,
            window_secs,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string()),
        })
    }

    /// Shipper settings derived from this configuration.
    pub fn shipper_config(&self) -> ShipperConfig {
        ShipperConfig {
            auth_style: self.auth_style,
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
            request_timeout: self.request_timeout,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            },
            use_gzip: self.use_gzip,
            endpoint_id: Some(self.endpoint_id.clone()),
            timestamp_as_text: self.timestamp_as_text,
            ..ShipperConfig::new(&self.ingest_url, &self.api_key)
        }
    }

    /// Require an `https://` URL with a host; trailing slashes are trimmed.
    fn validate_server_url(url: &str, allow_insecure: bool) -> Result<String, ConfigError> {
        let env_var = "SERVER_URL";
        let trimmed = url.trim().trim_end_matches('/');

        let parsed = reqwest::Url::parse(trimmed)
            .map_err(|e| ConfigError::for_var(env_var, format!("'{}' is not a valid URL: {}", trimmed, e)))?;

        let scheme_ok = match parsed.scheme() {
            "https" => true,
            "http" => allow_insecure,
            _ => false,
        };
        if !scheme_ok || parsed.host_str().map_or(true, str::is_empty) {
            return Err(ConfigError::for_var(env_var, "must be a valid https URL"));
        }

        Ok(trimmed.to_string())
    }

    /// Parse batch size from environment variable with validation.
    fn parse_batch_size() -> Result<usize, ConfigError> {
        let env_var = "BATCH_MAX";
        let batch_size: usize = parse_number(env_var, DEFAULT_BATCH_SIZE)?;

        if batch_size == 0 {
            return Err(ConfigError::for_var(env_var, "batch size must be greater than 0"));
        }

        if batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::for_var(
                env_var,
                format!(
                    "batch size {} exceeds maximum allowed ({})",
                    batch_size, MAX_BATCH_SIZE
                ),
            ));
        }

        Ok(batch_size)
    }

    /// Parse flush interval from environment variable with validation.
    fn parse_flush_interval() -> Result<u64, ConfigError> {
        let env_var = "BATCH_INTERVAL_SEC";
        let interval: u64 = parse_number(env_var, DEFAULT_FLUSH_INTERVAL_SECS)?;

        if interval < MIN_FLUSH_INTERVAL_SECS {
            return Err(ConfigError::for_var(
                env_var,
                format!(
                    "flush interval {} is below minimum ({}s)",
                    interval, MIN_FLUSH_INTERVAL_SECS
                ),
            ));
        }

        if interval > MAX_FLUSH_INTERVAL_SECS {
            return Err(ConfigError::for_var(
                env_var,
                format!(
                    "flush interval {} exceeds maximum ({}s)",
                    interval, MAX_FLUSH_INTERVAL_SECS
                ),
            ));
        }

        Ok(interval)
    }
}

impl Default for Config {
    /// Defaults with placeholder identity, for tests and local runs.
    fn default() -> Self {
        let server_url = "https://localhost".to_string();
        Self {
            endpoint_id: String::new(),
            ingest_url: format!("{}{}", server_url, INGEST_PATH),
            status_url: format!("{}{}", server_url, STATUS_PATH),
            server_url,
            api_key: String::new(),
            wlan_iface: "wlan0".to_string(),
            auth_style: AuthStyle::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            use_gzip: false,
            timestamp_as_text: false,
            window_secs: DEFAULT_WINDOW_SECS,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

fn non_empty(env_var: &str) -> Option<String> {
    env::var(env_var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_number<T: std::str::FromStr>(env_var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(env_var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))),
        Err(_) => Ok(default),
    }
}

fn parse_bool(env_var: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(env_var) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(ConfigError::for_var(env_var, format!("'{}' is not a valid boolean", value))),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, MutexGuard};

    // Environment is process-global; tests touching it run one at a time.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "ENDPOINT_ID",
        "SERVER_URL",
        "API_KEY",
        "WLAN_IFACE",
        "AUTH_STYLE",
        "BATCH_MAX",
        "BATCH_INTERVAL_SEC",
        "REQUEST_TIMEOUT_SEC",
        "MAX_RETRIES",
        "USE_GZIP",
        "TIMESTAMP_AS_ISO",
        "AGG_WINDOW_SEC",
        "HEARTBEAT_SEC",
        "LOG_LEVEL",
        "ALLOW_INSECURE_HTTP",
    ];

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    /// Lock the environment, clear every variable we read, and set the required ones.
    struct TestEnv {
        guards: Vec<EnvGuard>,
        _lock: MutexGuard<'static, ()>,
    }

    impl Drop for TestEnv {
        fn drop(&mut self) {
            // Restore in reverse so a key set twice ends at its original value
            while let Some(guard) = self.guards.pop() {
                drop(guard);
            }
        }
    }

    impl TestEnv {
        fn required() -> Self {
            let mut env = Self::empty();
            env.set("ENDPOINT_ID", "ep-1");
            env.set("SERVER_URL", "https://collector.example.com/");
            env.set("API_KEY", "secret");
            env.set("WLAN_IFACE", "wlan1");
            env
        }

        fn empty() -> Self {
            let lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            let guards = ALL_VARS.iter().map(|k| EnvGuard::remove(k)).collect();
            Self {
                guards,
                _lock: lock,
            }
        }

        fn set(&mut self, key: &str, value: &str) {
            self.guards.push(EnvGuard::set(key, value));
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.window_secs, 2.0);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.ingest_url, "https://localhost/api/endpoint/scan-data");
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _env = TestEnv::required();

        let config = Config::from_env().expect("Should load with defaults");
        assert_eq!(config.endpoint_id, "ep-1");
        assert_eq!(config.server_url, "https://collector.example.com"); // Trailing slash removed
        assert_eq!(config.ingest_url, "https://collector.example.com/api/endpoint/scan-data");
        assert_eq!(config.status_url, "https://collector.example.com/api/endpoint/status");
        assert_eq!(config.auth_style, AuthStyle::ApiKey);
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.wlan_iface, "wlan1");
        assert!(!config.use_gzip);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let mut env = TestEnv::required();
        env.set("WLAN_IFACE", "wlan2");
        env.set("AUTH_STYLE", "bearer");
        env.set("BATCH_MAX", "50");
        env.set("BATCH_INTERVAL_SEC", "10");
        env.set("REQUEST_TIMEOUT_SEC", "3");
        env.set("MAX_RETRIES", "2");
        env.set("USE_GZIP", "true");
        env.set("TIMESTAMP_AS_ISO", "1");
        env.set("AGG_WINDOW_SEC", "0.5");
        env.set("HEARTBEAT_SEC", "60");
        env.set("LOG_LEVEL", "debug");

        let config = Config::from_env().expect("Should load custom values");
        assert_eq!(config.wlan_iface, "wlan2");
        assert_eq!(config.auth_style, AuthStyle::Bearer);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.flush_interval, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.max_attempts, 2);
        assert!(config.use_gzip);
        assert!(config.timestamp_as_text);
        assert_eq!(config.window_secs, 0.5);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_missing_required_settings_listed_together() {
        let mut env = TestEnv::empty();
        env.set("SERVER_URL", "https://collector.example.com");

        let err = Config::from_env().unwrap_err();
        assert_eq!(err.env_var, None);
        assert_eq!(err.message, "Missing required settings: ENDPOINT_ID, API_KEY, WLAN_IFACE");
    }

    #[test]
    fn test_blank_required_setting_counts_as_missing() {
        let mut env = TestEnv::required();
        env.set("API_KEY", "   ");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("API_KEY"));
    }

    #[test]
    fn test_capture_interface_is_required() {
        let mut env = TestEnv::required();
        env.set("WLAN_IFACE", "");

        let err = Config::from_env().unwrap_err();
        assert_eq!(err.env_var, None);
        assert_eq!(err.message, "Missing required settings: WLAN_IFACE");
    }

    #[test]
    fn test_http_url_rejected_unless_allowed() {
        let mut env = TestEnv::required();
        env.set("SERVER_URL", "http://collector.local:8080");

        let err = Config::from_env().unwrap_err();
        assert_eq!(err.env_var.as_deref(), Some("SERVER_URL"));
        assert!(err.message.contains("https"));

        env.set("ALLOW_INSECURE_HTTP", "true");
        let config = Config::from_env().expect("insecure URL allowed");
        assert_eq!(config.ingest_url, "http://collector.local:8080/api/endpoint/scan-data");
    }

    #[test]
    fn test_malformed_url_rejected() {
        let mut env = TestEnv::required();
        env.set("SERVER_URL", "not a url");

        let err = Config::from_env().unwrap_err();
        assert_eq!(err.env_var.as_deref(), Some("SERVER_URL"));
    }

    #[test]
    fn test_invalid_batch_size() {
        let mut env = TestEnv::required();
        env.set("BATCH_MAX", "not_a_number");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("not a valid number"));
    }

    #[test]
    fn test_zero_batch_size() {
        let mut env = TestEnv::required();
        env.set("BATCH_MAX", "0");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("greater than 0"));
    }

    #[test]
    fn test_batch_size_exceeds_max() {
        let mut env = TestEnv::required();
        env.set("BATCH_MAX", "99999");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("exceeds maximum"));
    }

    #[test]
    fn test_flush_interval_bounds() {
        let mut env = TestEnv::required();
        env.set("BATCH_INTERVAL_SEC", "0");
        assert!(Config::from_env().unwrap_err().message.contains("below minimum"));

        env.set("BATCH_INTERVAL_SEC", "999");
        assert!(Config::from_env().unwrap_err().message.contains("exceeds maximum"));
    }

    #[test]
    fn test_zero_retries_rejected() {
        let mut env = TestEnv::required();
        env.set("MAX_RETRIES", "0");

        let err = Config::from_env().unwrap_err();
        assert_eq!(err.env_var.as_deref(), Some("MAX_RETRIES"));
    }

    #[test]
    fn test_invalid_window_and_bool() {
        let mut env = TestEnv::required();
        env.set("AGG_WINDOW_SEC", "-1");
        assert_eq!(Config::from_env().unwrap_err().env_var.as_deref(), Some("AGG_WINDOW_SEC"));

        env.set("AGG_WINDOW_SEC", "2");
        env.set("USE_GZIP", "maybe");
        assert!(Config::from_env().unwrap_err().message.contains("not a valid boolean"));
    }

    #[test]
    fn test_unknown_auth_style() {
        let mut env = TestEnv::required();
        env.set("AUTH_STYLE", "basic");

        let err = Config::from_env().unwrap_err();
        assert_eq!(err.env_var.as_deref(), Some("AUTH_STYLE"));
    }

    #[test]
    fn test_shipper_config_from_config() {
        let config = Config {
            endpoint_id: "ep-9".to_string(),
            api_key: "k".to_string(),
            batch_size: 25,
            max_attempts: 3,
            use_gzip: true,
            ..Config::default()
        };

        let shipper = config.shipper_config();
        assert_eq!(shipper.server_url, "https://localhost/api/endpoint/scan-data");
        assert_eq!(shipper.api_key, "k");
        assert_eq!(shipper.batch_size, 25);
        assert_eq!(shipper.retry.max_attempts, 3);
        assert!(shipper.use_gzip);
        assert_eq!(shipper.endpoint_id.as_deref(), Some("ep-9"));
        assert!(shipper.validate().is_ok());
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError {
            message: "test error".to_string(),
            env_var: Some("TEST_VAR".to_string()),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error_no_var = ConfigError {
            message: "general error".to_string(),
            env_var: None,
        };
        assert_eq!(
            format!("{}", error_no_var),
            "Configuration error: general error"
        );
    }
}
