//! phasecast configuration - every tunable as a TOML value
//!
//! Each section implements `Default` with the values in `defaults.rs`, so a
//! missing file, a missing section, or a missing key all fall back to the
//! built-in behaviour.

use super::defaults;
use crate::backoff::Backoff;
use crate::types::RowLayout;
use crate::wire::Endpoint;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "PHASECAST_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "phasecast.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration shared by every process role.
///
/// Load with `PhasecastConfig::load()` which searches:
/// 1. `$PHASECAST_CONFIG`
/// 2. `./phasecast.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhasecastConfig {
    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub subscriber: SubscriberConfig,

    #[serde(default)]
    pub timeseries: TimeSeriesConfig,

    #[serde(default)]
    pub summary: SummaryConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PhasecastConfig {
    /// Load configuration using the standard search order.
    ///
    /// Unlike a missing file, a file that exists but cannot be read or
    /// parsed is a fatal startup error.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            let config = Self::load_from_file(&p)?;
            info!(path = %p.display(), "Loaded config from {}", CONFIG_ENV_VAR);
            return Ok(config);
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            let config = Self::load_from_file(&local)?;
            info!("Loaded config from ./{}", LOCAL_CONFIG_FILE);
            return Ok(config);
        }

        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Ok(Self::default())
    }

    /// Load from a specific TOML file path. Unknown keys are logged, not fatal.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        for warning in super::validation::validate_unknown_keys(&raw) {
            warn!(path = %path.display(), "{}", warning);
        }
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate every section, collecting all problems before failing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        // Publisher
        let p = &self.publisher;
        if let Err(e) = Endpoint::parse(&p.endpoint) {
            errors.push(format!("publisher.endpoint: {e}"));
        }
        if p.topic.trim().is_empty() {
            errors.push("publisher.topic must not be empty".to_string());
        }
        if !p.rate_hz.is_finite() || p.rate_hz <= 0.0 {
            errors.push(format!("publisher.rate_hz must be > 0 (got {})", p.rate_hz));
        }
        if p.heartbeat_interval_ms == 0 {
            errors.push("publisher.heartbeat_interval_ms must be > 0".to_string());
        }
        if p.subscriber_queue_depth == 0 {
            errors.push("publisher.subscriber_queue_depth must be > 0".to_string());
        }
        if p.handshake_timeout_ms == 0 {
            errors.push("publisher.handshake_timeout_ms must be > 0".to_string());
        }
        if p.live_connect_timeout_ms == 0 {
            errors.push("publisher.live_connect_timeout_ms must be > 0".to_string());
        }
        if p.live_read_timeout_ms == 0 {
            errors.push("publisher.live_read_timeout_ms must be > 0".to_string());
        }
        if p.live_reconnect_attempts == 0 {
            errors.push("publisher.live_reconnect_attempts must be > 0".to_string());
        }
        if !p.nominal_frequency_hz.is_finite() || p.nominal_frequency_hz <= 0.0 {
            errors.push(format!(
                "publisher.nominal_frequency_hz must be > 0 (got {})",
                p.nominal_frequency_hz
            ));
        }

        // Subscriber
        let s = &self.subscriber;
        if let Err(e) = Endpoint::parse(&s.endpoint) {
            errors.push(format!("subscriber.endpoint: {e}"));
        }
        if s.connect_timeout_ms == 0 {
            errors.push("subscriber.connect_timeout_ms must be > 0".to_string());
        }
        if s.read_timeout_ms <= p.heartbeat_interval_ms {
            errors.push(format!(
                "subscriber.read_timeout_ms ({}) must exceed publisher.heartbeat_interval_ms ({})",
                s.read_timeout_ms, p.heartbeat_interval_ms
            ));
        }
        if s.reconnect_initial_ms == 0 || s.reconnect_initial_ms > s.reconnect_max_ms {
            errors.push(format!(
                "subscriber.reconnect_initial_ms ({}) must be > 0 and <= reconnect_max_ms ({})",
                s.reconnect_initial_ms, s.reconnect_max_ms
            ));
        }
        if !(0.0..=1.0).contains(&s.reconnect_jitter) {
            errors.push(format!(
                "subscriber.reconnect_jitter must be within [0, 1] (got {})",
                s.reconnect_jitter
            ));
        }

        // Time-series reducer
        let t = &self.timeseries;
        if t.flush_interval_ms == 0 {
            errors.push("timeseries.flush_interval_ms must be > 0".to_string());
        }
        if t.flush_threshold_rows == 0 {
            errors.push("timeseries.flush_threshold_rows must be > 0".to_string());
        }
        if t.max_pending_rows < t.flush_threshold_rows {
            errors.push(format!(
                "timeseries.max_pending_rows ({}) must be >= flush_threshold_rows ({})",
                t.max_pending_rows, t.flush_threshold_rows
            ));
        }
        if t.retry_initial_ms > t.retry_max_ms {
            errors.push(format!(
                "timeseries.retry_initial_ms ({}) must be <= retry_max_ms ({})",
                t.retry_initial_ms, t.retry_max_ms
            ));
        }

        // Summary reducer
        if self.summary.window_ms == 0 {
            errors.push("summary.window_ms must be > 0".to_string());
        }

        // Storage
        let st = &self.storage;
        match st.kind {
            SinkKind::Sled if st.path.trim().is_empty() => {
                errors.push("storage.path must be set for the sled sink".to_string());
            }
            SinkKind::Timescale if st.url.as_deref().map_or(true, |u| u.trim().is_empty()) => {
                errors.push("storage.url must be set for the timescale sink".to_string());
            }
            _ => {}
        }
        if !is_sql_identifier(&st.table) {
            errors.push(format!(
                "storage.table '{}' must be a plain identifier ([A-Za-z_][A-Za-z0-9_]*)",
                st.table
            ));
        }

        // HTTP
        for (key, addr) in [
            ("server.publish_addr", &self.server.publish_addr),
            ("server.timeseries_addr", &self.server.timeseries_addr),
            ("server.summary_addr", &self.server.summary_addr),
        ] {
            if addr.parse::<SocketAddr>().is_err() {
                errors.push(format!("{key} '{addr}' is not a socket address"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Config parse error ({}): {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Config serialization error: {0}")]
    Serialize(toml::ser::Error),

    #[error("Config validation failed:\n{}", format_errors(.0))]
    Validation(Vec<String>),
}

fn format_errors(errors: &[String]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// Publisher
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Fan-out endpoint to bind (`tcp://host:port`).
    #[serde(default = "default_publisher_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_topic")]
    pub topic: String,

    /// Recorded CSV dataset to replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,

    /// Replay pacing (records per second per device).
    #[serde(default = "default_rate_hz")]
    pub rate_hz: f64,

    /// Wait after binding before the first record is emitted.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_subscriber_queue_depth")]
    pub subscriber_queue_depth: usize,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Fill phases missing from a dataset frame with a copy of phase A.
    #[serde(default = "default_true")]
    pub fill_missing_phases: bool,

    #[serde(default = "default_nominal_frequency_hz")]
    pub nominal_frequency_hz: f64,

    #[serde(default = "default_live_connect_timeout_ms")]
    pub live_connect_timeout_ms: u64,

    /// Silence on the live feed after which it is reconnected.
    #[serde(default = "default_live_read_timeout_ms")]
    pub live_read_timeout_ms: u64,

    /// Reconnect attempts before a lost live feed stops the publisher.
    #[serde(default = "default_live_reconnect_attempts")]
    pub live_reconnect_attempts: u32,
}

fn default_publisher_endpoint() -> String {
    defaults::PUBLISHER_ENDPOINT.to_string()
}
fn default_topic() -> String {
    defaults::TOPIC.to_string()
}
const fn default_rate_hz() -> f64 {
    defaults::REPLAY_RATE_HZ
}
const fn default_grace_period_secs() -> u64 {
    defaults::GRACE_PERIOD_SECS
}
const fn default_heartbeat_interval_ms() -> u64 {
    defaults::HEARTBEAT_INTERVAL_MS
}
const fn default_subscriber_queue_depth() -> usize {
    defaults::SUBSCRIBER_QUEUE_DEPTH
}
const fn default_handshake_timeout_ms() -> u64 {
    defaults::HANDSHAKE_TIMEOUT_MS
}
const fn default_true() -> bool {
    true
}
const fn default_nominal_frequency_hz() -> f64 {
    defaults::NOMINAL_FREQUENCY_HZ
}
const fn default_live_connect_timeout_ms() -> u64 {
    defaults::LIVE_CONNECT_TIMEOUT_MS
}
const fn default_live_read_timeout_ms() -> u64 {
    defaults::LIVE_READ_TIMEOUT_MS
}
const fn default_live_reconnect_attempts() -> u32 {
    defaults::LIVE_RECONNECT_ATTEMPTS
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            endpoint: default_publisher_endpoint(),
            topic: default_topic(),
            dataset: None,
            rate_hz: default_rate_hz(),
            grace_period_secs: default_grace_period_secs(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            subscriber_queue_depth: default_subscriber_queue_depth(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            fill_missing_phases: true,
            nominal_frequency_hz: default_nominal_frequency_hz(),
            live_connect_timeout_ms: default_live_connect_timeout_ms(),
            live_read_timeout_ms: default_live_read_timeout_ms(),
            live_reconnect_attempts: default_live_reconnect_attempts(),
        }
    }
}

impl PublisherConfig {
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub const fn live_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.live_connect_timeout_ms)
    }

    pub const fn live_read_timeout(&self) -> Duration {
        Duration::from_millis(self.live_read_timeout_ms)
    }
}

// ============================================================================
// Subscriber
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// Publisher endpoint to connect to.
    #[serde(default = "default_subscriber_endpoint")]
    pub endpoint: String,

    /// Topic prefix filter; empty accepts any publisher.
    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Extra wait after `Ready` before reporting the subscription ready.
    #[serde(default)]
    pub settle_delay_ms: u64,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter: f64,
}

fn default_subscriber_endpoint() -> String {
    defaults::SUBSCRIBER_ENDPOINT.to_string()
}
const fn default_connect_timeout_ms() -> u64 {
    defaults::CONNECT_TIMEOUT_MS
}
const fn default_read_timeout_ms() -> u64 {
    defaults::READ_TIMEOUT_MS
}
const fn default_reconnect_initial_ms() -> u64 {
    defaults::RECONNECT_INITIAL_MS
}
const fn default_reconnect_max_ms() -> u64 {
    defaults::RECONNECT_MAX_MS
}
const fn default_reconnect_jitter() -> f64 {
    defaults::RECONNECT_JITTER
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            endpoint: default_subscriber_endpoint(),
            topic: default_topic(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            settle_delay_ms: 0,
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            reconnect_jitter: default_reconnect_jitter(),
        }
    }
}

impl SubscriberConfig {
    pub const fn reconnect_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_initial_ms),
            Duration::from_millis(self.reconnect_max_ms),
            self.reconnect_jitter,
        )
    }
}

// ============================================================================
// Time-Series Reducer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesConfig {
    #[serde(default)]
    pub layout: RowLayout,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_flush_threshold_rows")]
    pub flush_threshold_rows: usize,

    #[serde(default = "default_max_pending_rows")]
    pub max_pending_rows: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

const fn default_flush_interval_ms() -> u64 {
    defaults::FLUSH_INTERVAL_MS
}
const fn default_flush_threshold_rows() -> usize {
    defaults::FLUSH_THRESHOLD_ROWS
}
const fn default_max_pending_rows() -> usize {
    defaults::MAX_PENDING_ROWS
}
const fn default_max_retries() -> u32 {
    defaults::SINK_MAX_RETRIES
}
const fn default_retry_initial_ms() -> u64 {
    defaults::SINK_RETRY_INITIAL_MS
}
const fn default_retry_max_ms() -> u64 {
    defaults::SINK_RETRY_MAX_MS
}

impl Default for TimeSeriesConfig {
    fn default() -> Self {
        Self {
            layout: RowLayout::default(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_threshold_rows: default_flush_threshold_rows(),
            max_pending_rows: default_max_pending_rows(),
            max_retries: default_max_retries(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

// ============================================================================
// Summary Reducer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryConfig {
    /// Tumbling window length.
    #[serde(default = "default_summary_window_ms")]
    pub window_ms: u64,
}

const fn default_summary_window_ms() -> u64 {
    defaults::SUMMARY_WINDOW_MS
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            window_ms: default_summary_window_ms(),
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Which time-series sink the reducer writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Embedded sled database
    #[default]
    Sled,
    /// PostgreSQL / TimescaleDB (requires the `timescale` feature)
    Timescale,
    /// In-process buffer, for dry runs
    Memory,
}

impl std::str::FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sled" => Ok(Self::Sled),
            "timescale" | "timescaledb" | "postgres" => Ok(Self::Timescale),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown sink '{other}' (expected sled, timescale or memory)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub kind: SinkKind,

    /// Directory of the sled database.
    #[serde(default = "default_sled_path")]
    pub path: String,

    /// PostgreSQL connection string for the timescale sink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_table")]
    pub table: String,
}

fn default_sled_path() -> String {
    defaults::SLED_PATH.to_string()
}
fn default_table() -> String {
    defaults::TIMESCALE_TABLE.to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::default(),
            path: default_sled_path(),
            url: None,
            table: default_table(),
        }
    }
}

// ============================================================================
// HTTP / Logging
// ============================================================================

/// Bind addresses of the per-process HTTP surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_publish_addr")]
    pub publish_addr: String,

    #[serde(default = "default_timeseries_addr")]
    pub timeseries_addr: String,

    #[serde(default = "default_summary_addr")]
    pub summary_addr: String,
}

fn default_publish_addr() -> String {
    defaults::PUBLISH_HTTP_ADDR.to_string()
}
fn default_timeseries_addr() -> String {
    defaults::TIMESERIES_HTTP_ADDR.to_string()
}
fn default_summary_addr() -> String {
    defaults::SUMMARY_HTTP_ADDR.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            publish_addr: default_publish_addr(),
            timeseries_addr: default_timeseries_addr(),
            summary_addr: default_summary_addr(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = PhasecastConfig::default();
        assert!(config.validate().is_ok(), "Default config must always validate");
    }

    #[test]
    fn test_empty_toml_produces_defaults() {
        let config: PhasecastConfig = toml::from_str("").expect("empty TOML should parse");
        assert_eq!(config, PhasecastConfig::default());
        assert_eq!(config.publisher.grace_period(), Duration::from_secs(75));
        assert_eq!(config.publisher.rate_hz, 60.0);
        assert_eq!(config.timeseries.layout, RowLayout::PerPhase);
    }

    #[test]
    fn test_partial_toml_override() {
        let toml_str = r#"
[publisher]
grace_period_secs = 5
dataset = "data/sample.csv"

[timeseries]
layout = "aggregate"

[storage]
kind = "memory"
"#;
        let config: PhasecastConfig = toml::from_str(toml_str).expect("partial TOML should parse");
        assert_eq!(config.publisher.grace_period_secs, 5);
        assert_eq!(config.publisher.dataset.as_deref(), Some("data/sample.csv"));
        assert_eq!(config.timeseries.layout, RowLayout::Aggregate);
        assert_eq!(config.storage.kind, SinkKind::Memory);
        // Untouched values keep defaults
        assert_eq!(config.publisher.topic, defaults::TOPIC);
        assert_eq!(config.timeseries.flush_interval_ms, defaults::FLUSH_INTERVAL_MS);
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let mut config = PhasecastConfig::default();
        config.publisher.rate_hz = 0.0;
        config.publisher.endpoint = "udp://nope:1".to_string();
        config.timeseries.flush_threshold_rows = 0;
        config.summary.window_ms = 0;

        match config.validate() {
            Err(ConfigError::Validation(errors)) => {
                assert_eq!(errors.len(), 4, "{errors:?}");
                assert!(errors.iter().any(|e| e.contains("rate_hz")));
                assert!(errors.iter().any(|e| e.contains("publisher.endpoint")));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_live_feed_settings() {
        let toml_str = r#"
[publisher]
live_read_timeout_ms = 250
live_reconnect_attempts = 3
"#;
        let config: PhasecastConfig = toml::from_str(toml_str).expect("live settings should parse");
        assert_eq!(config.publisher.live_read_timeout(), Duration::from_millis(250));
        assert_eq!(config.publisher.live_reconnect_attempts, 3);
        assert_eq!(
            config.publisher.live_connect_timeout_ms,
            defaults::LIVE_CONNECT_TIMEOUT_MS
        );
        assert!(config.validate().is_ok());

        let mut config = config;
        config.publisher.live_reconnect_attempts = 0;
        config.publisher.live_read_timeout_ms = 0;
        match config.validate() {
            Err(ConfigError::Validation(errors)) => {
                assert_eq!(errors.len(), 2, "{errors:?}");
                assert!(errors.iter().any(|e| e.contains("live_reconnect_attempts")));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_read_timeout_must_exceed_heartbeat() {
        let mut config = PhasecastConfig::default();
        config.subscriber.read_timeout_ms = config.publisher.heartbeat_interval_ms;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("read_timeout_ms"));
    }

    #[test]
    fn test_timescale_requires_url_and_safe_table() {
        let mut config = PhasecastConfig::default();
        config.storage.kind = SinkKind::Timescale;
        config.storage.table = "readings; DROP TABLE x".to_string();
        match config.validate() {
            Err(ConfigError::Validation(errors)) => {
                assert!(errors.iter().any(|e| e.contains("storage.url")));
                assert!(errors.iter().any(|e| e.contains("storage.table")));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_roundtrip_toml() {
        let mut original = PhasecastConfig::default();
        original.publisher.dataset = Some("replay.csv".to_string());
        original.storage.url = Some("postgres://localhost/metrology".to_string());
        let toml_str = original.to_toml().expect("serialization should work");
        let roundtripped: PhasecastConfig =
            toml::from_str(&toml_str).expect("deserialization should work");
        assert_eq!(original, roundtripped);
    }

    #[test]
    fn test_load_from_file_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("phasecast.toml");
        std::fs::write(&path, "[publisher\nrate_hz = ").unwrap();
        let err = PhasecastConfig::load_from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("phasecast.toml"));
    }

    #[test]
    fn test_sink_kind_parsing() {
        assert_eq!("TimescaleDB".parse::<SinkKind>(), Ok(SinkKind::Timescale));
        assert_eq!("sled".parse::<SinkKind>(), Ok(SinkKind::Sled));
        assert!("mongo".parse::<SinkKind>().is_err());
    }
}
