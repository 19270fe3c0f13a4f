//! System-wide default constants.
//!
//! Grouped by subsystem. Each value is the built-in default used when
//! `phasecast.toml` does not set the matching key.

// ============================================================================
// Publisher
// ============================================================================

/// Fan-out endpoint the publisher binds.
pub const PUBLISHER_ENDPOINT: &str = "tcp://0.0.0.0:5557";

/// Topic the publisher advertises; subscribers filter on a prefix of it.
pub const TOPIC: &str = "threephase";

/// Native cycle rate of the recorded datasets (records per second per device).
pub const REPLAY_RATE_HZ: f64 = 60.0;

/// Wait between binding the endpoint and emitting the first record (seconds).
///
/// Matches the observed deployment, where consumers are restarted alongside
/// the publisher and need time to connect.
pub const GRACE_PERIOD_SECS: u64 = 75;

/// Heartbeat cadence on idle and busy connections alike (milliseconds).
pub const HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Per-subscriber bounded queue depth (records). A subscriber that falls
/// further behind loses the oldest records.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 1_024;

/// Time a fresh connection has to send its `Subscribe` frame (milliseconds).
pub const HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Line frequency assumed when a dataset has no frequency column (Hz).
pub const NOMINAL_FREQUENCY_HZ: f64 = 60.0;

// ============================================================================
// Live Feed
// ============================================================================

/// TCP connect timeout for the live front-end (milliseconds).
pub const LIVE_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// A live feed silent this long is treated as stalled (milliseconds). At the
/// native cycle rate, even a few seconds of silence means the front-end hung.
pub const LIVE_READ_TIMEOUT_MS: u64 = 10_000;

/// Reconnect attempts once an established live feed is lost.
pub const LIVE_RECONNECT_ATTEMPTS: u32 = 10;

/// First live-feed reconnect delay, doubling per attempt (milliseconds).
pub const LIVE_RECONNECT_INITIAL_MS: u64 = 2_000;

/// Live-feed reconnect delay cap (milliseconds).
pub const LIVE_RECONNECT_MAX_MS: u64 = 60_000;

// ============================================================================
// Subscriber
// ============================================================================

/// Endpoint subscribers connect to.
pub const SUBSCRIBER_ENDPOINT: &str = "tcp://127.0.0.1:5557";

/// TCP connect timeout (milliseconds).
pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Silence on a streaming connection (no record, no heartbeat) after which
/// the subscriber treats it as lost (milliseconds).
pub const READ_TIMEOUT_MS: u64 = 10_000;

/// First reconnect delay (milliseconds).
pub const RECONNECT_INITIAL_MS: u64 = 500;

/// Reconnect delay cap (milliseconds).
pub const RECONNECT_MAX_MS: u64 = 30_000;

/// Relative jitter applied to every reconnect delay.
pub const RECONNECT_JITTER: f64 = 0.2;

// ============================================================================
// Time-Series Reducer
// ============================================================================

/// Flush cadence (milliseconds).
pub const FLUSH_INTERVAL_MS: u64 = 1_000;

/// Row count that triggers an early flush. 1 800 = 10 s of one device at
/// 60 Hz in per-phase layout.
pub const FLUSH_THRESHOLD_ROWS: usize = 1_800;

/// Hard cap on buffered rows while a flush is stuck retrying.
pub const MAX_PENDING_ROWS: usize = 100_000;

/// Retries per batch before it is discarded.
pub const SINK_MAX_RETRIES: u32 = 5;

/// First sink retry delay (milliseconds).
pub const SINK_RETRY_INITIAL_MS: u64 = 200;

/// Sink retry delay cap (milliseconds).
pub const SINK_RETRY_MAX_MS: u64 = 5_000;

// ============================================================================
// Summary Reducer
// ============================================================================

/// Tumbling window length (milliseconds).
pub const SUMMARY_WINDOW_MS: u64 = 1_000;

// ============================================================================
// Storage
// ============================================================================

/// Embedded sink location.
pub const SLED_PATH: &str = "./data/phasecast.db";

/// Table used by the TimescaleDB sink.
pub const TIMESCALE_TABLE: &str = "power_readings";

// ============================================================================
// HTTP
// ============================================================================

pub const PUBLISH_HTTP_ADDR: &str = "0.0.0.0:9100";
pub const TIMESERIES_HTTP_ADDR: &str = "0.0.0.0:9101";
pub const SUMMARY_HTTP_ADDR: &str = "0.0.0.0:9102";

// ============================================================================
// Lifecycle
// ============================================================================

/// Time allowed for tasks to finish their final flush after a shutdown
/// signal (seconds).
pub const SHUTDOWN_DRAIN_SECS: u64 = 15;

/// Default `probe` deadline (seconds).
pub const PROBE_TIMEOUT_SECS: u64 = 30;
