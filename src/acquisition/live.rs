//! Live hardware feed sources
//!
//! The metrology front-end emits one JSON `CycleRecord` per line. Records are
//! relayed as they arrive; no pacing is imposed.
//!
//! - [`LiveTcpSource`]: TCP feed with reconnection and stale-link detection
//! - [`StdinSource`]: the same line format piped on stdin

use super::source::{RecordEvent, RecordSource};
use crate::backoff::Backoff;
use crate::config::defaults;
use crate::types::CycleRecord;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

#[derive(Debug, Error)]
pub enum LiveFeedError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout waiting for data")]
    Timeout,

    #[error("Reconnection exhausted after {0} attempts")]
    ReconnectExhausted(u32),
}

/// Connection health counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveFeedStats {
    pub connected: bool,
    pub records_received: u64,
    pub malformed_lines: u64,
    pub reconnections: u64,
    pub timeouts: u64,
}

// ============================================================================
// Line decoding
// ============================================================================

/// Outcome of reading one line from a feed.
enum LineRead {
    Record(CycleRecord),
    Skipped,
    Eof,
}

/// Read one line and decode it. Blank, non-UTF-8, malformed and invalid
/// lines are skipped (logged), never fatal. Only I/O failures are errors.
async fn read_record_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut Vec<u8>,
    origin: &str,
) -> std::io::Result<LineRead> {
    line.clear();
    if reader.read_until(b'\n', line).await? == 0 {
        return Ok(LineRead::Eof);
    }
    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("[{}] Non-UTF-8 line skipped: {}", origin, e);
            return Ok(LineRead::Skipped);
        }
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(LineRead::Skipped);
    }
    match serde_json::from_str::<CycleRecord>(trimmed) {
        Ok(record) => match record.validate() {
            Ok(()) => Ok(LineRead::Record(record)),
            Err(e) => {
                tracing::warn!("[{}] Invalid record skipped: {}", origin, e);
                Ok(LineRead::Skipped)
            }
        },
        Err(e) => {
            tracing::warn!("[{}] Failed to parse record: {}", origin, e);
            Ok(LineRead::Skipped)
        }
    }
}

// ============================================================================
// TCP Feed Client
// ============================================================================

/// TCP client for the live front-end with reconnection and timeout resilience.
pub struct LiveFeedClient {
    address: String,
    stream: Option<BufReader<TcpStream>>,
    line_buffer: Vec<u8>,
    connect_timeout: Duration,
    read_timeout: Duration,
    max_reconnect_attempts: u32,
    backoff: Backoff,
    stats: LiveFeedStats,
}

impl LiveFeedClient {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            stream: None,
            line_buffer: Vec::with_capacity(1024),
            connect_timeout: Duration::from_millis(defaults::LIVE_CONNECT_TIMEOUT_MS),
            read_timeout: Duration::from_millis(defaults::LIVE_READ_TIMEOUT_MS),
            max_reconnect_attempts: defaults::LIVE_RECONNECT_ATTEMPTS,
            backoff: Backoff::new(
                Duration::from_millis(defaults::LIVE_RECONNECT_INITIAL_MS),
                Duration::from_millis(defaults::LIVE_RECONNECT_MAX_MS),
                0.0,
            ),
            stats: LiveFeedStats::default(),
        }
    }

    /// Silence after which the feed is treated as stalled.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Reconnect budget once an established feed is lost.
    #[must_use]
    pub fn with_reconnect(mut self, max_attempts: u32, backoff: Backoff) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.backoff = backoff;
        self
    }

    pub const fn stats(&self) -> LiveFeedStats {
        self.stats
    }

    /// Connect with timeout and TCP keepalive.
    pub async fn connect(&mut self) -> Result<(), LiveFeedError> {
        if self.stream.is_some() {
            return Ok(());
        }
        tracing::info!(address = %self.address, "Connecting to live feed");

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| LiveFeedError::Timeout)?
            .map_err(|e| LiveFeedError::ConnectionFailed(e.to_string()))?;

        let sock_ref = socket2::SockRef::from(&stream);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(30))
            .with_interval(Duration::from_secs(10));
        let _ = sock_ref.set_tcp_keepalive(&keepalive);

        self.stream = Some(BufReader::new(stream));
        self.stats.connected = true;
        tracing::info!("Live feed connection established");
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stream = None;
        self.stats.connected = false;
    }

    /// Reconnect with exponential backoff; errors once attempts run out.
    pub async fn reconnect(&mut self) -> Result<(), LiveFeedError> {
        self.disconnect();

        let max_attempts = self.max_reconnect_attempts;
        for attempt in 1..=max_attempts {
            let delay = self.backoff.delay(attempt - 1);
            tracing::warn!(
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Live feed reconnecting after failure"
            );
            tokio::time::sleep(delay).await;

            match self.connect().await {
                Ok(()) => {
                    self.stats.reconnections += 1;
                    tracing::info!(
                        attempt = attempt,
                        total_reconnections = self.stats.reconnections,
                        "Live feed reconnection successful"
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt, error = %e, "Reconnection attempt failed");
                }
            }
        }

        tracing::error!(
            max_attempts = max_attempts,
            "Live feed reconnection exhausted, all attempts failed"
        );
        Err(LiveFeedError::ReconnectExhausted(max_attempts))
    }

    /// Read the next valid record, reconnecting on timeout or disconnect.
    pub async fn read_record(&mut self) -> Result<CycleRecord, LiveFeedError> {
        loop {
            if self.stream.is_none() {
                self.connect().await?;
            }
            let Some(reader) = self.stream.as_mut() else {
                continue;
            };

            let read = tokio::time::timeout(
                self.read_timeout,
                read_record_line(reader, &mut self.line_buffer, "LiveFeed"),
            )
            .await;

            match read {
                Ok(Ok(LineRead::Record(record))) => {
                    self.stats.records_received += 1;
                    return Ok(record);
                }
                Ok(Ok(LineRead::Skipped)) => {
                    self.stats.malformed_lines += 1;
                }
                Ok(Ok(LineRead::Eof)) => {
                    tracing::warn!("Live feed closed by peer, attempting reconnect");
                    self.reconnect().await?;
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Live feed read error, attempting reconnect");
                    self.reconnect().await?;
                }
                Err(_) => {
                    self.stats.timeouts += 1;
                    let timeout_ms =
                        u64::try_from(self.read_timeout.as_millis()).unwrap_or(u64::MAX);
                    tracing::warn!(
                        timeout_ms = timeout_ms,
                        total_timeouts = self.stats.timeouts,
                        "Live feed stale, no data received, forcing reconnect"
                    );
                    self.reconnect().await?;
                }
            }
        }
    }
}

/// Relays records from the live TCP feed.
pub struct LiveTcpSource {
    client: LiveFeedClient,
}

impl LiveTcpSource {
    /// Connect to the feed with default timeouts. An unreachable feed at
    /// startup is fatal.
    pub async fn connect(address: &str) -> Result<Self> {
        Self::from_client(LiveFeedClient::new(address)).await
    }

    /// Connect a pre-configured client.
    pub async fn from_client(mut client: LiveFeedClient) -> Result<Self> {
        client
            .connect()
            .await
            .map_err(|e| anyhow::anyhow!("live feed {}: {e}", client.address))?;
        Ok(Self { client })
    }

    pub const fn stats(&self) -> LiveFeedStats {
        self.client.stats()
    }
}

#[async_trait]
impl RecordSource for LiveTcpSource {
    async fn next_record(&mut self) -> Result<RecordEvent> {
        // read_record() reconnects internally; an error means it gave up.
        match self.client.read_record().await {
            Ok(record) => Ok(RecordEvent::Record(record)),
            Err(e) => Err(anyhow::anyhow!("live feed error: {e}")),
        }
    }

    fn source_name(&self) -> &str {
        "live-tcp"
    }
}

// ============================================================================
// Stdin Source
// ============================================================================

/// Reads JSON records from stdin, one per line.
///
/// `front-end-bridge | phasecast publish --stdin`
pub struct StdinSource {
    reader: BufReader<tokio::io::Stdin>,
    line_buffer: Vec<u8>,
}

impl StdinSource {
    pub fn new() -> Self {
        Self {
            reader: BufReader::new(tokio::io::stdin()),
            line_buffer: Vec::with_capacity(1024),
        }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordSource for StdinSource {
    async fn next_record(&mut self) -> Result<RecordEvent> {
        loop {
            let line =
                read_record_line(&mut self.reader, &mut self.line_buffer, "StdinSource").await?;
            match line {
                LineRead::Record(record) => return Ok(RecordEvent::Record(record)),
                LineRead::Skipped => {}
                LineRead::Eof => return Ok(RecordEvent::Eof),
            }
        }
    }

    fn source_name(&self) -> &str {
        "stdin"
    }
}
