//! Subscriber runtime
//!
//! A [`Subscription`] is an endless stream of validated records from one
//! publisher. It connects lazily on the first `next_record` call and hides
//! every connection loss behind reconnection:
//!
//! ```text
//! Connecting --Ready--> Streaming --loss/stale--> Backoff --delay--> Connecting
//!      |                                             ^
//!      +--------------connect failure----------------+
//! ```
//!
//! Records published while disconnected are lost. The only terminal error
//! is a rejected subscription (wrong topic), which retrying cannot fix.

use crate::backoff::Backoff;
use crate::config::SubscriberConfig;
use crate::lifecycle::Readiness;
use crate::transport::{connect_and_subscribe, Connection, TransportError};
use crate::types::CycleRecord;
use crate::wire::{self, Endpoint, EndpointError};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriberState {
    Connecting = 0,
    Streaming = 1,
    Backoff = 2,
}

impl SubscriberState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Streaming,
            2 => Self::Backoff,
            _ => Self::Connecting,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Backoff => "backoff",
        }
    }
}

/// Counters shared with the metrics surface.
#[derive(Debug)]
pub struct SubscriberStats {
    pub records_received: AtomicU64,
    pub decode_errors: AtomicU64,
    pub reconnects: AtomicU64,
    pub connections: AtomicU64,
    pub stale_timeouts: AtomicU64,
    state: AtomicU8,
}

impl Default for SubscriberStats {
    fn default() -> Self {
        Self {
            records_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            stale_timeouts: AtomicU64::new(0),
            state: AtomicU8::new(SubscriberState::Connecting as u8),
        }
    }
}

impl SubscriberStats {
    pub fn state(&self) -> SubscriberState {
        SubscriberState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: SubscriberState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn records_received(&self) -> u64 {
        self.records_received.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub endpoint: Endpoint,
    pub topic: String,
    pub client: String,
    pub connect_timeout: Duration,
    /// Silence (no record, no heartbeat) longer than this is a dead link.
    pub read_timeout: Duration,
    /// Extra wait after `Ready` before reporting ready.
    pub settle_delay: Duration,
    pub backoff: Backoff,
}

impl SubscriptionOptions {
    pub fn from_config(config: &SubscriberConfig, client: &str) -> Result<Self, EndpointError> {
        Ok(Self {
            endpoint: Endpoint::parse(&config.endpoint)?,
            topic: config.topic.clone(),
            client: client.to_string(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            backoff: config.reconnect_backoff(),
        })
    }
}

pub struct Subscription {
    options: SubscriptionOptions,
    connection: Option<Connection>,
    failures: u32,
    ever_connected: bool,
    publisher_id: Option<String>,
    stats: Arc<SubscriberStats>,
    readiness: Readiness,
}

impl Subscription {
    pub fn new(options: SubscriptionOptions) -> Self {
        Self {
            options,
            connection: None,
            failures: 0,
            ever_connected: false,
            publisher_id: None,
            stats: Arc::new(SubscriberStats::default()),
            readiness: Readiness::new(),
        }
    }

    /// Report readiness through `readiness` instead of a private flag.
    #[must_use]
    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn stats(&self) -> Arc<SubscriberStats> {
        Arc::clone(&self.stats)
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    /// Publisher instance of the current (or last) connection.
    pub fn publisher_id(&self) -> Option<&str> {
        self.publisher_id.as_deref()
    }

    /// Next valid record. Waits through outages; only a rejected
    /// subscription is returned as an error.
    pub async fn next_record(&mut self) -> Result<CycleRecord, TransportError> {
        loop {
            if self.connection.is_none() {
                self.establish().await?;
            }
            let Some(connection) = self.connection.as_mut() else {
                continue;
            };

            let frame = tokio::time::timeout(self.options.read_timeout, connection.next()).await;
            let body = match frame {
                Ok(Some(Ok(body))) => body,
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "[Subscriber] Read failed, reconnecting");
                    self.drop_connection();
                    continue;
                }
                Ok(None) => {
                    warn!(
                        endpoint = %self.options.endpoint,
                        "[Subscriber] Publisher closed the connection"
                    );
                    self.drop_connection();
                    continue;
                }
                Err(_) => {
                    self.stats.stale_timeouts.fetch_add(1, Ordering::Relaxed);
                    let timeout_ms =
                        u64::try_from(self.options.read_timeout.as_millis()).unwrap_or(u64::MAX);
                    warn!(
                        timeout_ms = timeout_ms,
                        "[Subscriber] Connection stale, no frames received, reconnecting"
                    );
                    self.drop_connection();
                    continue;
                }
            };

            match wire::decode_record(&body) {
                Ok(Some(record)) => {
                    self.stats.records_received.fetch_add(1, Ordering::Relaxed);
                    return Ok(record);
                }
                Ok(None) => {}
                Err(e) => {
                    let errors = self.stats.decode_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(error = %e, total_decode_errors = errors, "[Subscriber] Frame skipped");
                }
            }
        }
    }

    fn drop_connection(&mut self) {
        self.connection = None;
        self.readiness.set_ready(false);
        self.stats.set_state(SubscriberState::Backoff);
    }

    /// Connect and handshake, retrying until it works or is rejected.
    async fn establish(&mut self) -> Result<(), TransportError> {
        loop {
            if self.stats.state() == SubscriberState::Backoff || self.failures > 0 {
                let delay = self.options.backoff.delay(self.failures);
                debug!(
                    attempt = self.failures,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "[Subscriber] Backing off"
                );
                tokio::time::sleep(delay).await;
            }

            self.stats.set_state(SubscriberState::Connecting);
            let attempt = connect_and_subscribe(
                &self.options.endpoint,
                &self.options.topic,
                &self.options.client,
                self.options.connect_timeout,
                self.options.connect_timeout,
            )
            .await;

            match attempt {
                Ok((connection, handshake)) => {
                    if self.ever_connected {
                        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    self.stats.connections.fetch_add(1, Ordering::Relaxed);

                    match self.publisher_id.as_deref() {
                        Some(previous) if previous != handshake.publisher_id => info!(
                            previous,
                            publisher_id = %handshake.publisher_id,
                            "[Subscriber] Publisher restarted"
                        ),
                        _ => {}
                    }
                    info!(
                        endpoint = %self.options.endpoint,
                        publisher_id = %handshake.publisher_id,
                        topic = %handshake.topic,
                        emitting = handshake.emitting,
                        "[Subscriber] Subscribed"
                    );

                    if !self.options.settle_delay.is_zero() {
                        tokio::time::sleep(self.options.settle_delay).await;
                    }

                    self.publisher_id = Some(handshake.publisher_id);
                    self.connection = Some(connection);
                    self.failures = 0;
                    self.ever_connected = true;
                    self.stats.set_state(SubscriberState::Streaming);
                    self.readiness.set_ready(true);
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    warn!(error = %e, "[Subscriber] Subscription refused");
                    return Err(e);
                }
                Err(e) => {
                    self.failures = self.failures.saturating_add(1);
                    self.stats.set_state(SubscriberState::Backoff);
                    warn!(
                        endpoint = %self.options.endpoint,
                        attempt = self.failures,
                        error = %e,
                        "[Subscriber] Connect failed"
                    );
                }
            }
        }
    }
}

/// Receives every record a subscription yields.
///
/// Called on the read path: implementations must not block on I/O.
pub trait RecordReducer: Send + Sync {
    fn on_record(&self, record: &CycleRecord);
}

/// Feed `reducer` until cancelled. Returns the number of records delivered.
pub async fn run_subscription<R: RecordReducer + ?Sized>(
    subscription: &mut Subscription,
    reducer: &R,
    cancel: &CancellationToken,
) -> Result<u64, TransportError> {
    let mut delivered: u64 = 0;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!(delivered, "[Subscriber] Shutdown signal received");
                subscription.readiness.set_ready(false);
                return Ok(delivered);
            }
            next = subscription.next_record() => {
                let record = next?;
                reducer.on_record(&record);
                delivered += 1;
            }
        }
    }
}
