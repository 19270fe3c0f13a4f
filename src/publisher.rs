//! Publisher: binds the fan-out endpoint and pumps a record source into it.
//!
//! The endpoint is bound before any record exists. Subscribers may attach
//! during the grace period (they get `Ready` and heartbeats); emission starts
//! when the grace period ends. A subscriber that attaches later misses every
//! record published before its `Ready`.

use crate::acquisition::{RecordEvent, RecordSource};
use crate::config::PublisherConfig;
use crate::transport::{EndpointServer, FanoutHub, PublisherStats, SessionConfig, TransportError};
use crate::wire::{self, Endpoint, EndpointError, WireMessage};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PublisherOptions {
    pub endpoint: Endpoint,
    pub topic: String,
    pub grace_period: Duration,
    pub heartbeat_interval: Duration,
    pub queue_depth: usize,
    pub handshake_timeout: Duration,
}

impl PublisherOptions {
    pub fn from_config(config: &PublisherConfig) -> Result<Self, EndpointError> {
        Ok(Self {
            endpoint: Endpoint::parse(&config.endpoint)?,
            topic: config.topic.clone(),
            grace_period: config.grace_period(),
            heartbeat_interval: config.heartbeat_interval(),
            queue_depth: config.subscriber_queue_depth,
            handshake_timeout: config.handshake_timeout(),
        })
    }
}

/// Read-only view of a running publisher, shared with the HTTP surface.
#[derive(Clone)]
pub struct PublisherStatus {
    publisher_id: Arc<str>,
    emitting: Arc<AtomicBool>,
    records_published: Arc<AtomicU64>,
    encode_errors: Arc<AtomicU64>,
    stats: Arc<PublisherStats>,
    hub: Arc<FanoutHub>,
}

impl PublisherStatus {
    pub fn publisher_id(&self) -> &str {
        &self.publisher_id
    }

    /// False during the grace period.
    pub fn is_emitting(&self) -> bool {
        self.emitting.load(Ordering::Acquire)
    }

    pub fn records_published(&self) -> u64 {
        self.records_published.load(Ordering::Relaxed)
    }

    pub fn encode_errors(&self) -> u64 {
        self.encode_errors.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &PublisherStats {
        &self.stats
    }

    pub fn subscribers(&self) -> usize {
        self.hub.receiver_count()
    }

    /// Records published while nobody was attached.
    pub fn unheard(&self) -> u64 {
        self.hub.unheard()
    }
}

pub struct Publisher {
    server: EndpointServer,
    hub: Arc<FanoutHub>,
    status: PublisherStatus,
    grace_period: Duration,
    local_addr: SocketAddr,
}

impl Publisher {
    /// Bind the fan-out endpoint. Nothing is emitted until [`Publisher::run`].
    pub async fn bind(options: PublisherOptions) -> Result<Self, TransportError> {
        let publisher_id = uuid::Uuid::new_v4().to_string();
        let hub = Arc::new(FanoutHub::new(options.queue_depth));
        let emitting = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(PublisherStats::default());

        let session = SessionConfig {
            topic: options.topic.clone(),
            publisher_id: publisher_id.clone(),
            heartbeat_interval: options.heartbeat_interval,
            handshake_timeout: options.handshake_timeout,
        };
        let server = EndpointServer::bind(
            &options.endpoint,
            Arc::clone(&hub),
            session,
            Arc::clone(&emitting),
            Arc::clone(&stats),
        )
        .await?;
        let local_addr = server.local_addr()?;

        info!(
            endpoint = %options.endpoint,
            %local_addr,
            %publisher_id,
            topic = %options.topic,
            "[Publisher] Endpoint bound"
        );

        Ok(Self {
            server,
            status: PublisherStatus {
                publisher_id: publisher_id.into(),
                emitting,
                records_published: Arc::new(AtomicU64::new(0)),
                encode_errors: Arc::new(AtomicU64::new(0)),
                stats,
                hub: Arc::clone(&hub),
            },
            hub,
            grace_period: options.grace_period,
            local_addr,
        })
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn status(&self) -> PublisherStatus {
        self.status.clone()
    }

    /// Serve subscribers, wait out the grace period, then publish every
    /// record from `source` until it ends or `cancel` fires.
    ///
    /// Returns the number of records published. After a source EOF the
    /// endpoint stays up until cancellation.
    pub async fn run<S: RecordSource>(
        self,
        mut source: S,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let server_cancel = cancel.child_token();
        let server = tokio::spawn(self.server.serve(server_cancel.clone()));
        let status = self.status;

        if !self.grace_period.is_zero() {
            info!(
                grace_secs = self.grace_period.as_secs_f64(),
                "[Publisher] Grace period started, subscribers may attach"
            );
            tokio::select! {
                () = cancel.cancelled() => {
                    stop_server(server_cancel, server).await;
                    return Ok(0);
                }
                () = tokio::time::sleep(self.grace_period) => {}
            }
        }

        status.emitting.store(true, Ordering::Release);
        info!(
            source = source.source_name(),
            subscribers = self.hub.receiver_count(),
            "[Publisher] Emitting"
        );

        let mut published: u64 = 0;
        let outcome = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break Ok(()),
                event = source.next_record() => match event {
                    Ok(RecordEvent::Record(record)) => {
                        match wire::encode(&WireMessage::Record(record)) {
                            Ok(frame) => {
                                self.hub.publish(frame);
                                published += 1;
                                status.records_published.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                status.encode_errors.fetch_add(1, Ordering::Relaxed);
                                warn!(error = %e, "[Publisher] Record not encodable, skipped");
                            }
                        }
                    }
                    Ok(RecordEvent::Eof) => {
                        info!(published, "[Publisher] Source ended, endpoint stays up");
                        cancel.cancelled().await;
                        break Ok(());
                    }
                    Err(e) => {
                        let name = source.source_name().to_string();
                        break Err(e.context(format!("source {name} failed")));
                    }
                },
            }
        };

        stop_server(server_cancel, server).await;
        info!(published, "[Publisher] Stopped");
        outcome.map(|()| published)
    }
}

async fn stop_server(cancel: CancellationToken, server: tokio::task::JoinHandle<()>) {
    cancel.cancel();
    if let Err(e) = server.await {
        warn!(error = %e, "[Publisher] Endpoint task ended abnormally");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::Dataset;
    use crate::acquisition::ReplaySource;
    use crate::transport::connect_and_subscribe;
    use crate::types::fixtures::record;
    use futures::StreamExt;

    fn options(grace: Duration) -> PublisherOptions {
        PublisherOptions {
            endpoint: Endpoint::new("127.0.0.1", 0),
            topic: "threephase".to_string(),
            grace_period: grace,
            heartbeat_interval: Duration::from_millis(100),
            queue_depth: 64,
            handshake_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let first = Publisher::bind(options(Duration::ZERO)).await.unwrap();
        let mut taken = options(Duration::ZERO);
        taken.endpoint = Endpoint::new("127.0.0.1", first.local_addr().port());
        assert!(matches!(Publisher::bind(taken).await, Err(TransportError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_not_emitting_during_grace() {
        let publisher = Publisher::bind(options(Duration::from_secs(30))).await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", publisher.local_addr().port());
        let status = publisher.status();
        let cancel = CancellationToken::new();
        let dataset = Dataset::from_records(vec![record("D1", 0, [1.0, 2.0, 3.0])]).unwrap();
        let task = tokio::spawn(publisher.run(ReplaySource::new(dataset, 60.0), cancel.clone()));

        let (_conn, handshake) = connect_and_subscribe(
            &endpoint,
            "threephase",
            "grace-test",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(!handshake.emitting);
        assert!(!status.is_emitting());
        assert_eq!(handshake.publisher_id, status.publisher_id());

        cancel.cancel();
        assert_eq!(task.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_records_reach_attached_subscriber() {
        let publisher = Publisher::bind(options(Duration::from_millis(200))).await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", publisher.local_addr().port());
        let cancel = CancellationToken::new();
        let records = (0..3).map(|s| record("D1", s, [100.0, 110.0, 105.0])).collect();
        let source = ReplaySource::new(Dataset::from_records(records).unwrap(), 200.0);

        let (mut conn, _) = connect_and_subscribe(
            &endpoint,
            "three",
            "pump-test",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let task = tokio::spawn(publisher.run(source, cancel.clone()));

        let mut seen = Vec::new();
        while seen.len() < 5 {
            let body = tokio::time::timeout(Duration::from_secs(5), conn.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Some(r) = wire::decode_record(&body).unwrap() {
                seen.push(r.sequence);
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        cancel.cancel();
        assert!(task.await.unwrap().unwrap() >= 5);
    }
}
