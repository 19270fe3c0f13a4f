//! Publisher endpoint: accept loop and per-subscriber sessions.
//!
//! A session is a small state machine:
//!
//! 1. read `Subscribe` (bounded by the handshake timeout)
//! 2. attach a hub receiver, then answer `Ready`
//! 3. stream hub frames and heartbeats until either side goes away
//!
//! Attaching before `Ready` means a subscriber that has seen `Ready` is
//! guaranteed to be queued for the next published record.

use super::hub::FanoutHub;
use super::TransportError;
use crate::wire::{self, Endpoint, WireMessage};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Per-session settings shared by every connection.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub topic: String,
    pub publisher_id: String,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
}

/// Endpoint counters, readable while the server runs.
#[derive(Debug, Default)]
pub struct PublisherStats {
    pub sessions_accepted: AtomicU64,
    pub sessions_active: AtomicU64,
    pub sessions_rejected: AtomicU64,
    pub handshake_failures: AtomicU64,
    pub frames_sent: AtomicU64,
    pub records_lagged: AtomicU64,
}

impl PublisherStats {
    pub fn active(&self) -> u64 {
        self.sessions_active.load(Ordering::Relaxed)
    }
}

/// Decrements the active-session gauge however the session ends.
struct ActiveGuard<'a>(&'a AtomicU64);

impl<'a> ActiveGuard<'a> {
    fn enter(gauge: &'a AtomicU64) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct EndpointServer {
    listener: TcpListener,
    hub: Arc<FanoutHub>,
    config: Arc<SessionConfig>,
    emitting: Arc<AtomicBool>,
    stats: Arc<PublisherStats>,
}

impl EndpointServer {
    /// Bind the endpoint. Failure here is fatal for the publisher.
    pub async fn bind(
        endpoint: &Endpoint,
        hub: Arc<FanoutHub>,
        config: SessionConfig,
        emitting: Arc<AtomicBool>,
        stats: Arc<PublisherStats>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(endpoint.socket_addr())
            .await
            .map_err(|source| TransportError::Bind {
                endpoint: endpoint.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            hub,
            config: Arc::new(config),
            emitting,
            stats,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept subscribers until cancelled, then wait for open sessions.
    pub async fn serve(self, cancel: CancellationToken) {
        let sessions = TaskTracker::new();
        info!(
            addr = ?self.listener.local_addr().ok(),
            topic = %self.config.topic,
            "[Endpoint] Accepting subscribers"
        );

        loop {
            let accepted = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    self.stats.sessions_accepted.fetch_add(1, Ordering::Relaxed);
                    let _ = stream.set_nodelay(true);
                    let session = Session {
                        peer,
                        hub: Arc::clone(&self.hub),
                        config: Arc::clone(&self.config),
                        emitting: Arc::clone(&self.emitting),
                        stats: Arc::clone(&self.stats),
                    };
                    let cancel = cancel.clone();
                    sessions.spawn(async move {
                        if let Err(e) = session.run(stream, cancel).await {
                            debug!(%peer, error = %e, "[Endpoint] Session ended with error");
                        }
                    });
                }
                Err(e) => {
                    // Usually fd exhaustion; back off briefly instead of spinning.
                    warn!(error = %e, "[Endpoint] Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        sessions.close();
        sessions.wait().await;
        info!("[Endpoint] Stopped");
    }
}

struct Session {
    peer: SocketAddr,
    hub: Arc<FanoutHub>,
    config: Arc<SessionConfig>,
    emitting: Arc<AtomicBool>,
    stats: Arc<PublisherStats>,
}

impl Session {
    async fn run(self, stream: TcpStream, cancel: CancellationToken) -> Result<(), TransportError> {
        let mut framed = Framed::new(stream, wire::frame_codec());

        let first = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            first = tokio::time::timeout(self.config.handshake_timeout, framed.next()) => first,
        };
        let body = match first {
            Ok(Some(Ok(body))) => body,
            Ok(Some(Err(e))) => {
                self.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
            Ok(None) => {
                self.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                return Err(TransportError::Closed);
            }
            Err(_) => {
                self.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %self.peer, "[Endpoint] No subscribe frame before timeout");
                return Err(TransportError::Timeout("handshake"));
            }
        };

        let (requested, client) = match wire::decode(&body) {
            Ok(WireMessage::Subscribe { topic, client }) => (topic, client),
            Ok(other) => {
                self.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                return Err(TransportError::Protocol(format!(
                    "expected subscribe, got {}",
                    other.kind()
                )));
            }
            Err(e) => {
                self.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        if !self.config.topic.starts_with(&requested) {
            self.stats.sessions_rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                peer = %self.peer,
                client = %client,
                requested = %requested,
                "[Endpoint] Topic does not match, rejecting"
            );
            let reason = format!("topic '{}' is not published here", requested);
            framed.send(wire::encode(&WireMessage::Rejected { reason })?).await?;
            return Ok(());
        }

        let mut rx = self.hub.subscribe();
        let ready = WireMessage::Ready {
            topic: self.config.topic.clone(),
            publisher_id: self.config.publisher_id.clone(),
            emitting: self.emitting.load(Ordering::Acquire),
        };
        framed.send(wire::encode(&ready)?).await?;

        let _active = ActiveGuard::enter(&self.stats.sessions_active);
        info!(
            peer = %self.peer,
            client = %client,
            subscribers = self.hub.receiver_count(),
            "[Endpoint] Subscriber attached"
        );

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let mut lagged: u64 = 0;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,

                frame = rx.recv() => match frame {
                    Ok(frame) => {
                        framed.send(frame).await?;
                        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        lagged += skipped;
                        self.stats.records_lagged.fetch_add(skipped, Ordering::Relaxed);
                        warn!(
                            client = %client,
                            skipped,
                            total_skipped = lagged,
                            "[Endpoint] Subscriber too slow, records dropped"
                        );
                    }
                    Err(RecvError::Closed) => break,
                },

                _ = heartbeat.tick() => {
                    framed.send(wire::encode(&WireMessage::heartbeat())?).await?;
                }

                inbound = framed.next() => match inbound {
                    None => break,
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => {}
                },
            }
        }

        info!(peer = %self.peer, client = %client, lagged, "[Endpoint] Subscriber detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::record;
    use bytes::Bytes;
    use tokio_util::codec::LengthDelimitedCodec;

    async fn start(
        topic: &str,
    ) -> (SocketAddr, Arc<FanoutHub>, Arc<PublisherStats>, CancellationToken) {
        let hub = Arc::new(FanoutHub::new(64));
        let stats = Arc::new(PublisherStats::default());
        let config = SessionConfig {
            topic: topic.to_string(),
            publisher_id: "pub-1".to_string(),
            heartbeat_interval: Duration::from_millis(50),
            handshake_timeout: Duration::from_millis(500),
        };
        let server = EndpointServer::bind(
            &Endpoint::new("127.0.0.1", 0),
            Arc::clone(&hub),
            config,
            Arc::new(AtomicBool::new(true)),
            Arc::clone(&stats),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(cancel.clone()));
        (addr, hub, stats, cancel)
    }

    async fn handshake(
        addr: SocketAddr,
        topic: &str,
    ) -> (Framed<TcpStream, LengthDelimitedCodec>, WireMessage) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, wire::frame_codec());
        let subscribe = WireMessage::Subscribe {
            topic: topic.to_string(),
            client: "test".to_string(),
        };
        framed.send(wire::encode(&subscribe).unwrap()).await.unwrap();
        let reply = wire::decode(&framed.next().await.unwrap().unwrap()).unwrap();
        (framed, reply)
    }

    #[tokio::test]
    async fn test_ready_then_records() {
        let (addr, hub, stats, cancel) = start("threephase").await;
        let (mut framed, reply) = handshake(addr, "three").await;
        assert!(matches!(reply, WireMessage::Ready { emitting: true, .. }));

        let frame = wire::encode(&WireMessage::Record(record("D1", 7, [1.0, 2.0, 3.0]))).unwrap();
        assert_eq!(hub.publish(frame), 1);

        loop {
            let body = framed.next().await.unwrap().unwrap();
            match wire::decode(&body).unwrap() {
                WireMessage::Record(r) => {
                    assert_eq!(r.sequence, 7);
                    break;
                }
                WireMessage::Heartbeat { .. } => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(stats.sessions_accepted.load(Ordering::Relaxed), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_topic_mismatch_rejected() {
        let (addr, hub, stats, cancel) = start("threephase").await;
        let (_framed, reply) = handshake(addr, "singlephase").await;
        assert!(matches!(reply, WireMessage::Rejected { .. }));
        assert_eq!(stats.sessions_rejected.load(Ordering::Relaxed), 1);
        assert_eq!(hub.receiver_count(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_heartbeats_flow_while_idle() {
        let (addr, _hub, _stats, cancel) = start("threephase").await;
        let (mut framed, _) = handshake(addr, "").await;
        let body = tokio::time::timeout(Duration::from_secs(2), framed.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(wire::decode(&body).unwrap(), WireMessage::Heartbeat { .. }));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_garbage_handshake_closes_session() {
        let (addr, hub, stats, cancel) = start("threephase").await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, wire::frame_codec());
        framed.send(Bytes::from_static(b"\xc1\xc1")).await.unwrap();
        assert!(framed.next().await.is_none());
        assert_eq!(hub.receiver_count(), 0);
        assert_eq!(stats.handshake_failures.load(Ordering::Relaxed), 1);
        cancel.cancel();
    }
}
