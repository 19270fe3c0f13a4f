//! Subscriber side of the handshake.

use super::TransportError;
use crate::wire::{self, Endpoint, WireMessage};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

/// An established subscription stream.
pub type Connection = Framed<TcpStream, LengthDelimitedCodec>;

/// What the publisher told us when it accepted the subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub topic: String,
    pub publisher_id: String,
    pub emitting: bool,
}

/// Connect, send `Subscribe` and wait for `Ready`.
///
/// Returns once the publisher has attached this subscriber, so every record
/// published from then on is queued for it.
pub async fn connect_and_subscribe(
    endpoint: &Endpoint,
    topic: &str,
    client: &str,
    connect_timeout: Duration,
    handshake_timeout: Duration,
) -> Result<(Connection, Handshake), TransportError> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint.socket_addr()))
        .await
        .map_err(|_| TransportError::Timeout("connect"))?
        .map_err(|source| TransportError::Connect {
            endpoint: endpoint.to_string(),
            source,
        })?;

    let _ = stream.set_nodelay(true);
    let sock_ref = socket2::SockRef::from(&stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock_ref.set_tcp_keepalive(&keepalive);

    let mut framed = Framed::new(stream, wire::frame_codec());
    let subscribe = WireMessage::Subscribe {
        topic: topic.to_string(),
        client: client.to_string(),
    };
    framed.send(wire::encode(&subscribe)?).await?;

    let reply = tokio::time::timeout(handshake_timeout, framed.next())
        .await
        .map_err(|_| TransportError::Timeout("handshake"))?
        .ok_or(TransportError::Closed)??;

    match wire::decode(&reply)? {
        WireMessage::Ready {
            topic,
            publisher_id,
            emitting,
        } => {
            debug!(%endpoint, %publisher_id, emitting, "Subscription accepted");
            Ok((
                framed,
                Handshake {
                    topic,
                    publisher_id,
                    emitting,
                },
            ))
        }
        WireMessage::Rejected { reason } => Err(TransportError::Rejected(reason)),
        other => Err(TransportError::Protocol(format!(
            "expected ready, got {}",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_handshake_against_scripted_publisher() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, wire::frame_codec());
            let body = framed.next().await.unwrap().unwrap();
            let WireMessage::Subscribe { topic, client } = wire::decode(&body).unwrap() else {
                panic!("expected subscribe");
            };
            assert_eq!(client, "unit");
            let ready = WireMessage::Ready {
                topic,
                publisher_id: "abc".to_string(),
                emitting: false,
            };
            framed.send(wire::encode(&ready).unwrap()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let (_conn, hs) = connect_and_subscribe(
            &Endpoint::new("127.0.0.1", port),
            "threephase",
            "unit",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(hs.publisher_id, "abc");
        assert_eq!(hs.topic, "threephase");
        assert!(!hs.emitting);
    }

    #[tokio::test]
    async fn test_silent_publisher_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = connect_and_subscribe(
            &Endpoint::new("127.0.0.1", port),
            "threephase",
            "unit",
            Duration::from_secs(1),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::Timeout("handshake")));
    }
}
