//! Fan-out wire protocol
//!
//! Every frame on the publisher endpoint is a 4-byte big-endian length prefix
//! followed by a MessagePack body. Bodies are encoded with named fields so a
//! peer ignores fields it does not know and defaults fields it does not
//! receive.
//!
//! ## Session
//!
//! ```text
//! subscriber                         publisher
//!     | -- Subscribe{topic} ------------> |   attach fan-out receiver
//!     | <------------ Ready{publisher_id} |
//!     | <------------ Record / Heartbeat  |   ...
//! ```

use crate::types::{CycleRecord, RecordError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::LengthDelimitedCodec;

/// Largest frame either side accepts (bytes).
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Invalid record: {0}")]
    InvalidRecord(#[from] RecordError),
}

/// Messages exchanged on a publisher connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// First frame from a subscriber. `topic` is a prefix filter.
    Subscribe { topic: String, client: String },

    /// Publisher accepted the subscription; every record published after
    /// this frame will be delivered (best effort, bounded queue).
    Ready {
        topic: String,
        publisher_id: String,
        #[serde(default)]
        emitting: bool,
    },

    /// Publisher refused the subscription.
    Rejected { reason: String },

    Record(CycleRecord),

    Heartbeat {
        #[serde(with = "chrono::serde::ts_microseconds")]
        at: DateTime<Utc>,
    },
}

impl WireMessage {
    pub fn heartbeat() -> Self {
        Self::Heartbeat { at: Utc::now() }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Ready { .. } => "ready",
            Self::Rejected { .. } => "rejected",
            Self::Record(_) => "record",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Encode a message body (without the length prefix).
pub fn encode(message: &WireMessage) -> Result<Bytes, WireError> {
    Ok(Bytes::from(rmp_serde::to_vec_named(message)?))
}

/// Decode a message body (without the length prefix).
pub fn decode(body: &[u8]) -> Result<WireMessage, WireError> {
    Ok(rmp_serde::from_slice(body)?)
}

/// Decode a body that must carry a valid record.
///
/// Heartbeats and control frames yield `Ok(None)`.
pub fn decode_record(body: &[u8]) -> Result<Option<CycleRecord>, WireError> {
    match decode(body)? {
        WireMessage::Record(record) => {
            record.validate()?;
            Ok(Some(record))
        }
        _ => Ok(None),
    }
}

/// Length-delimited framing shared by both ends of a connection.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

// ============================================================================
// Endpoint
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("endpoint '{0}' must use the tcp:// scheme")]
    Scheme(String),

    #[error("endpoint '{0}' is missing a port")]
    MissingPort(String),

    #[error("endpoint '{0}' has an invalid port")]
    InvalidPort(String),

    #[error("endpoint '{0}' has an empty host")]
    EmptyHost(String),

    #[error("either an endpoint or a host and port must be given")]
    Unresolved,
}

/// A `tcp://host:port` fan-out address.
///
/// A `*` host (bind on every interface) maps to `0.0.0.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = if host == "*" { "0.0.0.0".to_string() } else { host };
        Self { host, port }
    }

    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let rest = raw
            .trim()
            .strip_prefix("tcp://")
            .ok_or_else(|| EndpointError::Scheme(raw.to_string()))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::MissingPort(raw.to_string()))?;
        if host.is_empty() {
            return Err(EndpointError::EmptyHost(raw.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointError::InvalidPort(raw.to_string()))?;
        Ok(Self::new(host, port))
    }

    /// Resolve from either a full endpoint or a host + port pair.
    /// The full endpoint wins when both are given.
    pub fn resolve(
        endpoint: Option<&str>,
        host: Option<&str>,
        port: Option<u16>,
    ) -> Result<Self, EndpointError> {
        match (endpoint, host, port) {
            (Some(ep), _, _) => Self::parse(ep),
            (None, Some(h), Some(p)) => Ok(Self::new(h, p)),
            _ => Err(EndpointError::Unresolved),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form accepted by `TcpListener::bind` / `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
