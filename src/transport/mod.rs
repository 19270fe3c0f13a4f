//! Brokerless fan-out transport
//!
//! - [`FanoutHub`]: one bounded broadcast queue, one receiver per session
//! - [`EndpointServer`]: TCP accept loop and per-subscriber sessions
//! - [`connect_and_subscribe`]: subscriber side of the handshake

pub mod client;
pub mod hub;
pub mod server;

pub use client::{connect_and_subscribe, Connection, Handshake};
pub use hub::FanoutHub;
pub use server::{EndpointServer, PublisherStats, SessionConfig};

use crate::wire::WireError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Cannot bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("Cannot connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Subscription rejected: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Errors that retrying cannot fix.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}
