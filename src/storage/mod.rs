//! Time-series sinks
//!
//! The time-series reducer only depends on the append-only
//! [`TimeSeriesSink`] contract. Three implementations ship:
//!
//! - [`SledSink`]: embedded database, one tree per device (default)
//! - [`MemorySink`]: in-process buffer for dry runs and tests
//! - `PostgresSink`: TimescaleDB hypertable partitioned by device
//!   (`timescale` feature)

mod memory;
#[cfg(feature = "timescale")]
mod postgres;
mod sled_sink;

pub use memory::MemorySink;
#[cfg(feature = "timescale")]
pub use postgres::PostgresSink;
pub use sled_sink::SledSink;

use crate::config::{SinkKind, StorageConfig};
use crate::types::TimeSeriesRow;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Database error: {0}")]
    Sled(#[from] sled::Error),

    #[cfg(feature = "timescale")]
    #[error("Database error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("Sink misconfigured: {0}")]
    Config(String),
}

/// Append-only write contract for time-series rows.
///
/// A batch is written entirely or reported as failed; callers retry whole
/// batches, so implementations must tolerate a batch being written twice.
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    async fn write_batch(&self, rows: &[TimeSeriesRow]) -> Result<(), SinkError>;

    /// Human-readable name for logging (e.g. "sled", "timescale").
    fn name(&self) -> &str;
}

/// Open the sink selected by the storage config.
pub async fn open_sink(config: &StorageConfig) -> Result<Arc<dyn TimeSeriesSink>, SinkError> {
    match config.kind {
        SinkKind::Sled => Ok(Arc::new(SledSink::open(&config.path)?)),
        SinkKind::Memory => Ok(Arc::new(MemorySink::new())),
        SinkKind::Timescale => open_timescale(config).await,
    }
}

#[cfg(feature = "timescale")]
async fn open_timescale(config: &StorageConfig) -> Result<Arc<dyn TimeSeriesSink>, SinkError> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| SinkError::Config("storage.url is not set".to_string()))?;
    let sink = PostgresSink::connect(url, &config.table).await?;
    sink.ensure_schema().await?;
    Ok(Arc::new(sink))
}

#[cfg(not(feature = "timescale"))]
async fn open_timescale(_config: &StorageConfig) -> Result<Arc<dyn TimeSeriesSink>, SinkError> {
    Err(SinkError::Config(
        "the timescale sink requires building with --features timescale".to_string(),
    ))
}
