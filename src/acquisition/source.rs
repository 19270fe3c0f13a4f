//! Record source abstraction for the publisher.
//!
//! The publisher pump calls [`RecordSource::next_record`] in a `select!`
//! with cancellation; sources handle pacing and reconnection internally.

use crate::types::CycleRecord;
use anyhow::Result;
use async_trait::async_trait;

/// Events produced by a record source.
#[derive(Debug)]
pub enum RecordEvent {
    /// A valid record, ready for emission.
    Record(CycleRecord),
    /// Source reached end of data (EOF on stdin, never for replay).
    Eof,
}

/// Where the publisher's records come from.
#[async_trait]
pub trait RecordSource: Send + 'static {
    /// Produce the next record.
    ///
    /// Returns `RecordEvent::Eof` when no more data will arrive.
    /// Returns `Err` on unrecoverable errors (e.g. exhausted reconnection).
    async fn next_record(&mut self) -> Result<RecordEvent>;

    /// Human-readable name for logging (e.g. "replay", "stdin", "live-tcp").
    fn source_name(&self) -> &str;
}
