//! In-process sink: keeps every written row in memory.
//!
//! Used for `--sink memory` dry runs and by tests, which can also script
//! write failures to exercise the retry path.

use super::{SinkError, TimeSeriesSink};
use crate::types::TimeSeriesRow;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Default)]
pub struct MemorySink {
    rows: Mutex<Vec<TimeSeriesRow>>,
    failures_remaining: AtomicU32,
    write_attempts: AtomicU64,
    batches_written: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `write_batch` fail.
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Snapshot of every row written so far, in write order.
    pub fn rows(&self) -> Vec<TimeSeriesRow> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Calls to `write_batch`, successful or not.
    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::Relaxed)
    }

    pub fn batches_written(&self) -> u64 {
        self.batches_written.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TimeSeriesSink for MemorySink {
    async fn write_batch(&self, rows: &[TimeSeriesRow]) -> Result<(), SinkError> {
        self.write_attempts.fetch_add(1, Ordering::Relaxed);
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Unavailable("scripted failure".to_string()));
        }
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(rows);
        self.batches_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let sink = MemorySink::new();
        sink.fail_next(2);
        let rows = vec![TimeSeriesRow {
            time: Utc::now(),
            device: "D1".into(),
            data: serde_json::json!({}),
        }];

        assert!(sink.write_batch(&rows).await.is_err());
        assert!(sink.write_batch(&rows).await.is_err());
        assert!(sink.write_batch(&rows).await.is_ok());
        assert_eq!(sink.write_attempts(), 3);
        assert_eq!(sink.batches_written(), 1);
        assert_eq!(sink.row_count(), 1);
    }
}
