//! Time-series reducer
//!
//! Each record becomes one row per phase (or a single aggregate row) in an
//! in-memory batch. A flush happens on whichever comes first: the flush
//! interval or the row threshold. A failing sink is retried with capped
//! exponential backoff; once the retry budget is spent the batch is dropped
//! and counted, and the reducer carries on with the next batch.

use crate::backoff::Backoff;
use crate::config::TimeSeriesConfig;
use crate::storage::TimeSeriesSink;
use crate::subscriber::RecordReducer;
use crate::types::{CycleRecord, PhaseReading, RowLayout, TimeSeriesRow};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ============================================================================
// Row decomposition
// ============================================================================

fn phase_fields(reading: &PhaseReading) -> Map<String, Value> {
    reading
        .scalars()
        .into_iter()
        .map(|(name, value)| (name.to_string(), Value::from(value)))
        .collect()
}

/// Rows for one record.
///
/// `PerPhase`: three rows keyed by device, phase label inside `data`.
/// `Aggregate`: one row with a bucket per phase and three-phase totals.
pub fn decompose(record: &CycleRecord, layout: RowLayout) -> Vec<TimeSeriesRow> {
    match layout {
        RowLayout::PerPhase => record
            .phases
            .iter()
            .map(|reading| {
                let mut data = Map::new();
                data.insert("phase".into(), Value::from(reading.phase.as_str()));
                data.insert("sequence".into(), Value::from(record.sequence));
                data.extend(phase_fields(reading));
                TimeSeriesRow {
                    time: record.timestamp,
                    device: record.device_id.clone(),
                    data: Value::Object(data),
                }
            })
            .collect(),
        RowLayout::Aggregate => {
            let mut data = Map::new();
            data.insert("sequence".into(), Value::from(record.sequence));
            for reading in &record.phases {
                data.insert(
                    format!("phase_{}", reading.phase.as_str()),
                    Value::Object(phase_fields(reading)),
                );
            }
            data.insert(
                "three_phase_real_power".into(),
                Value::from(record.total_real_power()),
            );
            data.insert(
                "three_phase_reactive_power".into(),
                Value::from(record.total_reactive_power()),
            );
            vec![TimeSeriesRow {
                time: record.timestamp,
                device: record.device_id.clone(),
                data: Value::Object(data),
            }]
        }
    }
}

// ============================================================================
// Retry policy and stats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 means a single try.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn from_config(config: &TimeSeriesConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Backoff::new(
                Duration::from_millis(config.retry_initial_ms),
                Duration::from_millis(config.retry_max_ms),
                0.1,
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct TimeSeriesStats {
    pub rows_buffered: AtomicU64,
    pub rows_written: AtomicU64,
    pub batches_written: AtomicU64,
    pub retries: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub rows_dropped: AtomicU64,
    pub overflow_dropped: AtomicU64,
}

/// Point-in-time copy of [`TimeSeriesStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimeSeriesSnapshot {
    pub rows_buffered: u64,
    pub rows_written: u64,
    pub batches_written: u64,
    pub retries: u64,
    pub batches_dropped: u64,
    pub rows_dropped: u64,
    pub overflow_dropped: u64,
}

impl TimeSeriesStats {
    pub fn snapshot(&self) -> TimeSeriesSnapshot {
        TimeSeriesSnapshot {
            rows_buffered: self.rows_buffered.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            rows_dropped: self.rows_dropped.load(Ordering::Relaxed),
            overflow_dropped: self.overflow_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered
    Empty,
    Written { rows: usize, attempts: u32 },
    /// Retry budget exhausted; the rows are gone
    Dropped { rows: usize, attempts: u32 },
}

// ============================================================================
// Reducer
// ============================================================================

pub struct TimeSeriesReducer {
    layout: RowLayout,
    sink: Arc<dyn TimeSeriesSink>,
    retry: RetryPolicy,
    flush_interval: Duration,
    flush_threshold: usize,
    max_pending_rows: usize,
    batch: Mutex<Vec<TimeSeriesRow>>,
    threshold_reached: Notify,
    /// Serializes flushes so rows reach the sink in production order.
    flushing: tokio::sync::Mutex<()>,
    overflowing: AtomicBool,
    stats: TimeSeriesStats,
}

impl TimeSeriesReducer {
    pub fn new(config: &TimeSeriesConfig, sink: Arc<dyn TimeSeriesSink>) -> Self {
        Self {
            layout: config.layout,
            sink,
            retry: RetryPolicy::from_config(config),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
            flush_threshold: config.flush_threshold_rows.max(1),
            max_pending_rows: config.max_pending_rows.max(config.flush_threshold_rows),
            batch: Mutex::new(Vec::with_capacity(config.flush_threshold_rows)),
            threshold_reached: Notify::new(),
            flushing: tokio::sync::Mutex::new(()),
            overflowing: AtomicBool::new(false),
            stats: TimeSeriesStats::default(),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub const fn layout(&self) -> RowLayout {
        self.layout
    }

    pub const fn stats(&self) -> &TimeSeriesStats {
        &self.stats
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    fn lock_batch(&self) -> MutexGuard<'_, Vec<TimeSeriesRow>> {
        self.batch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pending_rows(&self) -> usize {
        self.lock_batch().len()
    }

    /// Append one record's rows. Never touches the sink.
    pub fn ingest(&self, record: &CycleRecord) {
        let rows = decompose(record, self.layout);
        let added = rows.len();

        let pending = {
            let mut batch = self.lock_batch();
            if batch.len() + added > self.max_pending_rows {
                drop(batch);
                self.stats
                    .overflow_dropped
                    .fetch_add(added as u64, Ordering::Relaxed);
                if !self.overflowing.swap(true, Ordering::Relaxed) {
                    warn!(
                        max_pending_rows = self.max_pending_rows,
                        "[TimeSeries] Buffer full while sink is failing, dropping rows"
                    );
                }
                return;
            }
            batch.extend(rows);
            batch.len()
        };

        self.overflowing.store(false, Ordering::Relaxed);
        self.stats
            .rows_buffered
            .fetch_add(added as u64, Ordering::Relaxed);
        if pending >= self.flush_threshold {
            self.threshold_reached.notify_one();
        }
    }

    /// Swap the batch out and write it, retrying per the policy.
    pub async fn flush(&self) -> FlushOutcome {
        let _serial = self.flushing.lock().await;
        let rows = std::mem::replace(
            &mut *self.lock_batch(),
            Vec::with_capacity(self.flush_threshold),
        );
        if rows.is_empty() {
            return FlushOutcome::Empty;
        }

        let count = rows.len();
        let mut attempt: u32 = 0;
        loop {
            match self.sink.write_batch(&rows).await {
                Ok(()) => {
                    self.stats
                        .rows_written
                        .fetch_add(count as u64, Ordering::Relaxed);
                    self.stats.batches_written.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        rows = count,
                        attempts = attempt + 1,
                        sink = self.sink.name(),
                        "[TimeSeries] Batch written"
                    );
                    return FlushOutcome::Written {
                        rows: count,
                        attempts: attempt + 1,
                    };
                }
                Err(e) if attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff.delay(attempt);
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        rows = count,
                        attempt = attempt + 1,
                        max_retries = self.retry.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "[TimeSeries] Sink write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .rows_dropped
                        .fetch_add(count as u64, Ordering::Relaxed);
                    error!(
                        rows = count,
                        attempts = attempt + 1,
                        sink = self.sink.name(),
                        error = %e,
                        "[TimeSeries] Retry budget exhausted, batch dropped"
                    );
                    return FlushOutcome::Dropped {
                        rows: count,
                        attempts: attempt + 1,
                    };
                }
            }
        }
    }

    /// Flush on interval or threshold until cancelled, then flush once more.
    pub async fn run_flush_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(
            interval_ms = u64::try_from(self.flush_interval.as_millis()).unwrap_or(u64::MAX),
            threshold = self.flush_threshold,
            sink = self.sink.name(),
            "[TimeSeries] Flush loop started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                () = self.threshold_reached.notified() => {}
            }
            self.flush().await;
        }

        let outcome = self.flush().await;
        let stats = self.stats.snapshot();
        info!(
            ?outcome,
            rows_written = stats.rows_written,
            rows_dropped = stats.rows_dropped,
            "[TimeSeries] Final flush complete"
        );
    }
}

impl RecordReducer for TimeSeriesReducer {
    fn on_record(&self, record: &CycleRecord) {
        self.ingest(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySink;
    use crate::types::fixtures::record;

    fn config(layout: RowLayout) -> TimeSeriesConfig {
        TimeSeriesConfig {
            layout,
            flush_threshold_rows: 30,
            max_pending_rows: 60,
            ..TimeSeriesConfig::default()
        }
    }

    #[test]
    fn test_per_phase_rows() {
        let rows = decompose(&record("D1", 4, [100.0, 110.0, 105.0]), RowLayout::PerPhase);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.device == "D1"));
        let phases: Vec<&str> = rows.iter().map(|r| r.data["phase"].as_str().unwrap()).collect();
        assert_eq!(phases, vec!["a", "b", "c"]);
        assert_eq!(rows[1].data["real_power"], 110.0);
        assert_eq!(rows[2].data["sequence"], 4);
    }

    #[test]
    fn test_aggregate_row() {
        let rows = decompose(&record("D1", 0, [100.0, 110.0, 105.0]), RowLayout::Aggregate);
        assert_eq!(rows.len(), 1);
        let data = &rows[0].data;
        assert_eq!(data["phase_b"]["real_power"], 110.0);
        assert_eq!(data["three_phase_real_power"], 315.0);
        assert!(data.get("phase").is_none());
    }

    #[tokio::test]
    async fn test_threshold_wakes_flush_loop() {
        let sink = Arc::new(MemorySink::new());
        let reducer = Arc::new(TimeSeriesReducer::new(
            &TimeSeriesConfig {
                flush_interval_ms: 60_000,
                ..config(RowLayout::PerPhase)
            },
            sink.clone(),
        ));
        let cancel = CancellationToken::new();
        let task = {
            let reducer = Arc::clone(&reducer);
            let cancel = cancel.clone();
            tokio::spawn(async move { reducer.run_flush_loop(cancel).await })
        };

        for seq in 0..10 {
            reducer.ingest(&record("D1", seq, [1.0, 2.0, 3.0]));
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while sink.row_count() < 30 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(reducer.stats().snapshot().batches_written, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_drops_while_sink_fails() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next(u32::MAX);
        let reducer = TimeSeriesReducer::new(&config(RowLayout::PerPhase), sink.clone());

        for seq in 0..25 {
            reducer.ingest(&record("D1", seq, [1.0, 2.0, 3.0]));
        }
        // 60-row cap: 20 records fit, 5 are dropped.
        assert_eq!(reducer.pending_rows(), 60);
        let stats = reducer.stats().snapshot();
        assert_eq!(stats.overflow_dropped, 15);
        assert_eq!(stats.rows_buffered, 60);
    }

    #[tokio::test]
    async fn test_empty_flush() {
        let sink = Arc::new(MemorySink::new());
        let reducer = TimeSeriesReducer::new(&config(RowLayout::Aggregate), sink);
        assert_eq!(reducer.flush().await, FlushOutcome::Empty);
    }
}
