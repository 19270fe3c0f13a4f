//! Time-Series Reducer Tests
//!
//! Row accounting, flush triggers and the bounded-retry contract, driven
//! through the public reducer API against in-memory and sled sinks.

mod common;

use chrono::{TimeDelta, Utc};
use common::{record, records};
use phasecast::backoff::Backoff;
use phasecast::config::TimeSeriesConfig;
use phasecast::reducers::{FlushOutcome, RetryPolicy, TimeSeriesReducer};
use phasecast::storage::{MemorySink, SledSink, TimeSeriesSink};
use phasecast::RowLayout;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config(layout: RowLayout) -> TimeSeriesConfig {
    TimeSeriesConfig {
        layout,
        flush_interval_ms: 100,
        flush_threshold_rows: 1_000,
        ..TimeSeriesConfig::default()
    }
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(40), 0.0),
    }
}

#[tokio::test]
async fn rows_per_record_follow_layout() {
    for (layout, per_record) in [(RowLayout::PerPhase, 3), (RowLayout::Aggregate, 1)] {
        let sink = Arc::new(MemorySink::new());
        let reducer = TimeSeriesReducer::new(&config(layout), sink.clone());
        for r in records("D1", 7) {
            reducer.ingest(&r);
        }
        assert_eq!(reducer.pending_rows(), 7 * per_record);
        reducer.flush().await;
        assert_eq!(sink.row_count(), 7 * per_record);
    }
}

#[tokio::test(start_paused = true)]
async fn final_flush_on_cancel_writes_everything() {
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

    let n = 123;
    for r in records("D1", n) {
        reducer.ingest(&r);
    }
    cancel.cancel();
    task.await.unwrap();

    assert_eq!(sink.row_count(), (n as usize) * 3);
    assert_eq!(reducer.pending_rows(), 0);
    assert_eq!(reducer.stats().snapshot().rows_written, n * 3);
}

#[tokio::test(start_paused = true)]
async fn failures_below_budget_lose_nothing() {
    let sink = Arc::new(MemorySink::new());
    let reducer = TimeSeriesReducer::new(&config(RowLayout::PerPhase), sink.clone())
        .with_retry_policy(fast_retry(3));

    for r in records("D1", 5) {
        reducer.ingest(&r);
    }
    sink.fail_next(3);

    let outcome = reducer.flush().await;
    assert_eq!(outcome, FlushOutcome::Written { rows: 15, attempts: 4 });
    assert_eq!(sink.row_count(), 15);

    let stats = reducer.stats().snapshot();
    assert_eq!(stats.retries, 3);
    assert_eq!(stats.batches_dropped, 0);
    assert_eq!(stats.rows_dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_drops_batch_once() {
    let sink = Arc::new(MemorySink::new());
    let reducer = TimeSeriesReducer::new(&config(RowLayout::PerPhase), sink.clone())
        .with_retry_policy(fast_retry(2));

    for r in records("D1", 4) {
        reducer.ingest(&r);
    }
    sink.fail_next(10);

    let outcome = reducer.flush().await;
    assert_eq!(outcome, FlushOutcome::Dropped { rows: 12, attempts: 3 });
    assert_eq!(sink.write_attempts(), 3);

    let stats = reducer.stats().snapshot();
    assert_eq!(stats.batches_dropped, 1);
    assert_eq!(stats.rows_dropped, 12);
    assert_eq!(sink.row_count(), 0);

    // The reducer keeps going once the sink recovers.
    sink.fail_next(0);
    for r in records("D1", 2) {
        reducer.ingest(&r);
    }
    assert_eq!(reducer.flush().await, FlushOutcome::Written { rows: 6, attempts: 1 });
    assert_eq!(reducer.stats().snapshot().batches_dropped, 1);
}

#[tokio::test]
async fn rows_keep_production_order_per_device() {
    let sink = Arc::new(MemorySink::new());
    let reducer = TimeSeriesReducer::new(&config(RowLayout::Aggregate), sink.clone());
    let start = Utc::now();
    for i in 0..20u64 {
        let device = if i % 2 == 0 { "D1" } else { "D2" };
        reducer.ingest(&record(device, i, start + TimeDelta::milliseconds(i as i64)));
        if i % 7 == 0 {
            reducer.flush().await;
        }
    }
    reducer.flush().await;

    for device in ["D1", "D2"] {
        let seqs: Vec<u64> = sink
            .rows()
            .iter()
            .filter(|r| r.device == device)
            .map(|r| r.data["sequence"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs.len(), 10);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{device}: {seqs:?}");
    }
}

#[tokio::test]
async fn sled_sink_stores_rows_per_device() {
    let dir = tempfile::tempdir().unwrap();
    let sled = Arc::new(SledSink::open(dir.path().join("rows.db")).unwrap());
    let sink: Arc<dyn TimeSeriesSink> = sled.clone();
    let reducer = TimeSeriesReducer::new(&config(RowLayout::PerPhase), sink);

    for r in records("D1", 5).iter().chain(records("D2", 2).iter()) {
        reducer.ingest(r);
    }
    reducer.flush().await;

    assert_eq!(sled.count("D1").unwrap(), 15);
    assert_eq!(sled.count("D2").unwrap(), 6);

    let recent = sled.recent("D1", 3).unwrap();
    assert_eq!(recent.len(), 3);
    assert!(recent.iter().all(|r| r.data["sequence"] == 4));
}
