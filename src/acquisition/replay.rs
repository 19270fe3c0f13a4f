//! Looping replay of a recorded dataset
//!
//! The dataset is never mutated: a [`ReplayCursor`] walks it cyclically and
//! every emitted record is a re-stamped copy. Each pass over the dataset is
//! an *epoch*; at the start of an epoch the wall-clock anchor is taken as
//! `max(now, last_emitted + period)`, so timestamps keep increasing strictly
//! across the loop boundary even if the clock is coarse or paused.
//!
//! Pacing is drift-free: frame `n` is released at `start + n * period`,
//! measured from the first frame, regardless of how long each emission took.
//!
//! Sequence numbers are the emitted-frame counter. An export that recorded
//! its own numbers keeps them for the first pass; later passes continue
//! from the highest recorded number.

use super::dataset::Dataset;
use super::source::{RecordEvent, RecordSource};
use crate::types::CycleRecord;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Fallback period when a rate cannot be turned into one (60 Hz).
const FALLBACK_PERIOD: Duration = Duration::from_nanos(16_666_667);

// ============================================================================
// Pacer
// ============================================================================

/// Releases ticks at `start + n * period`.
///
/// The clock starts at the first `wait`, so time spent before emission
/// begins (the grace period) never causes a burst.
#[derive(Debug, Clone)]
pub struct Pacer {
    period: Duration,
    start: Option<Instant>,
    ticks: u64,
}

impl Pacer {
    pub const fn new(period: Duration) -> Self {
        Self {
            period,
            start: None,
            ticks: 0,
        }
    }

    /// Pacer for `rate_hz` ticks per second.
    pub fn from_rate(rate_hz: f64) -> Self {
        Self::new(period_for_rate(rate_hz))
    }

    pub const fn period(&self) -> Duration {
        self.period
    }

    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Offset of tick `n` from the start instant.
    pub fn offset(&self, n: u64) -> Duration {
        let nanos = self.period.as_nanos().saturating_mul(u128::from(n));
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Wait for the next tick. Returns immediately when running behind.
    pub async fn wait(&mut self) {
        let start = *self.start.get_or_insert_with(Instant::now);
        let deadline = start + self.offset(self.ticks);
        self.ticks += 1;
        tokio::time::sleep_until(deadline).await;
    }
}

/// Period for a rate in Hz; non-positive or non-finite rates fall back to 60 Hz.
pub fn period_for_rate(rate_hz: f64) -> Duration {
    if rate_hz.is_finite() && rate_hz > 0.0 {
        Duration::try_from_secs_f64(1.0 / rate_hz)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(FALLBACK_PERIOD)
    } else {
        FALLBACK_PERIOD
    }
}

// ============================================================================
// Replay Source
// ============================================================================

/// Position inside the dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayCursor {
    /// Frame index within the dataset
    pub frame: usize,
    /// Record index within the frame
    pub slot: usize,
    /// Completed passes over the dataset
    pub epoch: u64,
}

impl ReplayCursor {
    const fn at_epoch_start(&self) -> bool {
        self.frame == 0 && self.slot == 0
    }
}

/// Replays a dataset forever at a fixed frame rate.
pub struct ReplaySource {
    frames: Arc<[Vec<CycleRecord>]>,
    cursor: ReplayCursor,
    pacer: Pacer,
    period_nanos: i64,
    anchor: DateTime<Utc>,
    frame_stamp: DateTime<Utc>,
    last_stamp: Option<DateTime<Utc>>,
    frames_emitted: u64,
    /// Highest recorded sequence, when the export carried its own numbers
    recorded_max: Option<u64>,
}

impl ReplaySource {
    /// Replay at `rate_hz` frames per second.
    pub fn new(dataset: Dataset, rate_hz: f64) -> Self {
        Self::with_period(dataset, period_for_rate(rate_hz))
    }

    pub fn with_period(dataset: Dataset, period: Duration) -> Self {
        let recorded = dataset.has_recorded_sequences();
        let frames: Arc<[Vec<CycleRecord>]> = dataset.into_frames().into();
        let recorded_max = if recorded {
            frames.iter().flatten().map(|r| r.sequence).max()
        } else {
            None
        };
        let now = Utc::now();
        Self {
            frames,
            cursor: ReplayCursor::default(),
            pacer: Pacer::new(period),
            period_nanos: i64::try_from(period.as_nanos()).unwrap_or(i64::MAX),
            anchor: now,
            frame_stamp: now,
            last_stamp: None,
            frames_emitted: 0,
            recorded_max,
        }
    }

    pub const fn cursor(&self) -> ReplayCursor {
        self.cursor
    }

    pub const fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    fn period_delta(&self, frames: usize) -> TimeDelta {
        let n = i64::try_from(frames).unwrap_or(i64::MAX);
        TimeDelta::nanoseconds(self.period_nanos.saturating_mul(n))
    }

    /// Wall-clock anchor for a new epoch.
    fn next_anchor(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.last_stamp {
            None => now,
            Some(last) => {
                let floor = last
                    .checked_add_signed(self.period_delta(1))
                    .unwrap_or(last);
                now.max(floor)
            }
        }
    }

    fn sequence_for(&self, record: &CycleRecord) -> u64 {
        match self.recorded_max {
            Some(_) if self.cursor.epoch == 0 => record.sequence,
            Some(max) => {
                let looped = self.frames_emitted.saturating_sub(self.frames.len() as u64);
                max.saturating_add(1).saturating_add(looped)
            }
            None => self.frames_emitted,
        }
    }

    fn advance(&mut self) {
        self.cursor.slot += 1;
        if self.cursor.slot >= self.frames[self.cursor.frame].len() {
            self.cursor.slot = 0;
            self.cursor.frame += 1;
            self.frames_emitted += 1;
            if self.cursor.frame >= self.frames.len() {
                self.cursor.frame = 0;
                self.cursor.epoch += 1;
            }
        }
    }
}

#[async_trait]
impl RecordSource for ReplaySource {
    async fn next_record(&mut self) -> Result<RecordEvent> {
        if self.frames.is_empty() {
            return Ok(RecordEvent::Eof);
        }

        if self.cursor.slot == 0 {
            self.pacer.wait().await;

            if self.cursor.at_epoch_start() {
                self.anchor = self.next_anchor();
                if self.cursor.epoch > 0 {
                    info!(
                        epoch = self.cursor.epoch,
                        anchor = %self.anchor,
                        "[Replay] Dataset exhausted, looping"
                    );
                } else {
                    debug!(anchor = %self.anchor, "[Replay] First epoch anchored");
                }
            }

            let offset = self.period_delta(self.cursor.frame);
            self.frame_stamp = self
                .anchor
                .checked_add_signed(offset)
                .unwrap_or(self.anchor);
            self.last_stamp = Some(self.frame_stamp);
        }

        let recorded = &self.frames[self.cursor.frame][self.cursor.slot];
        let record = recorded.restamped(self.frame_stamp, self.sequence_for(recorded));
        self.advance();
        Ok(RecordEvent::Record(record))
    }

    fn source_name(&self) -> &str {
        "replay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::record;

    fn dataset(frames: usize, devices: &[&str]) -> Dataset {
        let mut records = Vec::new();
        for f in 0..frames {
            for d in devices {
                let mut r = record(d, f as u64, [100.0, 110.0, 105.0]);
                r.timestamp = DateTime::from_timestamp_millis(1_000 + f as i64 * 17).unwrap();
                records.push(r);
            }
        }
        Dataset::from_records(records).unwrap()
    }

    async fn next(source: &mut ReplaySource) -> CycleRecord {
        match source.next_record().await.unwrap() {
            RecordEvent::Record(r) => r,
            RecordEvent::Eof => panic!("replay never ends"),
        }
    }

    #[test]
    fn test_period_for_rate() {
        assert_eq!(period_for_rate(50.0), Duration::from_millis(20));
        assert_eq!(period_for_rate(0.0), FALLBACK_PERIOD);
        assert_eq!(period_for_rate(f64::NAN), FALLBACK_PERIOD);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timestamps_strictly_increase_across_loop() {
        let mut source = ReplaySource::new(dataset(4, &["D1"]), 60.0);
        let mut last: Option<DateTime<Utc>> = None;
        for _ in 0..13 {
            let r = next(&mut source).await;
            if let Some(prev) = last {
                assert!(r.timestamp > prev, "{} !> {}", r.timestamp, prev);
            }
            last = Some(r.timestamp);
        }
        assert_eq!(source.cursor().epoch, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_records_share_stamp_and_sequence() {
        let mut source = ReplaySource::new(dataset(2, &["D1", "D2"]), 60.0);
        let a = next(&mut source).await;
        let b = next(&mut source).await;
        let c = next(&mut source).await;
        assert_eq!(a.device_id, "D1");
        assert_eq!(b.device_id, "D2");
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!((a.sequence, b.sequence, c.sequence), (0, 0, 1));
        assert!(c.timestamp > b.timestamp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_keeps_counting_after_wrap() {
        let mut source = ReplaySource::new(dataset(3, &["D1"]), 60.0);
        let seqs: Vec<u64> = {
            let mut v = Vec::new();
            for _ in 0..7 {
                v.push(next(&mut source).await.sequence);
            }
            v
        };
        assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_follows_fixed_schedule() {
        let mut source = ReplaySource::with_period(dataset(10, &["D1"]), Duration::from_millis(20));
        let start = Instant::now();
        for _ in 0..25 {
            next(&mut source).await;
        }
        // 25 frames: first at t=0, last at t=24 * 20ms.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(480), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(482), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_catches_up_when_behind() {
        let mut pacer = Pacer::new(Duration::from_millis(10));
        let start = Instant::now();
        pacer.wait().await;
        tokio::time::sleep(Duration::from_millis(35)).await;
        // Ticks 1..=3 are already due; they must not add delay.
        pacer.wait().await;
        pacer.wait().await;
        pacer.wait().await;
        assert!(start.elapsed() < Duration::from_millis(37));
        pacer.wait().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(42), "{elapsed:?}");
    }
}
