//! Summary reducer: tumbling-window means per device.
//!
//! Every record is folded into its device's open [`WindowAccumulator`]
//! (sums and a count, never history). At each window boundary the whole
//! map is swapped for an empty one under the lock and the statistics are
//! computed outside it. A device with no records in a window produces no
//! statistic; its last published one stays on the board.

use crate::metrics::SummaryGauges;
use crate::subscriber::RecordReducer;
use crate::types::{CycleRecord, PhaseReading, SummaryStat};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// ============================================================================
// Accumulator
// ============================================================================

/// Running sums for one device in the open window.
///
/// Per-phase quantities are first averaged across the three phases of a
/// record; the window mean is the mean of those per-record values.
#[derive(Debug, Clone, Copy)]
pub struct WindowAccumulator {
    samples: u64,
    real_power: f64,
    reactive_power: f64,
    apparent_power: f64,
    voltage: f64,
    current: f64,
    power_factor: f64,
    frequency: f64,
    total_real_power: f64,
    total_reactive_power: f64,
    peak_real_power: f64,
    trough_real_power: f64,
    peak_apparent_power: f64,
    trough_apparent_power: f64,
}

impl Default for WindowAccumulator {
    fn default() -> Self {
        Self {
            samples: 0,
            real_power: 0.0,
            reactive_power: 0.0,
            apparent_power: 0.0,
            voltage: 0.0,
            current: 0.0,
            power_factor: 0.0,
            frequency: 0.0,
            total_real_power: 0.0,
            total_reactive_power: 0.0,
            peak_real_power: f64::NEG_INFINITY,
            trough_real_power: f64::INFINITY,
            peak_apparent_power: f64::NEG_INFINITY,
            trough_apparent_power: f64::INFINITY,
        }
    }
}

fn phase_mean(record: &CycleRecord, field: impl Fn(&PhaseReading) -> f64) -> f64 {
    record.phases.iter().map(field).sum::<f64>() / record.phases.len() as f64
}

impl WindowAccumulator {
    pub fn observe(&mut self, record: &CycleRecord) {
        let real_power = phase_mean(record, |p| p.real_power);
        let apparent_power = phase_mean(record, |p| p.apparent_power);
        self.samples += 1;
        self.real_power += real_power;
        self.reactive_power += phase_mean(record, |p| p.reactive_power);
        self.apparent_power += apparent_power;
        self.voltage += phase_mean(record, |p| p.voltage_rms);
        self.current += phase_mean(record, |p| p.current_rms);
        self.power_factor += phase_mean(record, |p| p.power_factor);
        self.frequency += phase_mean(record, |p| p.frequency);
        self.total_real_power += record.total_real_power();
        self.total_reactive_power += record.total_reactive_power();
        self.peak_real_power = self.peak_real_power.max(real_power);
        self.trough_real_power = self.trough_real_power.min(real_power);
        self.peak_apparent_power = self.peak_apparent_power.max(apparent_power);
        self.trough_apparent_power = self.trough_apparent_power.min(apparent_power);
    }

    pub const fn samples(&self) -> u64 {
        self.samples
    }

    /// Means over the window; `None` when nothing was observed.
    pub fn finish(&self, device_id: &str, window_end: DateTime<Utc>) -> Option<SummaryStat> {
        if self.samples == 0 {
            return None;
        }
        let n = self.samples as f64;
        Some(SummaryStat {
            window_end,
            device_id: device_id.to_string(),
            samples: self.samples,
            mean_real_power: self.real_power / n,
            mean_reactive_power: self.reactive_power / n,
            mean_apparent_power: self.apparent_power / n,
            mean_voltage: self.voltage / n,
            mean_current: self.current / n,
            mean_power_factor: self.power_factor / n,
            mean_frequency: self.frequency / n,
            mean_total_real_power: self.total_real_power / n,
            mean_total_reactive_power: self.total_reactive_power / n,
            peak_real_power: self.peak_real_power,
            trough_real_power: self.trough_real_power,
            peak_apparent_power: self.peak_apparent_power,
            trough_apparent_power: self.trough_apparent_power,
        })
    }
}

// ============================================================================
// Board
// ============================================================================

/// Latest closed-window statistic per device.
///
/// Readers get a consistent snapshot without blocking the window task.
pub struct SummaryBoard {
    latest: ArcSwap<HashMap<String, SummaryStat>>,
}

impl Default for SummaryBoard {
    fn default() -> Self {
        Self {
            latest: ArcSwap::from_pointee(HashMap::new()),
        }
    }
}

impl SummaryBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the entries for the given devices.
    pub fn publish(&self, stats: &[SummaryStat]) {
        if stats.is_empty() {
            return;
        }
        self.latest.rcu(|current| {
            let mut next = HashMap::clone(current);
            for stat in stats {
                next.insert(stat.device_id.clone(), stat.clone());
            }
            next
        });
    }

    pub fn get(&self, device_id: &str) -> Option<SummaryStat> {
        self.latest.load().get(device_id).cloned()
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, SummaryStat>> {
        self.latest.load_full()
    }

    /// All entries sorted by device.
    pub fn list(&self) -> Vec<SummaryStat> {
        let mut stats: Vec<SummaryStat> = self.latest.load().values().cloned().collect();
        stats.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        stats
    }

    pub fn device_count(&self) -> usize {
        self.latest.load().len()
    }
}

// ============================================================================
// Reducer
// ============================================================================

pub struct SummaryReducer {
    window: Duration,
    open: Mutex<HashMap<String, WindowAccumulator>>,
    board: Arc<SummaryBoard>,
    gauges: Option<SummaryGauges>,
    windows_closed: AtomicU64,
    stats_published: AtomicU64,
}

impl SummaryReducer {
    pub fn new(window: Duration, board: Arc<SummaryBoard>) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            open: Mutex::new(HashMap::new()),
            board,
            gauges: None,
            windows_closed: AtomicU64::new(0),
            stats_published: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_gauges(mut self, gauges: SummaryGauges) -> Self {
        self.gauges = Some(gauges);
        self
    }

    pub fn board(&self) -> Arc<SummaryBoard> {
        Arc::clone(&self.board)
    }

    pub fn windows_closed(&self) -> u64 {
        self.windows_closed.load(Ordering::Relaxed)
    }

    pub fn stats_published(&self) -> u64 {
        self.stats_published.load(Ordering::Relaxed)
    }

    fn lock_open(&self) -> MutexGuard<'_, HashMap<String, WindowAccumulator>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn observe(&self, record: &CycleRecord) {
        let mut open = self.lock_open();
        match open.get_mut(&record.device_id) {
            Some(acc) => acc.observe(record),
            None => {
                let mut acc = WindowAccumulator::default();
                acc.observe(record);
                open.insert(record.device_id.clone(), acc);
            }
        }
    }

    /// Close the open window: compute, publish and return its statistics.
    pub fn close_window(&self, window_end: DateTime<Utc>) -> Vec<SummaryStat> {
        let closed = std::mem::take(&mut *self.lock_open());
        self.windows_closed.fetch_add(1, Ordering::Relaxed);

        let mut stats: Vec<SummaryStat> = closed
            .iter()
            .filter_map(|(device, acc)| acc.finish(device, window_end))
            .collect();
        stats.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        if !stats.is_empty() {
            self.board.publish(&stats);
            if let Some(gauges) = &self.gauges {
                gauges.observe(&stats);
            }
            self.stats_published
                .fetch_add(stats.len() as u64, Ordering::Relaxed);
            debug!(devices = stats.len(), %window_end, "[Summary] Window closed");
        }
        stats
    }

    /// Close a window every period until cancelled, then close the last one.
    pub async fn run_window_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(
            window_ms = u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX),
            "[Summary] Window loop started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.close_window(Utc::now());
                }
            }
        }

        let last = self.close_window(Utc::now());
        info!(
            devices = last.len(),
            windows = self.windows_closed(),
            "[Summary] Final window closed"
        );
    }
}

impl RecordReducer for SummaryReducer {
    fn on_record(&self, record: &CycleRecord) {
        self.observe(record);
    }
}
