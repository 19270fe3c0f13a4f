//! Shared fixtures for integration tests.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use phasecast::acquisition::{RecordEvent, RecordSource};
use phasecast::{CycleRecord, PhaseLabel, PhaseReading};
use std::collections::VecDeque;
use std::time::Duration;

pub fn reading(phase: PhaseLabel, real_power: f64) -> PhaseReading {
    PhaseReading {
        phase,
        voltage_rms: 120.0,
        current_rms: real_power / 120.0,
        real_power,
        reactive_power: real_power * 0.1,
        power_factor: 0.95,
        frequency: 60.0,
        apparent_power: real_power / 0.95,
        voltage_dc_offset: 0.0,
        current_dc_offset: 0.0,
    }
}

pub fn record_with(
    device: &str,
    sequence: u64,
    at: DateTime<Utc>,
    powers: [f64; 3],
) -> CycleRecord {
    CycleRecord {
        timestamp: at,
        device_id: device.to_string(),
        sequence,
        phases: [
            reading(PhaseLabel::A, powers[0]),
            reading(PhaseLabel::B, powers[1]),
            reading(PhaseLabel::C, powers[2]),
        ],
    }
}

pub fn record(device: &str, sequence: u64, at: DateTime<Utc>) -> CycleRecord {
    record_with(device, sequence, at, [100.0, 110.0, 105.0])
}

/// `n` consecutive records for one device, one cycle (~17 ms) apart.
pub fn records(device: &str, n: u64) -> Vec<CycleRecord> {
    let start = Utc::now();
    (0..n)
        .map(|i| record(device, i, start + TimeDelta::milliseconds(17 * i as i64)))
        .collect()
}

/// Finite source yielding a fixed list of records, optionally spaced out.
pub struct VecSource {
    queue: VecDeque<CycleRecord>,
    spacing: Duration,
}

impl VecSource {
    pub fn new(records: Vec<CycleRecord>) -> Self {
        Self {
            queue: records.into(),
            spacing: Duration::ZERO,
        }
    }

    pub fn spaced(records: Vec<CycleRecord>, spacing: Duration) -> Self {
        Self {
            queue: records.into(),
            spacing,
        }
    }
}

#[async_trait]
impl RecordSource for VecSource {
    async fn next_record(&mut self) -> Result<RecordEvent> {
        if !self.spacing.is_zero() {
            tokio::time::sleep(self.spacing).await;
        }
        Ok(match self.queue.pop_front() {
            Some(record) => RecordEvent::Record(record),
            None => RecordEvent::Eof,
        })
    }

    fn source_name(&self) -> &str {
        "vec"
    }
}
