//! Recorded dataset loader
//!
//! Reads the metrology CSV export, one row per device per phase per cycle:
//!
//! ```text
//! time,stream_name,phase,rms_voltage,dc_offset_voltage,rms_current,dc_offset_current,
//! real_power,apparent_power,reactive_power,power_factor[,frequency][,sequence_number]
//! ```
//!
//! `time` is milliseconds since the Unix epoch. Consecutive rows sharing a
//! `time` form one frame; each frame yields one `CycleRecord` per
//! `stream_name`. The exports usually carry phase A only, so missing phases
//! can be filled with a copy of phase A.
//!
//! When the export has a `sequence_number` column, the recorded value is
//! kept on the record; otherwise records are numbered by frame.

use crate::types::{CycleRecord, PhaseLabel, PhaseReading};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Cannot open dataset {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV error in {origin}: {source}")]
    Csv { origin: String, source: csv::Error },

    #[error("Dataset {0} contains no usable records")]
    Empty(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DatasetOptions {
    /// Fill missing phases B/C with a relabelled copy of phase A.
    pub fill_missing_phases: bool,
    /// Frequency used when the export has no `frequency` column.
    pub nominal_frequency_hz: f64,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            fill_missing_phases: true,
            nominal_frequency_hz: crate::config::defaults::NOMINAL_FREQUENCY_HZ,
        }
    }
}

/// Counters gathered while loading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub rows: usize,
    pub malformed_rows: usize,
    pub unknown_phase_rows: usize,
    pub filled_phases: usize,
    pub incomplete_skipped: usize,
    pub invalid_skipped: usize,
}

#[derive(Debug, Deserialize)]
struct DatasetRow {
    time: i64,
    stream_name: String,
    phase: String,
    rms_voltage: f64,
    #[serde(default)]
    dc_offset_voltage: f64,
    rms_current: f64,
    #[serde(default)]
    dc_offset_current: f64,
    real_power: f64,
    #[serde(default)]
    apparent_power: f64,
    reactive_power: f64,
    power_factor: f64,
    #[serde(default)]
    frequency: Option<f64>,
    #[serde(default)]
    sequence_number: Option<u64>,
}

impl DatasetRow {
    fn reading(&self, phase: PhaseLabel, nominal_frequency_hz: f64) -> PhaseReading {
        PhaseReading {
            phase,
            voltage_rms: self.rms_voltage,
            current_rms: self.rms_current,
            real_power: self.real_power,
            reactive_power: self.reactive_power,
            power_factor: self.power_factor,
            frequency: self.frequency.unwrap_or(nominal_frequency_hz),
            apparent_power: self.apparent_power,
            voltage_dc_offset: self.dc_offset_voltage,
            current_dc_offset: self.dc_offset_current,
        }
    }
}

/// One device's rows within a frame.
#[derive(Debug, Default)]
struct DeviceRows {
    phases: [Option<PhaseReading>; 3],
    sequence: Option<u64>,
}

/// Rows of one frame, per device.
type FrameRows = BTreeMap<String, DeviceRows>;

/// An immutable, ordered sequence of frames. Each frame holds the records of
/// every device sampled at the same instant.
#[derive(Debug, Clone)]
pub struct Dataset {
    frames: Vec<Vec<CycleRecord>>,
    stats: LoadStats,
    recorded_sequences: bool,
}

impl Dataset {
    /// Load a CSV export from disk.
    pub fn load_csv(path: &Path, options: &DatasetOptions) -> Result<Self, DatasetError> {
        let file = std::fs::File::open(path).map_err(|source| DatasetError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let dataset = Self::from_reader(file, options, &path.display().to_string())?;
        info!(
            path = %path.display(),
            frames = dataset.frame_count(),
            records = dataset.record_count(),
            devices = dataset.devices().len(),
            "Dataset loaded"
        );
        Ok(dataset)
    }

    /// Load a CSV export from any reader. `origin` names it in errors.
    pub fn from_reader<R: Read>(
        reader: R,
        options: &DatasetOptions,
        origin: &str,
    ) -> Result<Self, DatasetError> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        rdr.headers().map_err(|source| DatasetError::Csv {
            origin: origin.to_string(),
            source,
        })?;

        let mut stats = LoadStats::default();
        let mut frames: Vec<Vec<CycleRecord>> = Vec::new();
        let mut current: FrameRows = BTreeMap::new();
        let mut current_time: Option<i64> = None;
        let mut recorded_sequences = false;

        for result in rdr.deserialize::<DatasetRow>() {
            stats.rows += 1;
            let row = match result {
                Ok(row) => row,
                Err(e) => {
                    stats.malformed_rows += 1;
                    debug!(origin = %origin, error = %e, "Skipping malformed dataset row");
                    continue;
                }
            };
            let Some(phase) = PhaseLabel::from_dataset_name(&row.phase) else {
                stats.unknown_phase_rows += 1;
                warn!(phase = %row.phase, "Unknown phase in dataset, row ignored");
                continue;
            };

            if let Some(t) = current_time.filter(|t| *t != row.time) {
                let rows = std::mem::take(&mut current);
                Self::close_frame(t, rows, &mut frames, options, &mut stats);
            }
            current_time = Some(row.time);

            let device = current.entry(row.stream_name.clone()).or_default();
            device.phases[phase_slot(phase)] =
                Some(row.reading(phase, options.nominal_frequency_hz));
            if let Some(seq) = row.sequence_number {
                recorded_sequences = true;
                // Phase A carries the cycle's number when phases disagree.
                if phase == PhaseLabel::A || device.sequence.is_none() {
                    device.sequence = Some(seq);
                }
            }
        }
        if let Some(t) = current_time {
            Self::close_frame(t, current, &mut frames, options, &mut stats);
        }

        if stats.malformed_rows > 0 || stats.incomplete_skipped > 0 || stats.invalid_skipped > 0 {
            warn!(
                origin = %origin,
                malformed = stats.malformed_rows,
                incomplete = stats.incomplete_skipped,
                invalid = stats.invalid_skipped,
                "Dataset rows skipped while loading"
            );
        }

        if frames.is_empty() {
            return Err(DatasetError::Empty(origin.to_string()));
        }
        Ok(Self {
            frames,
            stats,
            recorded_sequences,
        })
    }

    /// Build a dataset from already-decoded records. Consecutive records
    /// sharing a timestamp land in the same frame; invalid records are
    /// dropped.
    pub fn from_records(records: Vec<CycleRecord>) -> Result<Self, DatasetError> {
        let mut stats = LoadStats::default();
        let mut frames: Vec<Vec<CycleRecord>> = Vec::new();
        for record in records {
            stats.rows += 1;
            if record.validate().is_err() {
                stats.invalid_skipped += 1;
                continue;
            }
            match frames.last_mut() {
                Some(frame) if frame[0].timestamp == record.timestamp => frame.push(record),
                _ => frames.push(vec![record]),
            }
        }
        if frames.is_empty() {
            return Err(DatasetError::Empty("in-memory records".to_string()));
        }
        Ok(Self {
            frames,
            stats,
            recorded_sequences: false,
        })
    }

    fn close_frame(
        time_ms: i64,
        rows: FrameRows,
        frames: &mut Vec<Vec<CycleRecord>>,
        options: &DatasetOptions,
        stats: &mut LoadStats,
    ) {
        let Some(timestamp) = DateTime::<Utc>::from_timestamp_millis(time_ms) else {
            stats.invalid_skipped += rows.len();
            return;
        };
        let frame_sequence = frames.len() as u64;
        let mut frame = Vec::with_capacity(rows.len());

        for (device_id, DeviceRows { phases: [a, b, c], sequence }) in rows {
            let Some(a) = a else {
                stats.incomplete_skipped += 1;
                debug!(device = %device_id, time_ms, "Frame has no phase A, skipped");
                continue;
            };
            let mut fill = |slot: Option<PhaseReading>, label: PhaseLabel| match slot {
                Some(reading) => Some(reading),
                None if options.fill_missing_phases => {
                    stats.filled_phases += 1;
                    Some(a.relabel(label))
                }
                None => None,
            };
            let (Some(b), Some(c)) = (fill(b, PhaseLabel::B), fill(c, PhaseLabel::C)) else {
                stats.incomplete_skipped += 1;
                debug!(device = %device_id, time_ms, "Frame missing phases, skipped");
                continue;
            };

            let record = CycleRecord {
                timestamp,
                device_id,
                sequence: sequence.unwrap_or(frame_sequence),
                phases: [a, b, c],
            };
            if let Err(e) = record.validate() {
                stats.invalid_skipped += 1;
                debug!(device = %record.device_id, error = %e, "Invalid dataset record, skipped");
                continue;
            }
            frame.push(record);
        }

        if !frame.is_empty() {
            frames.push(frame);
        }
    }

    pub fn frames(&self) -> &[Vec<CycleRecord>] {
        &self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn record_count(&self) -> usize {
        self.frames.iter().map(Vec::len).sum()
    }

    /// Distinct devices, sorted.
    pub fn devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self
            .frames
            .iter()
            .flatten()
            .map(|r| r.device_id.clone())
            .collect();
        devices.sort();
        devices.dedup();
        devices
    }

    pub const fn stats(&self) -> &LoadStats {
        &self.stats
    }

    /// True when the export carried its own `sequence_number` column.
    pub const fn has_recorded_sequences(&self) -> bool {
        self.recorded_sequences
    }

    pub fn into_frames(self) -> Vec<Vec<CycleRecord>> {
        self.frames
    }
}

const fn phase_slot(phase: PhaseLabel) -> usize {
    match phase {
        PhaseLabel::A => 0,
        PhaseLabel::B => 1,
        PhaseLabel::C => 2,
    }
}
