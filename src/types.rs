//! Shared data structures for three-phase power metrology
//!
//! - `CycleRecord`: one per-AC-cycle reading for a device (3 phases)
//! - `SummaryStat`: reduced statistic for one device over one window
//! - `TimeSeriesRow`: append-only row written to the time-series sink

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Phases
// ============================================================================

/// Phase of a three-phase supply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum PhaseLabel {
    A,
    B,
    C,
}

impl PhaseLabel {
    /// Canonical slot order inside a `CycleRecord`.
    pub const ALL: [Self; 3] = [Self::A, Self::B, Self::C];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
            Self::C => "c",
        }
    }

    /// Column name used by the recorded datasets (`phase_a`, ...).
    pub fn from_dataset_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "phase_a" | "a" => Some(Self::A),
            "phase_b" | "b" => Some(Self::B),
            "phase_c" | "c" => Some(Self::C),
            _ => None,
        }
    }
}

impl std::fmt::Display for PhaseLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Waveform statistics for one phase over one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReading {
    pub phase: PhaseLabel,
    /// RMS voltage (V)
    pub voltage_rms: f64,
    /// RMS current (A)
    pub current_rms: f64,
    /// Real power (W)
    pub real_power: f64,
    /// Reactive power (var)
    pub reactive_power: f64,
    /// Power factor, dimensionless in [-1, 1]
    pub power_factor: f64,
    /// Line frequency (Hz)
    pub frequency: f64,
    /// Apparent power (VA)
    #[serde(default)]
    pub apparent_power: f64,
    #[serde(default)]
    pub voltage_dc_offset: f64,
    #[serde(default)]
    pub current_dc_offset: f64,
}

impl PhaseReading {
    /// Same reading relabelled for another phase slot.
    pub fn relabel(&self, phase: PhaseLabel) -> Self {
        Self {
            phase,
            ..self.clone()
        }
    }

    /// Every numeric field with its column name.
    pub fn scalars(&self) -> [(&'static str, f64); 9] {
        [
            ("voltage_rms", self.voltage_rms),
            ("current_rms", self.current_rms),
            ("real_power", self.real_power),
            ("reactive_power", self.reactive_power),
            ("power_factor", self.power_factor),
            ("frequency", self.frequency),
            ("apparent_power", self.apparent_power),
            ("voltage_dc_offset", self.voltage_dc_offset),
            ("current_dc_offset", self.current_dc_offset),
        ]
    }
}

// ============================================================================
// Cycle Record
// ============================================================================

/// Reasons a record is rejected before it reaches any reducer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("device_id is empty")]
    EmptyDevice,

    #[error("phase slot {slot} holds phase {found}, expected {expected}")]
    PhaseOrder {
        slot: usize,
        expected: PhaseLabel,
        found: PhaseLabel,
    },

    #[error("phase {phase} field {field} is not finite ({value})")]
    NonFinite {
        phase: PhaseLabel,
        field: &'static str,
        value: f64,
    },

    #[error("phase {phase} power_factor {value} outside [-1, 1]")]
    PowerFactorRange { phase: PhaseLabel, value: f64 },
}

/// One per-cycle measurement for one monitoring point.
///
/// Created by the publisher, consumed immutably by every reducer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// Wall-clock instant of the cycle (microsecond resolution on the wire)
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    /// Source frame counter
    #[serde(default)]
    pub sequence: u64,
    /// Readings ordered A, B, C
    pub phases: [PhaseReading; 3],
}

impl CycleRecord {
    pub fn phase(&self, label: PhaseLabel) -> &PhaseReading {
        match label {
            PhaseLabel::A => &self.phases[0],
            PhaseLabel::B => &self.phases[1],
            PhaseLabel::C => &self.phases[2],
        }
    }

    /// Three-phase real power (sum of the phases).
    pub fn total_real_power(&self) -> f64 {
        self.phases.iter().map(|p| p.real_power).sum()
    }

    /// Three-phase reactive power (sum of the phases).
    pub fn total_reactive_power(&self) -> f64 {
        self.phases.iter().map(|p| p.reactive_power).sum()
    }

    /// Copy of this record re-stamped for emission.
    pub fn restamped(&self, timestamp: DateTime<Utc>, sequence: u64) -> Self {
        Self {
            timestamp,
            sequence,
            ..self.clone()
        }
    }

    /// Check structural and numeric invariants.
    ///
    /// A record that fails here is never surfaced to a reducer.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.device_id.trim().is_empty() {
            return Err(RecordError::EmptyDevice);
        }
        for (slot, (reading, expected)) in self.phases.iter().zip(PhaseLabel::ALL).enumerate() {
            if reading.phase != expected {
                return Err(RecordError::PhaseOrder {
                    slot,
                    expected,
                    found: reading.phase,
                });
            }
            for (field, value) in reading.scalars() {
                if !value.is_finite() {
                    return Err(RecordError::NonFinite {
                        phase: reading.phase,
                        field,
                        value,
                    });
                }
            }
            if !(-1.0..=1.0).contains(&reading.power_factor) {
                return Err(RecordError::PowerFactorRange {
                    phase: reading.phase,
                    value: reading.power_factor,
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// Reducer Outputs
// ============================================================================

/// Reduced statistic for one device over one tumbling window.
///
/// Means are taken over every record observed in the window, each record
/// first averaged across its three phases. Superseded, never merged, by the
/// next window's stat for the same device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStat {
    pub window_end: DateTime<Utc>,
    pub device_id: String,
    /// Number of records folded into this window (always >= 1)
    pub samples: u64,
    pub mean_real_power: f64,
    pub mean_reactive_power: f64,
    pub mean_apparent_power: f64,
    pub mean_voltage: f64,
    pub mean_current: f64,
    pub mean_power_factor: f64,
    pub mean_frequency: f64,
    /// Mean of the per-record three-phase totals
    pub mean_total_real_power: f64,
    pub mean_total_reactive_power: f64,
    /// Highest per-record phase-mean real power in the window
    pub peak_real_power: f64,
    /// Lowest per-record phase-mean real power in the window
    pub trough_real_power: f64,
    pub peak_apparent_power: f64,
    pub trough_apparent_power: f64,
}

/// How a record is decomposed into time-series rows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RowLayout {
    /// One row per phase (3 rows per record)
    #[default]
    PerPhase,
    /// One row per record with all phases and three-phase totals
    Aggregate,
}

impl RowLayout {
    pub const fn rows_per_record(self) -> usize {
        match self {
            Self::PerPhase => 3,
            Self::Aggregate => 1,
        }
    }
}

impl std::str::FromStr for RowLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "per_phase" | "phase" => Ok(Self::PerPhase),
            "aggregate" | "record" => Ok(Self::Aggregate),
            other => Err(format!("unknown row layout '{other}' (expected per_phase or aggregate)")),
        }
    }
}

/// Append-only time-series row, partitioned by `device`.
///
/// `(time, device)` is not unique: a per-phase layout writes three rows
/// sharing both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesRow {
    pub time: DateTime<Utc>,
    pub device: String,
    pub data: serde_json::Value,
}

// ============================================================================
// Tests
// ============================================================================


#[cfg(test)]
mod tests {
    use super::fixtures::record;
    use super::*;

    #[test]
    fn test_totals_sum_phases() {
        let r = record("D1", 0, [100.0, 110.0, 105.0]);
        assert!((r.total_real_power() - 315.0).abs() < 1e-9);
        assert!((r.total_reactive_power() - 31.5).abs() < 1e-9);
        assert_eq!(r.phase(PhaseLabel::B).real_power, 110.0);
    }

    #[test]
    fn test_validate_accepts_well_formed_record() {
        assert_eq!(record("D1", 0, [1.0, 2.0, 3.0]).validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_swapped_phases() {
        let mut r = record("D1", 0, [1.0, 2.0, 3.0]);
        r.phases.swap(0, 1);
        assert!(matches!(r.validate(), Err(RecordError::PhaseOrder { slot: 0, .. })));
    }

    #[test]
    fn test_validate_rejects_non_finite_and_power_factor() {
        let mut r = record("D1", 0, [1.0, 2.0, 3.0]);
        r.phases[2].frequency = f64::NAN;
        assert!(matches!(
            r.validate(),
            Err(RecordError::NonFinite { field: "frequency", .. })
        ));

        let mut r = record("D1", 0, [1.0, 2.0, 3.0]);
        r.phases[1].power_factor = 1.2;
        assert!(matches!(r.validate(), Err(RecordError::PowerFactorRange { .. })));

        let r = record(" ", 0, [1.0, 2.0, 3.0]);
        assert_eq!(r.validate(), Err(RecordError::EmptyDevice));
    }

    #[test]
    fn test_record_json_uses_microsecond_timestamps() {
        let r = record("D1", 3, [1.0, 2.0, 3.0]);
        let json = serde_json::to_value(&r).unwrap();
        assert!(json["timestamp"].is_i64());
        assert_eq!(json["phases"][1]["phase"], "b");

        let back: CycleRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let json = r#"{
            "timestamp": 1700000000000000,
            "device_id": "D9",
            "phases": [
                {"phase":"a","voltage_rms":1,"current_rms":1,"real_power":1,
                 "reactive_power":0,"power_factor":1,"frequency":60},
                {"phase":"b","voltage_rms":1,"current_rms":1,"real_power":1,
                 "reactive_power":0,"power_factor":1,"frequency":60},
                {"phase":"c","voltage_rms":1,"current_rms":1,"real_power":1,
                 "reactive_power":0,"power_factor":1,"frequency":60}
            ]
        }"#;
        let r: CycleRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.sequence, 0);
        assert_eq!(r.phases[0].apparent_power, 0.0);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_row_layout_parsing() {
        assert_eq!("per-phase".parse::<RowLayout>(), Ok(RowLayout::PerPhase));
        assert_eq!("Aggregate".parse::<RowLayout>(), Ok(RowLayout::Aggregate));
        assert!("hourly".parse::<RowLayout>().is_err());
        assert_eq!(RowLayout::PerPhase.rows_per_record(), 3);
    }
}
