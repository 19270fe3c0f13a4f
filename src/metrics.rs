//! Prometheus metrics for one process.
//!
//! Each process owns its registry (`phasecast_` prefix, `role` const label).
//! Runtime counters already live in atomics next to the code that bumps
//! them; they are registered here as probes and sampled on every scrape.
//! Summary statistics are pushed into per-device gauges at window close.

use crate::types::SummaryStat;
use prometheus::{Encoder, GaugeVec, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Metrics text is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

type Probe = Box<dyn Fn() -> u64 + Send + Sync>;

enum Sampled {
    Counter(IntCounter, Probe),
    Gauge(IntGauge, Probe),
}

pub struct PipelineMetrics {
    registry: Registry,
    sampled: Mutex<Vec<Sampled>>,
}

impl PipelineMetrics {
    pub fn new(role: &str) -> Result<Self, MetricsError> {
        let labels = HashMap::from([("role".to_string(), role.to_string())]);
        let registry = Registry::new_custom(Some("phasecast".to_string()), Some(labels))?;
        Ok(Self {
            registry,
            sampled: Mutex::new(Vec::new()),
        })
    }

    /// Register a monotonically increasing counter read from `probe`.
    pub fn counter_fn<F>(&self, name: &str, help: &str, probe: F) -> Result<(), MetricsError>
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        let counter = IntCounter::new(name, help)?;
        self.registry.register(Box::new(counter.clone()))?;
        self.lock_sampled()
            .push(Sampled::Counter(counter, Box::new(probe)));
        Ok(())
    }

    /// Register a gauge read from `probe`.
    pub fn gauge_fn<F>(&self, name: &str, help: &str, probe: F) -> Result<(), MetricsError>
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        let gauge = IntGauge::new(name, help)?;
        self.registry.register(Box::new(gauge.clone()))?;
        self.lock_sampled().push(Sampled::Gauge(gauge, Box::new(probe)));
        Ok(())
    }

    /// Register the per-device summary gauges.
    pub fn summary_gauges(&self) -> Result<SummaryGauges, MetricsError> {
        let gauges = SummaryGauges {
            samples: device_gauge("summary_samples", "Records in the last closed window")?,
            mean_real_power: device_gauge(
                "summary_mean_real_power_watts",
                "Mean real power per phase",
            )?,
            mean_reactive_power: device_gauge(
                "summary_mean_reactive_power_var",
                "Mean reactive power per phase",
            )?,
            mean_apparent_power: device_gauge(
                "summary_mean_apparent_power_va",
                "Mean apparent power per phase",
            )?,
            mean_voltage: device_gauge("summary_mean_voltage_rms_volts", "Mean RMS voltage")?,
            mean_current: device_gauge("summary_mean_current_rms_amperes", "Mean RMS current")?,
            mean_power_factor: device_gauge("summary_mean_power_factor", "Mean power factor")?,
            mean_frequency: device_gauge("summary_mean_frequency_hertz", "Mean line frequency")?,
            mean_total_real_power: device_gauge(
                "summary_mean_three_phase_real_power_watts",
                "Mean three-phase real power",
            )?,
            mean_total_reactive_power: device_gauge(
                "summary_mean_three_phase_reactive_power_var",
                "Mean three-phase reactive power",
            )?,
            peak_real_power: device_gauge(
                "summary_peak_real_power_watts",
                "Highest per-record mean real power in the window",
            )?,
            trough_real_power: device_gauge(
                "summary_trough_real_power_watts",
                "Lowest per-record mean real power in the window",
            )?,
            peak_apparent_power: device_gauge(
                "summary_peak_apparent_power_va",
                "Highest per-record mean apparent power in the window",
            )?,
            trough_apparent_power: device_gauge(
                "summary_trough_apparent_power_va",
                "Lowest per-record mean apparent power in the window",
            )?,
        };
        for gauge in gauges.all() {
            self.registry.register(Box::new(gauge.clone()))?;
        }
        Ok(gauges)
    }

    fn lock_sampled(&self) -> std::sync::MutexGuard<'_, Vec<Sampled>> {
        self.sampled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh(&self) {
        for sampled in self.lock_sampled().iter() {
            match sampled {
                Sampled::Counter(counter, probe) => {
                    let value = probe();
                    let current = counter.get();
                    if value > current {
                        counter.inc_by(value - current);
                    }
                }
                Sampled::Gauge(gauge, probe) => {
                    gauge.set(i64::try_from(probe()).unwrap_or(i64::MAX));
                }
            }
        }
    }

    /// Prometheus text exposition (format 0.0.4).
    pub fn render(&self) -> Result<String, MetricsError> {
        self.refresh();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::with_capacity(4096);
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn device_gauge(name: &str, help: &str) -> Result<GaugeVec, MetricsError> {
    Ok(GaugeVec::new(Opts::new(name, help), &["device"])?)
}

/// Latest summary per device, labelled by `device`.
#[derive(Clone)]
pub struct SummaryGauges {
    samples: GaugeVec,
    mean_real_power: GaugeVec,
    mean_reactive_power: GaugeVec,
    mean_apparent_power: GaugeVec,
    mean_voltage: GaugeVec,
    mean_current: GaugeVec,
    mean_power_factor: GaugeVec,
    mean_frequency: GaugeVec,
    mean_total_real_power: GaugeVec,
    mean_total_reactive_power: GaugeVec,
    peak_real_power: GaugeVec,
    trough_real_power: GaugeVec,
    peak_apparent_power: GaugeVec,
    trough_apparent_power: GaugeVec,
}

impl SummaryGauges {
    fn all(&self) -> [&GaugeVec; 14] {
        [
            &self.samples,
            &self.mean_real_power,
            &self.mean_reactive_power,
            &self.mean_apparent_power,
            &self.mean_voltage,
            &self.mean_current,
            &self.mean_power_factor,
            &self.mean_frequency,
            &self.mean_total_real_power,
            &self.mean_total_reactive_power,
            &self.peak_real_power,
            &self.trough_real_power,
            &self.peak_apparent_power,
            &self.trough_apparent_power,
        ]
    }

    pub fn observe(&self, stats: &[SummaryStat]) {
        for stat in stats {
            let device = [stat.device_id.as_str()];
            let values = [
                (&self.samples, stat.samples as f64),
                (&self.mean_real_power, stat.mean_real_power),
                (&self.mean_reactive_power, stat.mean_reactive_power),
                (&self.mean_apparent_power, stat.mean_apparent_power),
                (&self.mean_voltage, stat.mean_voltage),
                (&self.mean_current, stat.mean_current),
                (&self.mean_power_factor, stat.mean_power_factor),
                (&self.mean_frequency, stat.mean_frequency),
                (&self.mean_total_real_power, stat.mean_total_real_power),
                (&self.mean_total_reactive_power, stat.mean_total_reactive_power),
                (&self.peak_real_power, stat.peak_real_power),
                (&self.trough_real_power, stat.trough_real_power),
                (&self.peak_apparent_power, stat.peak_apparent_power),
                (&self.trough_apparent_power, stat.trough_apparent_power),
            ];
            for (gauge, value) in values {
                gauge.with_label_values(&device).set(value);
            }
        }
    }
}
