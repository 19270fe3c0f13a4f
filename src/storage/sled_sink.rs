//! Embedded time-series sink backed by sled
//!
//! One tree per device (the partition key). Keys are 16 bytes:
//!
//! ```text
//! [ time_nanos (8, big-endian, sign-flipped) | sequence (8, big-endian) ]
//! ```
//!
//! so a tree iterates in time order and reverse iteration yields newest
//! first. The sequence comes from `Db::generate_id` and keeps rows sharing a
//! `(time, device)` pair distinct.
//!
//! sled calls block, so batches are applied on the blocking pool; only the
//! durability flush is awaited on the runtime.

use super::{SinkError, TimeSeriesSink};
use crate::types::TimeSeriesRow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;

/// Trees are prefixed so device names never collide with sled's default tree.
const TREE_PREFIX: &str = "device/";

#[derive(Clone)]
pub struct SledSink {
    db: sled::Db,
}

impl SledSink {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let db = sled::open(path)?;
        tracing::info!(devices = db.tree_names().len().saturating_sub(1), "Opened sled sink");
        Ok(Self { db })
    }

    fn tree(&self, device: &str) -> Result<sled::Tree, SinkError> {
        Ok(self.db.open_tree(format!("{TREE_PREFIX}{device}"))?)
    }

    /// Most recent rows for a device, newest first.
    pub fn recent(&self, device: &str, limit: usize) -> Result<Vec<TimeSeriesRow>, SinkError> {
        let mut rows = Vec::with_capacity(limit.min(1024));
        for item in self.tree(device)?.iter().rev().take(limit) {
            let (_key, value) = item?;
            rows.push(serde_json::from_slice(&value)?);
        }
        Ok(rows)
    }

    /// Rows for a device within `[start, end]`, oldest first.
    pub fn range(
        &self,
        device: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimeSeriesRow>, SinkError> {
        let lo = row_key(start, 0);
        let hi = row_key(end, u64::MAX);
        let mut rows = Vec::new();
        for item in self.tree(device)?.range(lo..=hi) {
            let (_key, value) = item?;
            rows.push(serde_json::from_slice(&value)?);
        }
        Ok(rows)
    }

    /// Number of rows stored for a device.
    pub fn count(&self, device: &str) -> Result<usize, SinkError> {
        Ok(self.tree(device)?.len())
    }

    /// Apply pre-encoded rows, one sled batch per device. Blocking.
    fn apply_rows(&self, rows: Vec<EncodedRow>) -> Result<(), SinkError> {
        // Group per device, keeping production order inside each group.
        let mut batches: BTreeMap<String, sled::Batch> = BTreeMap::new();
        for row in rows {
            let key = row_key(row.time, self.db.generate_id()?);
            batches.entry(row.device).or_default().insert(&key[..], row.value);
        }
        for (device, batch) in batches {
            self.tree(&device)?.apply_batch(batch)?;
        }
        Ok(())
    }

    /// Devices with at least one tree.
    pub fn devices(&self) -> Vec<String> {
        self.db
            .tree_names()
            .into_iter()
            .filter_map(|name| {
                std::str::from_utf8(&name)
                    .ok()
                    .and_then(|n| n.strip_prefix(TREE_PREFIX))
                    .map(str::to_string)
            })
            .collect()
    }
}

struct EncodedRow {
    device: String,
    time: DateTime<Utc>,
    value: Vec<u8>,
}

fn time_nanos(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or_else(|| {
        if time.timestamp() < 0 {
            i64::MIN
        } else {
            i64::MAX
        }
    })
}

/// Order-preserving key: flipping the sign bit makes negative instants sort
/// before positive ones under byte comparison.
fn row_key(time: DateTime<Utc>, sequence: u64) -> [u8; 16] {
    let ordered = u64::from_be_bytes(time_nanos(time).to_be_bytes()) ^ (1 << 63);
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&ordered.to_be_bytes());
    key[8..].copy_from_slice(&sequence.to_be_bytes());
    key
}

#[async_trait]
impl TimeSeriesSink for SledSink {
    async fn write_batch(&self, rows: &[TimeSeriesRow]) -> Result<(), SinkError> {
        let encoded = rows
            .iter()
            .map(|row| {
                Ok(EncodedRow {
                    device: row.device.clone(),
                    time: row.time,
                    value: serde_json::to_vec(row)?,
                })
            })
            .collect::<Result<Vec<_>, SinkError>>()?;

        let sink = self.clone();
        tokio::task::spawn_blocking(move || sink.apply_rows(encoded))
            .await
            .map_err(|e| SinkError::Unavailable(format!("sled writer task failed: {e}")))??;
        self.db.flush_async().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "sled"
    }
}
