//! TimescaleDB sink
//!
//! Schema:
//!
//! ```sql
//! CREATE TABLE <table> (
//!     time   TIMESTAMPTZ NOT NULL,
//!     device TEXT        NOT NULL,
//!     data   JSONB       NOT NULL
//! );
//! ```
//!
//! turned into a hypertable partitioned by `device` when the TimescaleDB
//! extension is present. A plain PostgreSQL table works too.

use super::{SinkError, TimeSeriesSink};
use crate::types::TimeSeriesRow;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{info, warn};

/// Rows per INSERT statement; 3 binds per row keeps well under the
/// 65 535 bind parameter limit.
const ROWS_PER_STATEMENT: usize = 5_000;

/// Space partitions for the `device` dimension.
const DEVICE_PARTITIONS: i32 = 4;

pub struct PostgresSink {
    pool: PgPool,
    table: String,
}

impl PostgresSink {
    /// Connect a pool. `table` must already be a validated identifier.
    pub async fn connect(database_url: &str, table: &str) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        info!(table = %table, "Connected to PostgreSQL");
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    /// Create the table and indexes if missing, then try to convert it into
    /// a hypertable. Conversion failure (no extension) is logged only.
    pub async fn ensure_schema(&self) -> Result<(), SinkError> {
        let t = &self.table;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                time TIMESTAMPTZ NOT NULL,
                device TEXT NOT NULL,
                data JSONB NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {t}_device_time_idx ON {t} (device, time DESC)"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {t}_time_idx ON {t} (time DESC)"
        ))
        .execute(&self.pool)
        .await?;

        let hypertable = sqlx::query(&format!(
            "SELECT create_hypertable('{t}', 'time', partitioning_column => 'device', \
             number_partitions => {DEVICE_PARTITIONS}, if_not_exists => TRUE)"
        ))
        .execute(&self.pool)
        .await;

        match hypertable {
            Ok(_) => info!(table = %t, "Hypertable ready (partitioned by device)"),
            Err(e) => warn!(
                table = %t,
                error = %e,
                "create_hypertable unavailable, using a plain table"
            ),
        }
        Ok(())
    }
}

#[async_trait]
impl TimeSeriesSink for PostgresSink {
    async fn write_batch(&self, rows: &[TimeSeriesRow]) -> Result<(), SinkError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} (time, device, data) ", self.table));
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.time)
                    .push_bind(row.device.as_str())
                    .push_bind(sqlx::types::Json(&row.data));
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "timescale"
    }
}
