// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! TimescaleDB telemetry writer.
//!
//! Ensures the `device_telemetry` hypertable and its supporting indexes
//! exist, then batch-inserts rows through a pooled connection. Running
//! against plain PostgreSQL (no timescaledb extension) degrades gracefully:
//! the hypertable call is skipped and the table behaves as a regular table.

use crate::polling::worker::{TelemetryRow, TelemetrySink};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS device_telemetry (
    time TIMESTAMPTZ NOT NULL,
    device_id UUID NOT NULL,
    serial_number TEXT NOT NULL,
    protocol_id TEXT NOT NULL,
    device_type TEXT NOT NULL,
    data JSONB NOT NULL,
    poll_duration_ms DOUBLE PRECISION
)
"#;

const CREATE_HYPERTABLE: &str = r#"
SELECT create_hypertable('device_telemetry', 'time', if_not_exists => TRUE)
"#;

const CREATE_DEVICE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_telemetry_device_time
ON device_telemetry (device_id, time DESC)
"#;

const CREATE_SERIAL_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_telemetry_serial_time
ON device_telemetry (serial_number, time DESC)
"#;

/// One stored telemetry record, as returned by the query helpers.
#[derive(Debug, Clone)]
pub struct StoredTelemetry {
    pub time: DateTime<Utc>,
    pub data: serde_json::Value,
    pub poll_duration_ms: Option<f64>,
}

/// Batched telemetry writer over a PostgreSQL/TimescaleDB pool.
pub struct TimescaleWriter {
    pool: PgPool,
}

impl TimescaleWriter {
    /// Connect and ensure the schema. An unreachable store at startup is the
    /// caller's warning, not a panic.
    pub async fn connect(dsn: &str) -> Result<Self, TimescaleError> {
        let pool = PgPoolOptions::new()
            .min_connections(2)
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(dsn)
            .await
            .map_err(|e| TimescaleError::Connect(e.to_string()))?;

        let writer = Self { pool };
        writer.ensure_schema().await?;
        info!("Connected to telemetry store");
        Ok(writer)
    }

    async fn ensure_schema(&self) -> Result<(), TimescaleError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| TimescaleError::Schema(e.to_string()))?;

        // Hypertable conversion needs the timescaledb extension; skipping it
        // leaves a plain table, which is acceptable.
        if let Err(e) = sqlx::query(CREATE_HYPERTABLE).execute(&self.pool).await {
            debug!("Hypertable creation skipped: {}", e);
        }

        sqlx::query(CREATE_DEVICE_INDEX)
            .execute(&self.pool)
            .await
            .map_err(|e| TimescaleError::Schema(e.to_string()))?;
        sqlx::query(CREATE_SERIAL_INDEX)
            .execute(&self.pool)
            .await
            .map_err(|e| TimescaleError::Schema(e.to_string()))?;

        debug!("Telemetry tables and indexes ensured");
        Ok(())
    }

    /// Insert one batch with a multi-row statement. Order within the batch is
    /// preserved.
    pub async fn insert_batch(&self, batch: &[TelemetryRow]) -> Result<(), TimescaleError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
            "INSERT INTO device_telemetry \
             (time, device_id, serial_number, protocol_id, device_type, data, poll_duration_ms) ",
        );
        builder.push_values(batch, |mut row, record| {
            row.push_bind(record.time)
                .push_bind(record.device_id)
                .push_bind(&record.serial_number)
                .push_bind(&record.protocol_id)
                .push_bind(&record.device_type)
                .push_bind(serde_json::Value::Object(record.data.clone()))
                .push_bind(record.poll_duration_ms);
        });

        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| TimescaleError::Write(e.to_string()))?;

        debug!("Inserted {} telemetry rows", batch.len());
        Ok(())
    }

    /// Latest rows for one device, newest first.
    pub async fn query_latest(
        &self,
        device_id: Uuid,
        limit: i64,
    ) -> Result<Vec<StoredTelemetry>, TimescaleError> {
        let rows = sqlx::query(
            "SELECT time, data, poll_duration_ms FROM device_telemetry \
             WHERE device_id = $1 ORDER BY time DESC LIMIT $2",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TimescaleError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(Self::row_to_record).collect())
    }

    /// Rows for one device within a time range, oldest first.
    pub async fn query_range(
        &self,
        device_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StoredTelemetry>, TimescaleError> {
        let rows = sqlx::query(
            "SELECT time, data, poll_duration_ms FROM device_telemetry \
             WHERE device_id = $1 AND time >= $2 AND time <= $3 \
             ORDER BY time ASC LIMIT $4",
        )
        .bind(device_id)
        .bind(start)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TimescaleError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(Self::row_to_record).collect())
    }

    fn row_to_record(row: sqlx::postgres::PgRow) -> StoredTelemetry {
        StoredTelemetry {
            time: row.get("time"),
            data: row.get("data"),
            poll_duration_ms: row.get("poll_duration_ms"),
        }
    }

    /// Periodic maintenance: re-assert the schema so chunked storage keeps
    /// working after a database rebuild. No-op on a healthy store.
    pub fn spawn_maintenance(self: &std::sync::Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let writer = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = writer.ensure_schema().await {
                    warn!("Telemetry store maintenance failed: {}", e);
                }
            }
        })
    }

    /// Close the pool, letting in-flight statements finish.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Disconnected from telemetry store");
    }
}

impl TelemetrySink for TimescaleWriter {
    async fn write_batch(&self, batch: Vec<TelemetryRow>) -> Result<(), String> {
        self.insert_batch(&batch).await.map_err(|e| {
            error!("Telemetry batch write failed: {}", e);
            e.to_string()
        })
    }
}

/// Time-series store error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TimescaleError {
    #[error("connect error: {0}")]
    Connect(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("write error: {0}")]
    Write(String),
    #[error("query error: {0}")]
    Query(String),
}
