//! SQLite storage backend
//!
//! - **Embedded**: no separate database server required
//! - **WAL mode**: range queries run while the flush task writes
//! - **Migrations**: schema versioning with sqlx
//!
//! Points are keyed by `(device, kind, idx, timestamp)`; re-writing a bucket
//! is an upsert. Snapshots are one row per device.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, QueryRange, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{PointRow, SeriesPoint, SnapshotRow};

pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database at `db_path` and run migrations
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {db_path}");

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("database migrations complete");

        Ok(Self { pool, db_path })
    }

    fn millis_to_timestamp(millis: i64) -> StorageResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| StorageError::Corrupted(format!("timestamp out of range: {millis}")))
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self, points), fields(count = points.len()))]
    async fn upsert_points(&self, points: Vec<PointRow>) -> StorageResult<()> {
        if points.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for PointRow { key, point } in points {
            sqlx::query(
                r#"
                INSERT INTO series_points (device, kind, idx, timestamp, value)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (device, kind, idx, timestamp) DO UPDATE SET
                    value = excluded.value
                "#,
            )
            .bind(&key.device)
            .bind(key.kind.as_str())
            .bind(&key.index)
            .bind(point.timestamp.timestamp_millis())
            .bind(point.value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(series = %query.key))]
    async fn query_range(&self, query: QueryRange) -> StorageResult<Vec<SeriesPoint>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, value
            FROM series_points
            WHERE device = ? AND kind = ? AND idx = ? AND timestamp >= ? AND timestamp <= ?
            ORDER BY timestamp ASC
            "#,
        )
        .bind(&query.key.device)
        .bind(query.key.kind.as_str())
        .bind(&query.key.index)
        .bind(query.start.timestamp_millis())
        .bind(query.end.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StorageResult<SeriesPoint> {
                Ok(SeriesPoint {
                    timestamp: Self::millis_to_timestamp(row.try_get("timestamp")?)?,
                    value: row.try_get("value")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn cleanup_old_points(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let result = sqlx::query("DELETE FROM series_points WHERE timestamp < ?")
            .bind(before.timestamp_millis())
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() as usize;
        info!("deleted {deleted} points older than {before}");

        Ok(deleted)
    }

    #[instrument(skip(self, snapshot), fields(device = %snapshot.device))]
    async fn save_snapshot(&self, snapshot: SnapshotRow) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO node_snapshots (device, taken_at, data)
            VALUES (?, ?, ?)
            ON CONFLICT (device) DO UPDATE SET
                taken_at = excluded.taken_at,
                data = excluded.data
            "#,
        )
        .bind(&snapshot.device)
        .bind(snapshot.taken_at.timestamp_millis())
        .bind(&snapshot.data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_snapshot(&self, device: &str) -> StorageResult<Option<SnapshotRow>> {
        let row = sqlx::query("SELECT device, taken_at, data FROM node_snapshots WHERE device = ?")
            .bind(device)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> StorageResult<SnapshotRow> {
            Ok(SnapshotRow {
                device: row.try_get("device")?,
                taken_at: Self::millis_to_timestamp(row.try_get("taken_at")?)?,
                data: row.try_get("data")?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(HealthStatus {
                healthy: true,
                message: "SQLite backend operational".to_string(),
                metadata: HashMap::from([
                    ("backend".to_string(), "sqlite".to_string()),
                    ("db_path".to_string(), self.db_path.clone()),
                ]),
            }),
            Err(e) => {
                warn!("health check failed: {e}");
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {e}"),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_stats(&self) -> StorageResult<String> {
        let (points, series): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(DISTINCT device || '/' || kind || '/' || idx) FROM series_points",
        )
        .fetch_one(&self.pool)
        .await?;

        let file_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(format!(
            "SQLite: {points} points across {series} series, {:.2} MB on disk",
            file_size as f64 / 1_000_000.0
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
