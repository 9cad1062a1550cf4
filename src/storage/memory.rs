//! In-memory storage backend (no persistence)
//!
//! Used when storage is configured as `none` and in tests. Everything is
//! lost on restart.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{HealthStatus, QueryRange, StorageBackend};
use super::error::StorageResult;
use super::schema::{PointRow, SeriesKey, SeriesPoint, SnapshotRow};

#[derive(Default)]
pub struct MemoryBackend {
    points: RwLock<HashMap<SeriesKey, BTreeMap<DateTime<Utc>, i64>>>,
    snapshots: RwLock<HashMap<String, SnapshotRow>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn upsert_points(&self, points: Vec<PointRow>) -> StorageResult<()> {
        let mut series = self.points.write().await;
        for PointRow { key, point } in points {
            series
                .entry(key)
                .or_default()
                .insert(point.timestamp, point.value);
        }
        Ok(())
    }

    async fn query_range(&self, query: QueryRange) -> StorageResult<Vec<SeriesPoint>> {
        if query.start > query.end {
            return Ok(Vec::new());
        }

        let series = self.points.read().await;
        let points = series
            .get(&query.key)
            .map(|points| {
                points
                    .range(query.start..=query.end)
                    .map(|(timestamp, value)| SeriesPoint {
                        timestamp: *timestamp,
                        value: *value,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(points)
    }

    async fn cleanup_old_points(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut series = self.points.write().await;
        let mut deleted = 0;

        for points in series.values_mut() {
            let kept = points.split_off(&before);
            deleted += points.len();
            *points = kept;
        }
        series.retain(|_, points| !points.is_empty());

        debug!("in-memory backend: removed {deleted} points before {before}");
        Ok(deleted)
    }

    async fn save_snapshot(&self, snapshot: SnapshotRow) -> StorageResult<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.device.clone(), snapshot);
        Ok(())
    }

    async fn load_snapshot(&self, device: &str) -> StorageResult<Option<SnapshotRow>> {
        Ok(self.snapshots.read().await.get(device).cloned())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([("backend".to_string(), "memory".to_string())]),
        })
    }

    async fn get_stats(&self) -> StorageResult<String> {
        let series = self.points.read().await;
        let total: usize = series.values().map(BTreeMap::len).sum();
        Ok(format!(
            "In-Memory: {total} points across {} series",
            series.len()
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}
