//! Storage backend trait definition

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use super::schema::{PointRow, SeriesKey, SeriesPoint, SnapshotRow};

/// Query parameters for fetching one series within a time range
#[derive(Debug, Clone)]
pub struct QueryRange {
    pub key: SeriesKey,

    /// Start of time range (inclusive)
    pub start: DateTime<Utc>,

    /// End of time range (inclusive)
    pub end: DateTime<Utc>,
}

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Trait for persistent series storage
///
/// Points arrive already aligned to their rolling bucket, so writing a point
/// for an existing `(key, timestamp)` replaces the stored value. Implementations
/// must be `Send + Sync`; one backend is shared by the whole fleet.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Insert or replace a batch of bucket-aligned points
    ///
    /// Implementations should apply the batch atomically.
    async fn upsert_points(&self, points: Vec<PointRow>) -> StorageResult<()>;

    /// Points of one series between start and end, oldest first
    async fn query_range(&self, query: QueryRange) -> StorageResult<Vec<SeriesPoint>>;

    /// Delete points older than `before`, returning how many were removed
    async fn cleanup_old_points(&self, before: DateTime<Utc>) -> StorageResult<usize>;

    /// Store the last known snapshot of a device, replacing the previous one
    async fn save_snapshot(&self, snapshot: SnapshotRow) -> StorageResult<()>;

    async fn load_snapshot(&self, device: &str) -> StorageResult<Option<SnapshotRow>>;

    /// Lightweight liveness check (ping the database, check file access)
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Human-readable statistics, e.g. "SQLite: 12000 points, 3.1 MB on disk"
    async fn get_stats(&self) -> StorageResult<String>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
