//! Rolling series store
//!
//! Every `(device, kind, index)` series keeps its recent buckets in memory and
//! queues each write for the backend. Writes falling into the same rolling
//! interval replace each other (last write wins), both in memory and in the
//! backend, where the bucket start is the primary key.
//!
//! A failed flush puts the store into degraded mode: series keep rolling in
//! memory but nothing is queued until the backend reports healthy again.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, instrument, warn};

use super::backend::{QueryRange, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{PointRow, SeriesData, SeriesKey, SeriesPoint, SnapshotRow, SummaryPoint};

/// Buckets kept in memory per series
const MEMORY_BUCKETS: usize = 1440;

/// Buckets inspected by the load statistic
const LOAD_WINDOW: i64 = 60;

/// Upper bound on points returned by a summarized query
const SUMMARY_POINTS: i64 = 120;

/// Recent buckets of one series
#[derive(Debug, Clone)]
pub struct RollingSeries {
    interval_ms: i64,
    buckets: BTreeMap<i64, i64>,
}

impl RollingSeries {
    pub fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms: interval_ms.max(1),
            buckets: BTreeMap::new(),
        }
    }

    fn bucket_of(&self, millis: i64) -> i64 {
        millis - millis.rem_euclid(self.interval_ms)
    }

    /// Record a value and return the bucket-aligned point that now represents it
    pub fn roll(&mut self, value: i64, timestamp: DateTime<Utc>) -> SeriesPoint {
        let bucket = self.bucket_of(timestamp.timestamp_millis());
        self.buckets.insert(bucket, value);

        while self.buckets.len() > MEMORY_BUCKETS {
            self.buckets.pop_first();
        }

        SeriesPoint {
            timestamp: DateTime::from_timestamp_millis(bucket).unwrap_or(timestamp),
            value,
        }
    }

    /// Buckets whose start lies in `[start, end]`
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<SeriesPoint> {
        let (start, end) = (start.timestamp_millis(), end.timestamp_millis());
        if start > end {
            return Vec::new();
        }

        self.buckets
            .range(start..=end)
            .filter_map(|(bucket, value)| {
                Some(SeriesPoint {
                    timestamp: DateTime::from_timestamp_millis(*bucket)?,
                    value: *value,
                })
            })
            .collect()
    }

    /// Percentage of the last `LOAD_WINDOW` buckets (ending at `now`) that
    /// received at least one write
    pub fn load(&self, now: DateTime<Utc>) -> f64 {
        let last = self.bucket_of(now.timestamp_millis());
        let first = last - (LOAD_WINDOW - 1) * self.interval_ms;
        let filled = self.buckets.range(first..=last).count();

        filled as f64 * 100.0 / LOAD_WINDOW as f64
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Reduce bucketed points to min/max/avg per `window_ms`
pub fn summarize(points: &[SeriesPoint], window_ms: i64) -> Vec<SummaryPoint> {
    let window_ms = window_ms.max(1);
    let mut windows: BTreeMap<i64, Vec<i64>> = BTreeMap::new();

    for point in points {
        let millis = point.timestamp.timestamp_millis();
        windows
            .entry(millis - millis.rem_euclid(window_ms))
            .or_default()
            .push(point.value);
    }

    windows
        .into_iter()
        .filter_map(|(start, values)| {
            let min = *values.iter().min()?;
            let max = *values.iter().max()?;
            let sum: i128 = values.iter().map(|v| i128::from(*v)).sum();

            Some(SummaryPoint {
                timestamp: DateTime::from_timestamp_millis(start)?,
                min,
                max,
                avg: sum as f64 / values.len() as f64,
                count: values.len(),
            })
        })
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// All series of the fleet plus the write queue to the backend
pub struct SeriesStore {
    interval_ms: i64,
    series: Mutex<HashMap<SeriesKey, RollingSeries>>,
    pending: Mutex<Vec<PointRow>>,
    backend: Arc<dyn StorageBackend>,
    degraded: AtomicBool,
}

impl SeriesStore {
    pub fn new(interval_ms: u64, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            interval_ms: i64::try_from(interval_ms).unwrap_or(i64::MAX).max(1),
            series: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            backend,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Record one sample
    pub fn roll(&self, key: SeriesKey, value: i64, timestamp: DateTime<Utc>) {
        let point = lock(&self.series)
            .entry(key.clone())
            .or_insert_with(|| RollingSeries::new(self.interval_ms))
            .roll(value, timestamp);

        if !self.is_degraded() {
            lock(&self.pending).push(PointRow { key, point });
        }
    }

    /// Write queued points to the backend
    ///
    /// On failure the batch is dropped and the store turns degraded. A
    /// degraded store probes the backend's health on every flush and resumes
    /// persisting once it is healthy; until then flushing fails with
    /// [`StorageError::UnhealthyBackend`].
    #[instrument(skip(self))]
    pub async fn flush(&self) -> StorageResult<usize> {
        if self.is_degraded() {
            match self.backend.health_check().await {
                Ok(health) if health.healthy => {
                    info!("storage backend healthy again, resuming persistence");
                    self.degraded.store(false, Ordering::Relaxed);
                }
                Ok(health) => return Err(StorageError::UnhealthyBackend(health.message)),
                Err(e) => return Err(StorageError::UnhealthyBackend(e.to_string())),
            }
        }

        let batch = std::mem::take(&mut *lock(&self.pending));
        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        match self.backend.upsert_points(batch).await {
            Ok(()) => {
                debug!("flushed {count} points");
                Ok(count)
            }
            Err(e) => {
                error!("failed to persist {count} points, continuing without persistence: {e}");
                self.degraded.store(true, Ordering::Relaxed);
                lock(&self.pending).clear();
                Err(e)
            }
        }
    }

    /// Points of one series in `[start, end]`
    ///
    /// Persisted points are overlaid with the in-memory buckets, which are
    /// at least as recent. A backend error falls back to memory only.
    #[instrument(skip(self), fields(series = %key))]
    pub async fn get_data(
        &self,
        key: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        summarize_points: bool,
    ) -> SeriesData {
        let mut merged: BTreeMap<DateTime<Utc>, i64> = BTreeMap::new();

        if !self.is_degraded() {
            let query = QueryRange {
                key: key.clone(),
                start,
                end,
            };
            match self.backend.query_range(query).await {
                Ok(points) => merged.extend(points.into_iter().map(|p| (p.timestamp, p.value))),
                Err(e) => warn!("series query failed, answering from memory: {e}"),
            }
        }

        if let Some(series) = lock(&self.series).get(key) {
            merged.extend(
                series
                    .range(start, end)
                    .into_iter()
                    .map(|p| (p.timestamp, p.value)),
            );
        }

        let points: Vec<SeriesPoint> = merged
            .into_iter()
            .map(|(timestamp, value)| SeriesPoint { timestamp, value })
            .collect();

        if !summarize_points {
            return SeriesData::Raw(points);
        }

        let span = (end - start).num_milliseconds().max(0);
        let window = (span / SUMMARY_POINTS).max(self.interval_ms);
        SeriesData::Summary(summarize(&points, window))
    }

    /// Average load over every series of `device`
    pub fn device_load(&self, device: &str) -> Option<f64> {
        let now = Utc::now();
        let series = lock(&self.series);
        let loads: Vec<f64> = series
            .iter()
            .filter(|(key, _)| key.device == device)
            .map(|(_, series)| series.load(now))
            .collect();

        (!loads.is_empty()).then(|| loads.iter().sum::<f64>() / loads.len() as f64)
    }

    /// Average of the per-device loads
    pub fn fleet_load(&self) -> f64 {
        let now = Utc::now();
        let series = lock(&self.series);

        let mut per_device: HashMap<&str, (f64, usize)> = HashMap::new();
        for (key, series) in series.iter() {
            let entry = per_device.entry(key.device.as_str()).or_default();
            entry.0 += series.load(now);
            entry.1 += 1;
        }

        if per_device.is_empty() {
            return 0.0;
        }

        let total: f64 = per_device
            .values()
            .map(|(sum, count)| sum / *count as f64)
            .sum();
        total / per_device.len() as f64
    }

    /// Number of live series
    pub fn resource_count(&self) -> usize {
        lock(&self.series).len()
    }

    /// Drop in-memory series and queued writes of a device
    ///
    /// Persisted history stays until retention removes it.
    pub fn purge_device(&self, device: &str) {
        lock(&self.series).retain(|key, _| key.device != device);
        lock(&self.pending).retain(|row| row.key.device != device);
    }

    /// Delete persisted points older than `retention_days`
    pub async fn cleanup(&self, retention_days: u32) -> StorageResult<usize> {
        let before = Utc::now() - Duration::days(i64::from(retention_days));
        self.backend.cleanup_old_points(before).await
    }

    pub async fn save_snapshot(&self, snapshot: SnapshotRow) -> StorageResult<()> {
        self.backend.save_snapshot(snapshot).await
    }

    pub async fn load_snapshot(&self, device: &str) -> StorageResult<Option<SnapshotRow>> {
        self.backend.load_snapshot(device).await
    }

    pub async fn stats(&self) -> StorageResult<String> {
        self.backend.get_stats().await
    }

    /// Flush what is queued and close the backend
    pub async fn close(&self) -> StorageResult<()> {
        if let Err(e) = self.flush().await {
            warn!("final flush failed: {e}");
        }
        self.backend.close().await
    }
}
