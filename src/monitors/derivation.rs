//! Metric derivation
//!
//! Turns one successful poll into series samples, threshold evaluations and
//! Top-N submissions. Runs synchronously inside the device's poll session;
//! the shared structures it touches carry their own locks.
//!
//! A row with a missing or malformed required field is skipped with a
//! warning. Everything else in the poll is still processed.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{trace, warn};

use super::critical::{CriticalTransition, Resource, ThresholdRegistry};
use super::top::{TopCategory, TopTable, TopValue};
use crate::snmp::oid::{
    HR_PROCESSOR_LOAD, HR_STORAGE_ALLOCATION_UNITS, HR_STORAGE_SIZE, HR_STORAGE_TYPE,
    HR_STORAGE_USED, IF_ADMIN_STATUS, IF_HC_IN_OCTETS, IF_HC_OUT_OCTETS, IF_HIGH_SPEED,
    IF_IN_BPS, IF_IN_ERRORS, IF_IN_ERRORS_DELTA, IF_IN_OCTETS, IF_OUT_BPS, IF_OUT_ERRORS,
    IF_OUT_ERRORS_DELTA, IF_OUT_OCTETS, IF_SPEED, STORAGE_TYPE_FIXED_DISK, STORAGE_TYPE_RAM,
    Table,
};
use crate::snmp::snapshot::{FieldError, NodeData, Row};
use crate::storage::schema::{MetricKind, SeriesKey};
use crate::storage::series::SeriesStore;

const ADMIN_UP: i64 = 1;
const COUNTER32_MODULUS: u64 = 1 << 32;

/// Bits per second for `delta_bytes` transferred over `duration_ms`
///
/// `None` for a zero or negative duration.
pub fn bits_per_second(delta_bytes: u64, duration_ms: i64) -> Option<u64> {
    let duration = u128::try_from(duration_ms).ok().filter(|d| *d > 0)?;
    let rate = u128::from(delta_bytes) * 8000 / duration;
    Some(u64::try_from(rate).unwrap_or(u64::MAX))
}

/// Increase of a counter between two samples
///
/// A 32-bit counter that went down is assumed to have wrapped once. A
/// 64-bit counter that went down was reset; the sample yields nothing.
pub fn counter_delta(current: u64, previous: u64, wide: bool) -> Option<u64> {
    if current >= previous {
        return Some(current - previous);
    }

    if wide || previous >= COUNTER32_MODULUS {
        return None;
    }

    Some(current + COUNTER32_MODULUS - previous)
}

/// Keeps the best candidate for a Top-N category
#[derive(Debug, Default)]
struct Best(Option<TopValue>);

impl Best {
    /// Offer a candidate ranked by `(value, rate)`
    fn offer(&mut self, candidate: TopValue) {
        let better = match &self.0 {
            Some(best) => (candidate.value, candidate.rate) > (best.value, best.rate),
            None => true,
        };
        if better {
            self.0 = Some(candidate);
        }
    }
}

/// Outcome of deriving one poll
#[derive(Debug, Default)]
pub struct Derivation {
    pub transitions: Vec<CriticalTransition>,
    /// Rows skipped because of missing or malformed fields
    pub skipped: usize,
}

pub struct Deriver {
    store: Arc<SeriesStore>,
    thresholds: Arc<ThresholdRegistry>,
    top: Arc<TopTable>,
}

impl Deriver {
    pub fn new(
        store: Arc<SeriesStore>,
        thresholds: Arc<ThresholdRegistry>,
        top: Arc<TopTable>,
    ) -> Self {
        Self {
            store,
            thresholds,
            top,
        }
    }

    /// Derive metrics of `current`, writing rates and deltas into its rows
    ///
    /// `speeds` holds per-ifIndex capacity overrides in bits per second.
    pub fn derive(
        &self,
        device: &str,
        current: &mut NodeData,
        previous: Option<&NodeData>,
        speeds: &BTreeMap<String, u64>,
    ) -> Derivation {
        let mut derivation = Derivation::default();

        self.response_time(device, current);
        self.processors(device, current, &mut derivation);
        self.storages(device, current, &mut derivation);
        self.interfaces(device, current, previous, speeds, &mut derivation);

        derivation
    }

    /// Submit the poll failure rate (percent) to the ranking
    pub fn submit_failure_rate(&self, device: &str, rate: u32) {
        let rate = i64::from(rate);
        self.top.submit(
            TopCategory::FailureRate,
            device,
            TopValue::new(rate, rate, None),
        );
    }

    fn roll(&self, device: &str, kind: MetricKind, index: &str, value: u64, data: &NodeData) {
        let value = i64::try_from(value).unwrap_or(i64::MAX);
        self.store
            .roll(SeriesKey::new(device, kind, index), value, data.timestamp);
    }

    fn evaluate(
        &self,
        device: &str,
        resource: Resource,
        index: &str,
        current: u64,
        max: u64,
        derivation: &mut Derivation,
    ) {
        if let Some(transition) = self
            .thresholds
            .evaluate(device, resource, index, current, max)
        {
            derivation.transitions.push(transition);
        }
    }

    fn submit(&self, device: &str, category: TopCategory, best: Best) {
        if let Some(value) = best.0 {
            self.top.submit(category, device, value);
        }
    }

    fn skip(device: &str, table: Table, index: &str, error: FieldError, derivation: &mut Derivation) {
        warn!("{device}: skipping {}.{index}: {error}", table.key());
        derivation.skipped += 1;
    }

    fn response_time(&self, device: &str, data: &NodeData) {
        self.roll(device, MetricKind::ResponseTime, "0", data.response_time, data);

        let response_time = i64::try_from(data.response_time).unwrap_or(i64::MAX);
        self.top.submit(
            TopCategory::ResponseTime,
            device,
            TopValue::new(response_time, 0, None),
        );
    }

    fn processors(&self, device: &str, data: &NodeData, derivation: &mut Derivation) {
        let Some(rows) = data.table(Table::Processor) else {
            return;
        };

        let mut best = Best::default();
        for (index, row) in rows.iter().filter(|(_, row)| refreshed(row, data)) {
            let load = match row.get_u64(HR_PROCESSOR_LOAD) {
                Ok(load) if load <= 100 => load,
                Ok(load) => {
                    warn!("{device}: skipping processor.{index}: load {load} out of range");
                    derivation.skipped += 1;
                    continue;
                }
                Err(e) => {
                    Self::skip(device, Table::Processor, index, e, derivation);
                    continue;
                }
            };

            self.roll(device, MetricKind::ProcessorLoad, index, load, data);
            self.evaluate(device, Resource::Processor, index, load, 100, derivation);

            let load = load as i64;
            best.offer(TopValue::new(load, load, Some(index.clone())));
        }

        self.submit(device, TopCategory::Processor, best);
    }

    fn storages(&self, device: &str, data: &NodeData, derivation: &mut Derivation) {
        let Some(rows) = data.table(Table::Storage) else {
            return;
        };

        let mut memory = Best::default();
        let mut memory_rate = Best::default();
        let mut storage = Best::default();
        let mut storage_rate = Best::default();

        for (index, row) in rows.iter().filter(|(_, row)| refreshed(row, data)) {
            let fields = (|| -> Result<_, FieldError> {
                Ok((
                    row.get_u64(HR_STORAGE_TYPE)?,
                    row.get_u64(HR_STORAGE_ALLOCATION_UNITS)?,
                    row.get_u64(HR_STORAGE_SIZE)?,
                    row.get_u64(HR_STORAGE_USED)?,
                ))
            })();
            let (kind, units, size, used) = match fields {
                Ok(fields) => fields,
                Err(e) => {
                    Self::skip(device, Table::Storage, index, e, derivation);
                    continue;
                }
            };

            if size == 0 {
                trace!("{device}: storage {index} has no capacity");
                continue;
            }

            let used_bytes = used.saturating_mul(units);
            self.roll(device, MetricKind::StorageUsed, index, used_bytes, data);

            let resource = match u32::try_from(kind) {
                Ok(STORAGE_TYPE_RAM) => Resource::Memory,
                Ok(STORAGE_TYPE_FIXED_DISK) => Resource::Storage,
                _ => continue,
            };

            self.evaluate(device, resource, index, used, size, derivation);

            let bytes = i64::try_from(used_bytes).unwrap_or(i64::MAX);
            let rate = (u128::from(used) * 100 / u128::from(size)) as i64;
            let index = Some(index.clone());
            let (absolute, relative) = match resource {
                Resource::Memory => (&mut memory, &mut memory_rate),
                _ => (&mut storage, &mut storage_rate),
            };
            absolute.offer(TopValue::new(bytes, rate, index.clone()));
            relative.offer(TopValue::new(rate, bytes, index));
        }

        self.submit(device, TopCategory::Memory, memory);
        self.submit(device, TopCategory::MemoryRate, memory_rate);
        self.submit(device, TopCategory::Storage, storage);
        self.submit(device, TopCategory::StorageRate, storage_rate);
    }

    fn interfaces(
        &self,
        device: &str,
        current: &mut NodeData,
        previous: Option<&NodeData>,
        speeds: &BTreeMap<String, u64>,
        derivation: &mut Derivation,
    ) {
        let timestamp = current.timestamp;
        let Some(rows) = current.table_mut(Table::Interface) else {
            return;
        };

        let mut throughput = Best::default();
        let mut throughput_rate = Best::default();
        let mut errors = Best::default();

        for (index, row) in rows.iter_mut() {
            if row.timestamp != timestamp {
                continue;
            }

            match row.get_i64(IF_ADMIN_STATUS) {
                Ok(ADMIN_UP) => {}
                Ok(_) => continue,
                Err(e) => {
                    Self::skip(device, Table::Interface, index, e, derivation);
                    continue;
                }
            }

            let Some(last) = previous.and_then(|data| data.row(Table::Interface, index)) else {
                continue;
            };

            let Some(capacity) = capacity(row, speeds.get(index).copied()) else {
                continue;
            };

            let duration_ms = (row.timestamp - last.timestamp).num_milliseconds();
            let roll = |kind: MetricKind, value: u64| {
                let value = i64::try_from(value).unwrap_or(i64::MAX);
                self.store
                    .roll(SeriesKey::new(device, kind, index.as_str()), value, timestamp);
            };

            let mut error_delta = None;
            for (field, delta_field, kind) in [
                (IF_IN_ERRORS, IF_IN_ERRORS_DELTA, MetricKind::IfInErrors),
                (IF_OUT_ERRORS, IF_OUT_ERRORS_DELTA, MetricKind::IfOutErrors),
            ] {
                let (Ok(now), Ok(before)) = (row.get_u64(field), last.get_u64(field)) else {
                    continue;
                };
                if let Some(delta) = counter_delta(now, before, true) {
                    row.set(delta_field, delta);
                    roll(kind, delta);
                    error_delta = error_delta.max(Some(delta));
                }
            }

            let mut max_bps = None;
            for (wide_field, narrow_field, bps_field, kind) in [
                (IF_HC_IN_OCTETS, IF_IN_OCTETS, IF_IN_BPS, MetricKind::IfInOctets),
                (IF_HC_OUT_OCTETS, IF_OUT_OCTETS, IF_OUT_BPS, MetricKind::IfOutOctets),
            ] {
                let Some(delta) = octet_delta(row, last, wide_field, narrow_field) else {
                    continue;
                };
                let Some(bps) = bits_per_second(delta, duration_ms) else {
                    trace!("{device}: interface {index} sampled twice at the same instant");
                    continue;
                };
                row.set(bps_field, bps);
                roll(kind, bps);
                max_bps = max_bps.max(Some(bps));
            }

            if let Some(bps) = max_bps {
                self.evaluate(device, Resource::Throughput, index, bps, capacity, derivation);

                let value = i64::try_from(bps).unwrap_or(i64::MAX);
                let rate = (u128::from(bps) * 100 / u128::from(capacity)) as i64;
                throughput.offer(TopValue::new(value, rate, Some(index.clone())));
                throughput_rate.offer(TopValue::new(rate, value, Some(index.clone())));
            }

            if let Some(delta) = error_delta {
                let delta = i64::try_from(delta).unwrap_or(i64::MAX);
                errors.offer(TopValue::new(delta, 0, Some(index.clone())));
            }
        }

        self.submit(device, TopCategory::Throughput, throughput);
        self.submit(device, TopCategory::ThroughputRate, throughput_rate);
        self.submit(device, TopCategory::ThroughputErr, errors);
    }
}

/// Whether `row` was returned by the poll `data` was built from
///
/// Rows carried over from an earlier poll keep their own timestamp.
fn refreshed(row: &Row, data: &NodeData) -> bool {
    row.timestamp == data.timestamp
}

/// Interface capacity in bits per second
///
/// Precedence: configured override, ifHighSpeed (Mbps), ifSpeed. The first
/// positive value wins.
fn capacity(row: &Row, speed_override: Option<u64>) -> Option<u64> {
    speed_override
        .filter(|speed| *speed > 0)
        .or_else(|| {
            row.get_u64(IF_HIGH_SPEED)
                .ok()
                .filter(|speed| *speed > 0)
                .map(|mbps| mbps.saturating_mul(1_000_000))
        })
        .or_else(|| row.get_u64(IF_SPEED).ok().filter(|speed| *speed > 0))
}

/// Octet delta, preferring the 64-bit counter when both samples carry it
fn octet_delta(row: &Row, last: &Row, wide: &'static str, narrow: &'static str) -> Option<u64> {
    if let (Ok(now), Ok(before)) = (row.get_u64(wide), last.get_u64(wide)) {
        return counter_delta(now, before, true);
    }

    let (Ok(now), Ok(before)) = (row.get_u64(narrow), last.get_u64(narrow)) else {
        return None;
    };
    counter_delta(now, before, false)
}
