//! Fleet-wide Top-N ranking per resource category
//!
//! Each category keeps one entry per device; a new submission replaces that
//! device's previous entry. Reads sort by value, then rate, then device and
//! truncate to the table capacity. Only admitted devices may submit, and
//! removing a device purges it from every category.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TopCategory {
    ResponseTime,
    FailureRate,
    Processor,
    Memory,
    MemoryRate,
    Storage,
    StorageRate,
    Throughput,
    ThroughputRate,
    ThroughputErr,
}

impl TopCategory {
    pub const ALL: [TopCategory; 10] = [
        TopCategory::ResponseTime,
        TopCategory::FailureRate,
        TopCategory::Processor,
        TopCategory::Memory,
        TopCategory::MemoryRate,
        TopCategory::Storage,
        TopCategory::StorageRate,
        TopCategory::Throughput,
        TopCategory::ThroughputRate,
        TopCategory::ThroughputErr,
    ];
}

/// A submission: `value` ranks, `rate` breaks ties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopValue {
    pub value: i64,
    pub rate: i64,
    pub index: Option<String>,
}

impl TopValue {
    pub fn new(value: i64, rate: i64, index: Option<String>) -> Self {
        Self { value, rate, index }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopEntry {
    pub device: String,
    pub value: i64,
    pub rate: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct TopTable {
    capacity: usize,
    admitted: RwLock<HashSet<String>>,
    categories: HashMap<TopCategory, Mutex<HashMap<String, TopValue>>>,
}

impl TopTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            admitted: RwLock::new(HashSet::new()),
            categories: TopCategory::ALL
                .into_iter()
                .map(|category| (category, Mutex::new(HashMap::new())))
                .collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allow submissions for `device`
    pub fn admit(&self, device: &str) {
        self.admitted
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.to_string());
    }

    /// Replace the entry of `device` in `category`
    ///
    /// Returns `false` (and drops the value) when the device is not admitted.
    pub fn submit(&self, category: TopCategory, device: &str, value: TopValue) -> bool {
        // held across the insert so a concurrent remove cannot interleave
        let admitted = self.admitted.read().unwrap_or_else(PoisonError::into_inner);
        if !admitted.contains(device) {
            return false;
        }

        if let Some(entries) = self.categories.get(&category) {
            lock(entries).insert(device.to_string(), value);
        }
        true
    }

    /// Revoke admission and purge every entry of `device`
    pub fn remove(&self, device: &str) {
        let mut admitted = self.admitted.write().unwrap_or_else(PoisonError::into_inner);
        admitted.remove(device);

        for entries in self.categories.values() {
            lock(entries).remove(device);
        }
    }

    /// Best entries of one category
    pub fn top(&self, category: TopCategory, count: usize) -> Vec<TopEntry> {
        let Some(entries) = self.categories.get(&category) else {
            return Vec::new();
        };

        let mut ranked: Vec<TopEntry> = lock(entries)
            .iter()
            .map(|(device, value)| TopEntry {
                device: device.clone(),
                value: value.value,
                rate: value.rate,
                index: value.index.clone(),
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.value
                .cmp(&a.value)
                .then(b.rate.cmp(&a.rate))
                .then_with(|| a.device.cmp(&b.device))
        });
        ranked.truncate(count.min(self.capacity));
        ranked
    }

    /// Best entries of every category
    pub fn get_top(&self, count: usize) -> BTreeMap<TopCategory, Vec<TopEntry>> {
        TopCategory::ALL
            .into_iter()
            .map(|category| (category, self.top(category, count)))
            .collect()
    }
}
