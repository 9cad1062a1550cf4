//! Threshold (critical) detection with hysteresis
//!
//! Every `(resource, index)` threshold remembers whether its last sample was
//! critical. The first sample only initializes that state; after that an
//! event is produced exactly when the state flips.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::{CriticalConfig, ThresholdConfig};

/// Index of the processor threshold that applies to every CPU without one
pub const ALL_PROCESSORS: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Processor,
    Memory,
    Storage,
    Throughput,
}

impl Resource {
    pub const ALL: [Resource; 4] = [
        Resource::Processor,
        Resource::Memory,
        Resource::Storage,
        Resource::Throughput,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Processor => "processor",
            Resource::Memory => "memory",
            Resource::Storage => "storage",
            Resource::Throughput => "throughput",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resource::ALL
            .into_iter()
            .find(|resource| resource.as_str() == s)
            .ok_or_else(|| format!("unknown resource: {s}"))
    }
}

/// A threshold crossing in either direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalTransition {
    pub resource: Resource,
    pub index: String,
    pub critical: bool,
    /// `current * 100 / max` at the time of the flip
    pub rate: u64,
    pub description: Option<String>,
}

impl fmt::Display for CriticalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.critical { "critical" } else { "normal" };
        write!(f, "{}.{} {}% {state}", self.resource, self.index, self.rate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Threshold {
    limit: u64,
    description: Option<String>,
    /// `None` until the first sample
    state: Option<bool>,
}

impl Threshold {
    fn new(limit: u8, description: Option<String>) -> Self {
        Self {
            limit: u64::from(limit),
            description,
            state: None,
        }
    }
}

/// Thresholds and their state for one device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CriticalDetector {
    thresholds: BTreeMap<Resource, BTreeMap<String, Threshold>>,
}

impl CriticalDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &CriticalConfig) -> Self {
        let thresholds = config
            .iter()
            .map(|(resource, indices)| {
                let indices = indices
                    .iter()
                    .map(|(index, threshold)| {
                        (
                            index.clone(),
                            Threshold::new(threshold.limit, threshold.description.clone()),
                        )
                    })
                    .collect();
                (*resource, indices)
            })
            .collect();

        Self { thresholds }
    }

    pub fn to_config(&self) -> CriticalConfig {
        self.thresholds
            .iter()
            .map(|(resource, indices)| {
                let indices = indices
                    .iter()
                    .map(|(index, threshold)| {
                        (
                            index.clone(),
                            ThresholdConfig {
                                limit: threshold.limit.min(100) as u8,
                                description: threshold.description.clone(),
                            },
                        )
                    })
                    .collect();
                (*resource, indices)
            })
            .collect()
    }

    /// Define a threshold; an existing one is only replaced with `overwrite`
    ///
    /// Replacing a threshold resets its state. Returns whether it was applied.
    pub fn set(
        &mut self,
        resource: Resource,
        index: &str,
        limit: u8,
        description: Option<String>,
        overwrite: bool,
    ) -> bool {
        let indices = self.thresholds.entry(resource).or_default();
        if indices.contains_key(index) && !overwrite {
            return false;
        }

        indices.insert(index.to_string(), Threshold::new(limit.min(100), description));
        true
    }

    /// Drop thresholds of one resource, or of all of them
    pub fn clear(&mut self, resource: Option<Resource>) {
        match resource {
            Some(resource) => {
                self.thresholds.remove(&resource);
            }
            None => self.thresholds.clear(),
        }
    }

    /// Evaluate one sample
    ///
    /// Returns a transition only when the critical state of `(resource,
    /// index)` flips. A missing threshold or a zero `max` is a no-op. A CPU
    /// without its own threshold gets a copy of the `"0"` threshold with
    /// independent state.
    pub fn evaluate(
        &mut self,
        resource: Resource,
        index: &str,
        current: u64,
        max: u64,
    ) -> Option<CriticalTransition> {
        if max == 0 {
            return None;
        }

        let indices = self.thresholds.get_mut(&resource)?;
        if !indices.contains_key(index) {
            if resource != Resource::Processor {
                return None;
            }
            let template = indices.get(ALL_PROCESSORS)?;
            let cloned = Threshold::new(
                template.limit.min(100) as u8,
                template.description.clone(),
            );
            indices.insert(index.to_string(), cloned);
        }
        let threshold = indices.get_mut(index)?;

        let rate = (u128::from(current) * 100 / u128::from(max)) as u64;
        let critical = rate >= threshold.limit;

        let previous = threshold.state.replace(critical);
        match previous {
            Some(previous) if previous != critical => Some(CriticalTransition {
                resource,
                index: index.to_string(),
                critical,
                rate,
                description: threshold.description.clone(),
            }),
            _ => None,
        }
    }

    /// Whether any threshold currently is in critical state
    pub fn is_critical(&self) -> bool {
        self.thresholds
            .values()
            .flat_map(BTreeMap::values)
            .any(|threshold| threshold.state == Some(true))
    }

    pub fn has(&self, resource: Resource, index: &str) -> bool {
        self.thresholds
            .get(&resource)
            .is_some_and(|indices| indices.contains_key(index))
    }
}

/// Detectors of every registered device
///
/// Each device has its own lock, so sessions of different devices never
/// contend. Removing a device discards its state; evaluations for devices not
/// in the registry are ignored.
#[derive(Debug, Default)]
pub struct ThresholdRegistry {
    devices: RwLock<HashMap<String, Arc<Mutex<CriticalDetector>>>>,
}

impl ThresholdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: &str, detector: CriticalDetector) {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.to_string(), Arc::new(Mutex::new(detector)));
    }

    pub fn remove(&self, device: &str) -> bool {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device)
            .is_some()
    }

    /// Run `f` on the detector of `device`, if registered
    pub fn with<R>(&self, device: &str, f: impl FnOnce(&mut CriticalDetector) -> R) -> Option<R> {
        let detector = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device)
            .cloned()?;

        let mut detector = detector.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&mut detector))
    }

    pub fn evaluate(
        &self,
        device: &str,
        resource: Resource,
        index: &str,
        current: u64,
        max: u64,
    ) -> Option<CriticalTransition> {
        self.with(device, |detector| {
            detector.evaluate(resource, index, current, max)
        })
        .flatten()
    }

    pub fn is_critical(&self, device: &str) -> bool {
        self.with(device, |detector| detector.is_critical())
            .unwrap_or(false)
    }
}
