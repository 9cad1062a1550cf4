//! Series keys, points and persisted rows
//!
//! A series is identified by `(device, kind, index)`, e.g.
//! `("10.0.0.1", ifInOctets, "3")`. Points are bucket-aligned: the timestamp of
//! a stored point is the start of its rolling interval.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of metric a series records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetricKind {
    /// Processor load in percent
    #[serde(rename = "hrProcessorLoad")]
    ProcessorLoad,

    /// Inbound throughput in bits per second
    #[serde(rename = "ifInOctets")]
    IfInOctets,

    /// Outbound throughput in bits per second
    #[serde(rename = "ifOutOctets")]
    IfOutOctets,

    #[serde(rename = "ifInErrors")]
    IfInErrors,

    #[serde(rename = "ifOutErrors")]
    IfOutErrors,

    /// Used storage in bytes
    #[serde(rename = "hrStorageUsed")]
    StorageUsed,

    /// Poll round trip in milliseconds
    #[serde(rename = "responseTime")]
    ResponseTime,
}

impl MetricKind {
    pub const ALL: [MetricKind; 7] = [
        MetricKind::ProcessorLoad,
        MetricKind::IfInOctets,
        MetricKind::IfOutOctets,
        MetricKind::IfInErrors,
        MetricKind::IfOutErrors,
        MetricKind::StorageUsed,
        MetricKind::ResponseTime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::ProcessorLoad => "hrProcessorLoad",
            MetricKind::IfInOctets => "ifInOctets",
            MetricKind::IfOutOctets => "ifOutOctets",
            MetricKind::IfInErrors => "ifInErrors",
            MetricKind::IfOutErrors => "ifOutErrors",
            MetricKind::StorageUsed => "hrStorageUsed",
            MetricKind::ResponseTime => "responseTime",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown metric kind: {s}"))
    }
}

/// Identity of one rolling series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub device: String,
    pub kind: MetricKind,
    pub index: String,
}

impl SeriesKey {
    pub fn new(device: impl Into<String>, kind: MetricKind, index: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            kind,
            index: index.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.device, self.kind, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: i64,
}

/// One aggregate over a summary window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryPoint {
    /// Start of the summary window
    pub timestamp: DateTime<Utc>,
    pub min: i64,
    pub max: i64,
    pub avg: f64,
    pub count: usize,
}

/// Result of a series range query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "points", rename_all = "lowercase")]
pub enum SeriesData {
    Raw(Vec<SeriesPoint>),
    Summary(Vec<SummaryPoint>),
}

impl SeriesData {
    pub fn len(&self) -> usize {
        match self {
            SeriesData::Raw(points) => points.len(),
            SeriesData::Summary(points) => points.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A point queued for persistence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointRow {
    pub key: SeriesKey,
    pub point: SeriesPoint,
}

/// Last known snapshot of a device, stored as JSON
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    pub device: String,
    pub taken_at: DateTime<Utc>,
    pub data: String,
}
