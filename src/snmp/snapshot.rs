//! Per-device poll snapshot
//!
//! One [`NodeData`] holds everything a single poll returned: system scalars
//! and the interface / processor / storage / software tables keyed by row
//! index. Derived values (bits per second, error deltas) are written back into
//! the same rows so the latest snapshot is self-contained.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

use super::oid::{self, HR_STORAGE_TYPE, SYS_NAME, SYS_OBJECT_ID, Table};
use super::transport::{SnmpValue, VarBind};

/// Why a field could not be read from a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("field {0} is missing")]
    Missing(&'static str),

    #[error("field {0} has an unexpected type")]
    Malformed(&'static str),
}

/// One table row, stamped with the time of the response it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Row {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    pub fn has(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn get_u64(&self, field: &'static str) -> Result<u64, FieldError> {
        let value = self.fields.get(field).ok_or(FieldError::Missing(field))?;
        value.as_u64().ok_or(FieldError::Malformed(field))
    }

    pub fn get_i64(&self, field: &'static str) -> Result<i64, FieldError> {
        let value = self.fields.get(field).ok_or(FieldError::Missing(field))?;
        value.as_i64().ok_or(FieldError::Malformed(field))
    }

    pub fn get_str(&self, field: &'static str) -> Result<&str, FieldError> {
        let value = self.fields.get(field).ok_or(FieldError::Missing(field))?;
        value.as_str().ok_or(FieldError::Malformed(field))
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_string(), value.into());
    }
}

/// Latest raw + derived state of one SNMP device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeData {
    pub system: BTreeMap<String, Value>,

    pub tables: BTreeMap<String, BTreeMap<String, Row>>,

    /// Round trip of the poll in milliseconds
    pub response_time: u64,

    pub timestamp: DateTime<Utc>,

    /// Set to 100 when served from the persisted snapshot instead of a live
    /// session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<u32>,
}

impl NodeData {
    pub fn new(response_time: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            system: BTreeMap::new(),
            tables: BTreeMap::new(),
            response_time,
            timestamp,
            failure: None,
        }
    }

    /// Build a snapshot from the var-binds of one walk
    ///
    /// Var-binds outside the requested column set and `Null` values are
    /// dropped. `hrStorageType` is an OID; only its last arc is kept.
    pub fn from_varbinds(
        varbinds: Vec<VarBind>,
        response_time: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut data = Self::new(response_time, timestamp);

        for VarBind { oid, value } in varbinds {
            let Some((column, index)) = oid::resolve(&oid) else {
                trace!("ignoring unrequested oid {oid}");
                continue;
            };

            let json = match (&value, column.name) {
                (SnmpValue::ObjectId(kind), HR_STORAGE_TYPE) => kind.last().map(Value::from),
                _ => value.to_json(),
            };
            let Some(json) = json else {
                continue;
            };

            if column.table == Table::System {
                data.system.insert(column.name.to_string(), json);
            } else {
                data.tables
                    .entry(column.table.key().to_string())
                    .or_default()
                    .entry(index)
                    .or_insert_with(|| Row::new(timestamp))
                    .fields
                    .insert(column.name.to_string(), json);
            }
        }

        data
    }

    /// Carry over what this poll did not return from `previous`
    ///
    /// Scalars and whole rows missing here are copied with their original
    /// timestamp, so rows keep their last counters as the baseline for the
    /// next rate computation. Returned rows replace the previous ones.
    pub fn merge_previous(&mut self, previous: &NodeData) {
        for (field, value) in &previous.system {
            self.system
                .entry(field.clone())
                .or_insert_with(|| value.clone());
        }

        for (table, rows) in &previous.tables {
            let merged = self.tables.entry(table.clone()).or_default();
            for (index, row) in rows {
                merged.entry(index.clone()).or_insert_with(|| row.clone());
            }
        }
    }

    pub fn table(&self, table: Table) -> Option<&BTreeMap<String, Row>> {
        self.tables.get(table.key())
    }

    pub fn table_mut(&mut self, table: Table) -> Option<&mut BTreeMap<String, Row>> {
        self.tables.get_mut(table.key())
    }

    pub fn row(&self, table: Table, index: &str) -> Option<&Row> {
        self.table(table).and_then(|rows| rows.get(index))
    }

    pub fn row_count(&self, table: Table) -> usize {
        self.table(table).map_or(0, BTreeMap::len)
    }

    pub fn sys_name(&self) -> Option<&str> {
        self.system
            .get(SYS_NAME)
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
    }

    pub fn sys_object_id(&self) -> Option<&str> {
        self.system.get(SYS_OBJECT_ID).and_then(Value::as_str)
    }
}
