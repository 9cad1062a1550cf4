//! Object identifiers and the fixed column set requested from every device
//!
//! Each poll walks the same list of MIB-II / HOST-RESOURCES-MIB columns. A
//! var-bind coming back from the transport is resolved against this table to
//! find out which snapshot table, field and row index it belongs to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Object identifier as a sequence of arcs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Oid(Vec<u32>);

impl Oid {
    pub fn new(arcs: &[u32]) -> Self {
        Self(arcs.to_vec())
    }

    pub fn arcs(&self) -> &[u32] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &[u32]) -> bool {
        self.0.starts_with(prefix)
    }

    /// Arcs following `prefix`, if this OID lives below it
    pub fn suffix(&self, prefix: &[u32]) -> Option<&[u32]> {
        self.starts_with(prefix).then(|| &self.0[prefix.len()..])
    }

    pub fn last(&self) -> Option<u32> {
        self.0.last().copied()
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arc in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{arc}")?;
            first = false;
        }
        Ok(())
    }
}

/// Error returned when a dotted OID string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid object identifier: {0}")]
pub struct ParseOidError(String);

impl FromStr for Oid {
    type Err = ParseOidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('.');
        if trimmed.is_empty() {
            return Err(ParseOidError(s.to_string()));
        }

        trimmed
            .split('.')
            .map(|arc| arc.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map(Oid)
            .map_err(|_| ParseOidError(s.to_string()))
    }
}

impl TryFrom<String> for Oid {
    type Error = ParseOidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Oid> for String {
    fn from(oid: Oid) -> Self {
        oid.to_string()
    }
}

/// Snapshot table a column belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Scalars (sysName, hrSystemUptime, ...) stored directly on the snapshot
    System,
    Interface,
    Processor,
    Storage,
    Software,
}

impl Table {
    /// Key used for this table inside the snapshot
    pub fn key(&self) -> &'static str {
        match self {
            Table::System => "system",
            Table::Interface => "ifEntry",
            Table::Processor => "hrProcessorEntry",
            Table::Storage => "hrStorageEntry",
            Table::Software => "hrSWRunEntry",
        }
    }
}

/// A requested column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub table: Table,
    pub oid: &'static [u32],
}

impl Column {
    pub fn oid(&self) -> Oid {
        Oid::new(self.oid)
    }
}

pub const SYS_DESCR: &str = "sysDescr";
pub const SYS_OBJECT_ID: &str = "sysObjectID";
pub const SYS_NAME: &str = "sysName";
pub const SYS_SERVICES: &str = "sysServices";
pub const IF_DESCR: &str = "ifDescr";
pub const IF_TYPE: &str = "ifType";
pub const IF_SPEED: &str = "ifSpeed";
pub const IF_PHYS_ADDRESS: &str = "ifPhysAddress";
pub const IF_ADMIN_STATUS: &str = "ifAdminStatus";
pub const IF_OPER_STATUS: &str = "ifOperStatus";
pub const IF_NAME: &str = "ifName";
pub const IF_IN_OCTETS: &str = "ifInOctets";
pub const IF_IN_ERRORS: &str = "ifInErrors";
pub const IF_OUT_OCTETS: &str = "ifOutOctets";
pub const IF_OUT_ERRORS: &str = "ifOutErrors";
pub const IF_HC_IN_OCTETS: &str = "ifHCInOctets";
pub const IF_HC_OUT_OCTETS: &str = "ifHCOutOctets";
pub const IF_HIGH_SPEED: &str = "ifHighSpeed";
pub const IF_ALIAS: &str = "ifAlias";
pub const HR_SYSTEM_UPTIME: &str = "hrSystemUptime";
pub const HR_PROCESSOR_LOAD: &str = "hrProcessorLoad";
pub const HR_SW_RUN_NAME: &str = "hrSWRunName";
pub const HR_STORAGE_TYPE: &str = "hrStorageType";
pub const HR_STORAGE_DESCR: &str = "hrStorageDescr";
pub const HR_STORAGE_ALLOCATION_UNITS: &str = "hrStorageAllocationUnits";
pub const HR_STORAGE_SIZE: &str = "hrStorageSize";
pub const HR_STORAGE_USED: &str = "hrStorageUsed";

/// Fields written by metric derivation next to the raw counters
pub const IF_IN_BPS: &str = "ifInBPS";
pub const IF_OUT_BPS: &str = "ifOutBPS";
pub const IF_IN_ERRORS_DELTA: &str = "ifInErrorsDelta";
pub const IF_OUT_ERRORS_DELTA: &str = "ifOutErrorsDelta";

/// hrStorageType leaf values (hrStorageTypes.N)
pub const STORAGE_TYPE_RAM: u32 = 2;
pub const STORAGE_TYPE_VIRTUAL_MEMORY: u32 = 3;
pub const STORAGE_TYPE_FIXED_DISK: u32 = 4;

const SYSTEM: [u32; 7] = [1, 3, 6, 1, 2, 1, 1];

macro_rules! column {
    ($name:expr, $table:expr, [$($arc:expr),+ $(,)?]) => {
        Column { name: $name, table: $table, oid: &[$($arc),+] }
    };
}

/// Columns requested on every poll
pub const REQUEST_COLUMNS: &[Column] = &[
    column!(SYS_DESCR, Table::System, [1, 3, 6, 1, 2, 1, 1, 1]),
    column!(SYS_OBJECT_ID, Table::System, [1, 3, 6, 1, 2, 1, 1, 2]),
    column!(SYS_NAME, Table::System, [1, 3, 6, 1, 2, 1, 1, 5]),
    column!(SYS_SERVICES, Table::System, [1, 3, 6, 1, 2, 1, 1, 7]),
    column!(IF_DESCR, Table::Interface, [1, 3, 6, 1, 2, 1, 2, 2, 1, 2]),
    column!(IF_TYPE, Table::Interface, [1, 3, 6, 1, 2, 1, 2, 2, 1, 3]),
    column!(IF_SPEED, Table::Interface, [1, 3, 6, 1, 2, 1, 2, 2, 1, 5]),
    column!(IF_PHYS_ADDRESS, Table::Interface, [1, 3, 6, 1, 2, 1, 2, 2, 1, 6]),
    column!(IF_ADMIN_STATUS, Table::Interface, [1, 3, 6, 1, 2, 1, 2, 2, 1, 7]),
    column!(IF_OPER_STATUS, Table::Interface, [1, 3, 6, 1, 2, 1, 2, 2, 1, 8]),
    column!(IF_IN_OCTETS, Table::Interface, [1, 3, 6, 1, 2, 1, 2, 2, 1, 10]),
    column!(IF_IN_ERRORS, Table::Interface, [1, 3, 6, 1, 2, 1, 2, 2, 1, 14]),
    column!(IF_OUT_OCTETS, Table::Interface, [1, 3, 6, 1, 2, 1, 2, 2, 1, 16]),
    column!(IF_OUT_ERRORS, Table::Interface, [1, 3, 6, 1, 2, 1, 2, 2, 1, 20]),
    column!(IF_NAME, Table::Interface, [1, 3, 6, 1, 2, 1, 31, 1, 1, 1, 1]),
    column!(IF_HC_IN_OCTETS, Table::Interface, [1, 3, 6, 1, 2, 1, 31, 1, 1, 1, 6]),
    column!(IF_HC_OUT_OCTETS, Table::Interface, [1, 3, 6, 1, 2, 1, 31, 1, 1, 1, 10]),
    column!(IF_HIGH_SPEED, Table::Interface, [1, 3, 6, 1, 2, 1, 31, 1, 1, 1, 15]),
    column!(IF_ALIAS, Table::Interface, [1, 3, 6, 1, 2, 1, 31, 1, 1, 1, 18]),
    column!(HR_SYSTEM_UPTIME, Table::System, [1, 3, 6, 1, 2, 1, 25, 1, 1]),
    column!(HR_PROCESSOR_LOAD, Table::Processor, [1, 3, 6, 1, 2, 1, 25, 3, 3, 1, 2]),
    column!(HR_SW_RUN_NAME, Table::Software, [1, 3, 6, 1, 2, 1, 25, 4, 2, 1, 2]),
    column!(HR_STORAGE_TYPE, Table::Storage, [1, 3, 6, 1, 2, 1, 25, 2, 3, 1, 2]),
    column!(HR_STORAGE_DESCR, Table::Storage, [1, 3, 6, 1, 2, 1, 25, 2, 3, 1, 3]),
    column!(HR_STORAGE_ALLOCATION_UNITS, Table::Storage, [1, 3, 6, 1, 2, 1, 25, 2, 3, 1, 4]),
    column!(HR_STORAGE_SIZE, Table::Storage, [1, 3, 6, 1, 2, 1, 25, 2, 3, 1, 5]),
    column!(HR_STORAGE_USED, Table::Storage, [1, 3, 6, 1, 2, 1, 25, 2, 3, 1, 6]),
];

/// Column OIDs in request order
pub fn request_oids() -> Vec<Oid> {
    REQUEST_COLUMNS.iter().map(Column::oid).collect()
}

/// Columns enough to identify a device during a trial poll
pub fn identity_oids() -> Vec<Oid> {
    REQUEST_COLUMNS
        .iter()
        .filter(|column| column.oid.starts_with(&SYSTEM))
        .map(Column::oid)
        .collect()
}

/// Resolve a returned OID to its column and row index
///
/// The index is the dotted remainder after the column prefix (`"0"` for
/// scalars). Returns `None` for OIDs outside the requested set, including
/// the end-of-walk OIDs some agents return past a column.
pub fn resolve(oid: &Oid) -> Option<(&'static Column, String)> {
    REQUEST_COLUMNS.iter().find_map(|column| {
        let suffix = oid.suffix(column.oid)?;
        if suffix.is_empty() {
            return None;
        }
        let index = suffix
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(".");
        Some((column, index))
    })
}
