//! SNMP transport seam
//!
//! PDU encoding and USM key localisation belong to the transport
//! implementation ([`super::udp::UdpTransport`]). Sessions only see
//! [`SnmpTransport::walk`], which returns every var-bind below the requested
//! columns or a classified error.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::oid::Oid;

/// User-based security authentication protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProtocol {
    Md5,
    Sha,
}

/// SNMPv3 security level derived from the configured secrets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    NoAuthNoPriv,
    AuthNoPriv,
    AuthPriv,
}

/// Authentication secret for an SNMPv3 user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V3Auth {
    pub protocol: AuthProtocol,
    pub passphrase: String,
}

/// Credentials for one device, by protocol version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnmpCredentials {
    V1 {
        community: String,
    },
    V2c {
        community: String,
    },
    V3 {
        user: String,
        auth: Option<V3Auth>,
        /// DES privacy passphrase; only honoured together with `auth`
        privacy: Option<String>,
    },
}

impl SnmpCredentials {
    pub fn version(&self) -> &'static str {
        match self {
            SnmpCredentials::V1 { .. } => "v1",
            SnmpCredentials::V2c { .. } => "v2c",
            SnmpCredentials::V3 { .. } => "v3",
        }
    }

    pub fn security_level(&self) -> Option<SecurityLevel> {
        match self {
            SnmpCredentials::V3 { auth: None, .. } => Some(SecurityLevel::NoAuthNoPriv),
            SnmpCredentials::V3 {
                auth: Some(_),
                privacy: None,
                ..
            } => Some(SecurityLevel::AuthNoPriv),
            SnmpCredentials::V3 {
                auth: Some(_),
                privacy: Some(_),
                ..
            } => Some(SecurityLevel::AuthPriv),
            _ => None,
        }
    }
}

/// Everything the transport needs to reach one agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnmpTarget {
    pub ip: IpAddr,
    pub udp: u16,
    pub credentials: SnmpCredentials,
    pub timeout: Duration,
}

/// Decoded var-bind value
#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    Integer(i64),
    Counter32(u32),
    Counter64(u64),
    Gauge32(u32),
    TimeTicks(u32),
    OctetString(Vec<u8>),
    ObjectId(Oid),
    IpAddress([u8; 4]),
    /// noSuchObject / noSuchInstance / endOfMibView
    Null,
}

impl SnmpValue {
    /// JSON representation stored in the snapshot
    ///
    /// Printable octet strings become text, others a colon-separated hex
    /// string (MAC addresses). `Null` has no representation.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        use serde_json::Value;

        let value = match self {
            SnmpValue::Integer(v) => Value::from(*v),
            SnmpValue::Counter32(v) | SnmpValue::Gauge32(v) | SnmpValue::TimeTicks(v) => {
                Value::from(*v)
            }
            SnmpValue::Counter64(v) => Value::from(*v),
            SnmpValue::OctetString(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) if text.chars().all(|c| !c.is_control() || c == '\n' || c == '\t') => {
                    Value::from(text)
                }
                _ => Value::from(
                    bytes
                        .iter()
                        .map(|b| format!("{b:02x}"))
                        .collect::<Vec<_>>()
                        .join(":"),
                ),
            },
            SnmpValue::ObjectId(oid) => Value::from(oid.to_string()),
            SnmpValue::IpAddress([a, b, c, d]) => Value::from(format!("{a}.{b}.{c}.{d}")),
            SnmpValue::Null => return None,
        };

        Some(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarBind {
    pub oid: Oid,
    pub value: SnmpValue,
}

impl VarBind {
    pub fn new(oid: Oid, value: SnmpValue) -> Self {
        Self { oid, value }
    }
}

/// Transport failures, split by how the coordinator reacts to them
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// No answer within the request timeout; a reachability signal
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Socket error, malformed packet, authentication failure, ...
    #[error("transport error: {0}")]
    Exception(String),
}

/// Trait for SNMP transports (v1/v2c/v3)
///
/// Implementations must be `Send + Sync`; one transport instance is shared by
/// every poll session in the fleet.
#[async_trait]
pub trait SnmpTransport: Send + Sync {
    /// Walk every column in `columns` and return the collected var-binds
    async fn walk(&self, target: &SnmpTarget, columns: &[Oid])
    -> Result<Vec<VarBind>, TransportError>;
}
