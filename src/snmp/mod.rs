//! SNMP data model
//!
//! - `oid`: the fixed column set and OID → (table, field, index) resolution
//! - `transport`: the async seam sessions poll through
//! - `udp`: the transport over UDP, for v1, v2c and v3
//! - `snapshot`: the per-poll table structure handed to derivation

pub mod oid;
pub mod snapshot;
pub mod transport;
pub mod udp;

pub use oid::{Oid, Table};
pub use snapshot::{FieldError, NodeData, Row};
pub use transport::{
    AuthProtocol, SnmpCredentials, SnmpTarget, SnmpTransport, SnmpValue, TransportError, V3Auth,
    VarBind,
};
pub use udp::UdpTransport;
