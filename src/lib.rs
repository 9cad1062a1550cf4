//! Fleet monitoring engine
//!
//! Polls SNMP devices and pings ICMP devices, keeps rolling per-metric
//! series, tracks threshold crossings and a fleet-wide Top-N, and
//! publishes events for reachability and criticality changes.

pub mod actors;
pub mod config;
pub mod fleet;
pub mod icmp;
pub mod monitors;
pub mod snmp;
pub mod storage;

pub use actors::{EventCategory, MonitorEvent};
pub use config::{Config, Protocol, read_config_file};
pub use fleet::{DeviceSummary, Fleet, RegistrationError};
