use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::monitors::critical::Resource;
use crate::snmp::transport::{AuthProtocol, SnmpCredentials, V3Auth};

/// Storage backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        /// Points older than this are deleted by the retention task
        #[serde(default = "default_retention_days")]
        retention_days: u32,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
            retention_days: default_retention_days(),
        }
    }
}

impl StorageConfig {
    pub fn retention_days(&self) -> Option<u32> {
        match self {
            StorageConfig::None => None,
            StorageConfig::Sqlite { retention_days, .. } => Some(*retention_days),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./fleetmon.db")
}

fn default_retention_days() -> u32 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnmpVersion {
    V1,
    V2c,
    V3,
}

/// SNMP credentials profile as stored in the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub version: SnmpVersion,

    #[serde(default = "default_udp")]
    pub udp: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// MD5 authentication passphrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,

    /// SHA authentication passphrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,

    /// DES privacy passphrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub des: Option<String>,
}

impl ProfileConfig {
    pub fn credentials(&self) -> anyhow::Result<SnmpCredentials> {
        let credentials = match self.version {
            SnmpVersion::V1 => SnmpCredentials::V1 {
                community: self.community.clone().context("v1 profile needs a community")?,
            },
            SnmpVersion::V2c => SnmpCredentials::V2c {
                community: self.community.clone().context("v2c profile needs a community")?,
            },
            SnmpVersion::V3 => {
                let user = self.user.clone().context("v3 profile needs a user")?;
                let auth = match (&self.md5, &self.sha) {
                    (Some(_), Some(_)) => bail!("v3 profile sets both md5 and sha"),
                    (Some(passphrase), None) => Some(V3Auth {
                        protocol: AuthProtocol::Md5,
                        passphrase: passphrase.clone(),
                    }),
                    (None, Some(passphrase)) => Some(V3Auth {
                        protocol: AuthProtocol::Sha,
                        passphrase: passphrase.clone(),
                    }),
                    (None, None) => None,
                };
                if auth.is_none() && self.des.is_some() {
                    bail!("v3 privacy requires authentication");
                }
                SnmpCredentials::V3 {
                    user,
                    auth,
                    privacy: self.des.clone(),
                }
            }
        };

        Ok(credentials)
    }
}

fn default_udp() -> u16 {
    161
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Icmp,
    Snmp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Icmp => write!(f, "icmp"),
            Protocol::Snmp => write!(f, "snmp"),
        }
    }
}

/// Monitor registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub protocol: Protocol,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    /// Last known reachability; `true` while the device does not answer
    #[serde(default)]
    pub shutdown: bool,

    /// Whether any threshold of the device is currently critical
    #[serde(default)]
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Percentage 0-100
    pub limit: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// resource -> index -> threshold
pub type CriticalConfig = BTreeMap<Resource, BTreeMap<String, ThresholdConfig>>;

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,

    #[serde(default = "default_ping_timeouts_ms")]
    pub ping_timeouts_ms: Vec<u64>,

    #[serde(default = "default_ping_success_delay_ms")]
    pub ping_success_delay_ms: u64,

    #[serde(default = "default_rolling_interval_ms")]
    pub rolling_interval_ms: u64,

    /// Maximum number of SNMP devices, 0 for no limit
    #[serde(default)]
    pub max_devices: usize,

    #[serde(default = "default_top_capacity")]
    pub top_capacity: usize,

    /// Poll attempts the failure rate is computed over
    #[serde(default = "default_failure_window")]
    pub failure_window: usize,

    #[serde(default = "default_snmp_timeout_ms")]
    pub snmp_timeout_ms: u64,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_interval_ms: default_request_interval_ms(),
            ping_timeouts_ms: default_ping_timeouts_ms(),
            ping_success_delay_ms: default_ping_success_delay_ms(),
            rolling_interval_ms: default_rolling_interval_ms(),
            max_devices: 0,
            top_capacity: default_top_capacity(),
            failure_window: default_failure_window(),
            snmp_timeout_ms: default_snmp_timeout_ms(),
            flush_interval_ms: default_flush_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl EngineConfig {
    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn ping_timeouts(&self) -> Vec<Duration> {
        self.ping_timeouts_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }

    pub fn ping_success_delay(&self) -> Duration {
        Duration::from_millis(self.ping_success_delay_ms)
    }

    pub fn snmp_timeout(&self) -> Duration {
        Duration::from_millis(self.snmp_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_request_interval_ms() -> u64 {
    10_000
}

fn default_ping_timeouts_ms() -> Vec<u64> {
    vec![2000, 3000, 5000]
}

fn default_ping_success_delay_ms() -> u64 {
    1000
}

fn default_rolling_interval_ms() -> u64 {
    60_000
}

fn default_top_capacity() -> usize {
    10
}

fn default_failure_window() -> usize {
    100
}

fn default_snmp_timeout_ms() -> u64 {
    5000
}

fn default_flush_interval_ms() -> u64 {
    5000
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,

    #[serde(default)]
    pub monitors: BTreeMap<IpAddr, MonitorConfig>,

    #[serde(default)]
    pub critical: BTreeMap<IpAddr, CriticalConfig>,

    /// Per-interface speed overrides in bits per second: ip -> ifIndex -> speed
    #[serde(default)]
    pub interfaces: BTreeMap<IpAddr, BTreeMap<String, u64>>,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Storage configuration (optional - defaults to in-memory)
    pub storage: Option<StorageConfig>,
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    serde_json::from_str(&file_content)
        .with_context(|| format!("invalid configuration file {path}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
