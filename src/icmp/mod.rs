//! Reachability probing
//!
//! [`Prober`] is the seam ping sessions probe through. [`IcmpProber`] sends
//! real ICMP echo requests; tests substitute scripted probers.

mod native;

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use native::IcmpProber;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("no echo reply within {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("ping command failed: {0}")]
    Command(String),
}

/// Issue one reachability probe and return the measured round trip
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError>;
}
