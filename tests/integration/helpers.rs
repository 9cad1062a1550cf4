//! Fakes for integration tests: scripted SNMP agents and ICMP targets

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetmon::config::{Config, ProfileConfig, SnmpVersion};
use fleetmon::icmp::{ProbeError, Prober};
use fleetmon::snmp::{Oid, SnmpCredentials, SnmpTarget, SnmpTransport, SnmpValue, TransportError, VarBind};
use fleetmon::storage::memory::MemoryBackend;
use fleetmon::{EventCategory, Fleet, MonitorEvent};
use tokio::sync::broadcast;
use tokio::time::sleep;

pub const CPU_INDEX: &str = "196608";

pub fn ip(text: &str) -> IpAddr {
    text.parse().unwrap()
}

fn oid(text: &str) -> Oid {
    text.parse().unwrap()
}

fn text(value: &str) -> SnmpValue {
    SnmpValue::OctetString(value.as_bytes().to_vec())
}

/// What a fake agent answers
#[derive(Debug, Clone)]
pub struct Agent {
    pub community: String,
    pub sys_name: String,
    pub cpu_load: i64,
    /// Used units out of 1000
    pub memory_used: i64,
    pub disk_used: i64,
    pub in_octets: u32,
    /// Octets added to `in_octets` by every walk
    pub traffic: u32,
    pub responding: bool,
    /// Answer every request with a transport exception
    pub broken: bool,
}

impl Agent {
    pub fn new(sys_name: &str) -> Self {
        Self {
            community: "public".to_string(),
            sys_name: sys_name.to_string(),
            cpu_load: 10,
            memory_used: 400,
            disk_used: 200,
            in_octets: 1000,
            traffic: 0,
            responding: true,
            broken: false,
        }
    }

    fn storage(index: u32, kind: u32, descr: &str, used: i64) -> Vec<VarBind> {
        let column = |arc: u32| oid(&format!("1.3.6.1.2.1.25.2.3.1.{arc}.{index}"));
        vec![
            VarBind::new(
                column(2),
                SnmpValue::ObjectId(oid(&format!("1.3.6.1.2.1.25.2.1.{kind}"))),
            ),
            VarBind::new(column(3), text(descr)),
            VarBind::new(column(4), SnmpValue::Integer(1024)),
            VarBind::new(column(5), SnmpValue::Integer(1000)),
            VarBind::new(column(6), SnmpValue::Integer(used)),
        ]
    }

    pub fn varbinds(&self) -> Vec<VarBind> {
        let mut varbinds = vec![
            VarBind::new(oid("1.3.6.1.2.1.1.5.0"), text(&self.sys_name)),
            VarBind::new(
                oid("1.3.6.1.2.1.1.2.0"),
                SnmpValue::ObjectId(oid("1.3.6.1.4.1.8072.3.2.10")),
            ),
            VarBind::new(
                oid(&format!("1.3.6.1.2.1.25.3.3.1.2.{CPU_INDEX}")),
                SnmpValue::Integer(self.cpu_load),
            ),
            VarBind::new(oid("1.3.6.1.2.1.2.2.1.2.1"), text("eth0")),
            VarBind::new(oid("1.3.6.1.2.1.2.2.1.5.1"), SnmpValue::Gauge32(100_000_000)),
            VarBind::new(oid("1.3.6.1.2.1.2.2.1.7.1"), SnmpValue::Integer(1)),
            VarBind::new(oid("1.3.6.1.2.1.2.2.1.10.1"), SnmpValue::Counter32(self.in_octets)),
            VarBind::new(oid("1.3.6.1.2.1.2.2.1.14.1"), SnmpValue::Counter32(0)),
            VarBind::new(oid("1.3.6.1.2.1.2.2.1.16.1"), SnmpValue::Counter32(self.in_octets / 2)),
            VarBind::new(oid("1.3.6.1.2.1.2.2.1.20.1"), SnmpValue::Counter32(0)),
            VarBind::new(oid("1.3.6.1.2.1.31.1.1.1.1.1"), text("eth0")),
        ];
        varbinds.extend(Self::storage(1, 2, "Physical memory", self.memory_used));
        varbinds.extend(Self::storage(31, 4, "/", self.disk_used));
        varbinds
    }
}

/// Agents keyed by address; unknown addresses never answer
#[derive(Default)]
pub struct FakeTransport {
    agents: Mutex<HashMap<IpAddr, Agent>>,
    walks: Mutex<HashMap<IpAddr, usize>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, ip: IpAddr, agent: Agent) {
        self.agents.lock().unwrap().insert(ip, agent);
    }

    pub fn update(&self, ip: IpAddr, f: impl FnOnce(&mut Agent)) {
        if let Some(agent) = self.agents.lock().unwrap().get_mut(&ip) {
            f(agent);
        }
    }

    pub fn walks(&self, ip: IpAddr) -> usize {
        self.walks.lock().unwrap().get(&ip).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SnmpTransport for FakeTransport {
    async fn walk(&self, target: &SnmpTarget, _columns: &[Oid]) -> Result<Vec<VarBind>, TransportError> {
        *self.walks.lock().unwrap().entry(target.ip).or_default() += 1;
        let agent = self.agents.lock().unwrap().get_mut(&target.ip).map(|agent| {
            agent.in_octets = agent.in_octets.wrapping_add(agent.traffic);
            agent.clone()
        });

        let community = match &target.credentials {
            SnmpCredentials::V1 { community } | SnmpCredentials::V2c { community } => {
                Some(community.as_str())
            }
            SnmpCredentials::V3 { .. } => None,
        };

        match agent {
            Some(agent) if agent.broken => Err(TransportError::Exception(
                "malformed response".to_string(),
            )),
            Some(agent) if agent.responding && community == Some(agent.community.as_str()) => {
                Ok(agent.varbinds())
            }
            // agents drop requests with a wrong community
            _ => {
                sleep(target.timeout + Duration::from_secs(1)).await;
                Err(TransportError::Timeout(target.timeout))
            }
        }
    }
}

/// Answers echo requests for reachable addresses after 5 ms
#[derive(Default)]
pub struct FakeProber {
    reachable: Mutex<HashSet<IpAddr>>,
}

impl FakeProber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_reachable(&self, ip: IpAddr, reachable: bool) {
        let mut addresses = self.reachable.lock().unwrap();
        if reachable {
            addresses.insert(ip);
        } else {
            addresses.remove(&ip);
        }
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
        let reachable = self.reachable.lock().unwrap().contains(&ip);
        if reachable {
            let rtt = Duration::from_millis(5);
            sleep(rtt).await;
            Ok(rtt)
        } else {
            sleep(timeout).await;
            Err(ProbeError::Timeout(timeout))
        }
    }
}

pub fn profile(community: &str) -> ProfileConfig {
    ProfileConfig {
        version: SnmpVersion::V2c,
        udp: 161,
        community: Some(community.to_string()),
        user: None,
        md5: None,
        sha: None,
        des: None,
    }
}

/// Configuration with a single `default` profile using community `public`
pub fn test_config() -> Config {
    let mut config = Config::default();
    config
        .profiles
        .insert("default".to_string(), profile("public"));
    config
}

/// Next event of `category`, skipping others
///
/// Panics when none arrives within `within`.
pub async fn next_event(
    events: &mut broadcast::Receiver<MonitorEvent>,
    category: EventCategory,
    within: Duration,
) -> MonitorEvent {
    tokio::time::timeout(within, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if event.category == category {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {category} event within {within:?}"))
}

/// Fleet over an in-memory backend
pub async fn start_fleet(
    config: Config,
    transport: Option<Arc<FakeTransport>>,
    prober: Arc<FakeProber>,
) -> Fleet {
    let transport = transport.map(|transport| transport as Arc<dyn SnmpTransport>);
    Fleet::start(config, Arc::new(MemoryBackend::new()), transport, prober).await
}
