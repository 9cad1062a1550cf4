//! Fleet coordinator
//!
//! Owns every session, the state shared between them and the event channel.
//! Sessions report back through a listener holding a weak reference, so a
//! dropped fleet stops them instead of being kept alive by them.
//!
//! Scheduling follows the poll outcome: an answered or failed (exception)
//! request is repeated after the request interval, a timed out one right
//! away.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::actors::messages::{EventCategory, MonitorEvent, PollOutcome, PollReport};
use crate::actors::ping::{PingHandle, PingListener};
use crate::actors::poll::{PollContext, PollHandle, PollListener, trial_poll};
use crate::config::{Config, CriticalConfig, EngineConfig, MonitorConfig, ProfileConfig, Protocol};
use crate::icmp::Prober;
use crate::monitors::critical::{
    ALL_PROCESSORS, CriticalDetector, CriticalTransition, Resource, ThresholdRegistry,
};
use crate::monitors::derivation::Deriver;
use crate::monitors::top::{TopCategory, TopEntry, TopTable};
use crate::snmp::oid::{
    HR_STORAGE_DESCR, HR_STORAGE_TYPE, IF_ALIAS, IF_NAME, STORAGE_TYPE_FIXED_DISK,
    STORAGE_TYPE_RAM, Table,
};
use crate::snmp::snapshot::{NodeData, Row};
use crate::snmp::transport::{SnmpTarget, SnmpTransport};
use crate::storage::backend::StorageBackend;
use crate::storage::schema::{MetricKind, SeriesData, SeriesKey, SnapshotRow};
use crate::storage::series::SeriesStore;

const EVENT_CAPACITY: usize = 256;
const RETENTION_PERIOD: Duration = Duration::from_secs(3600);
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
const FALLBACK_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Device id of events concerning the whole fleet
pub const FLEET_ID: &str = "fleet";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("{0} is already registered")]
    AlreadyRegistered(IpAddr),

    #[error("device limit of {0} reached")]
    LimitExceeded(usize),

    #[error("unknown profile {0:?}")]
    UnknownProfile(String),

    #[error("invalid profile {name}: {reason}")]
    InvalidProfile { name: String, reason: String },

    #[error("{0} cannot be monitored")]
    InvalidAddress(IpAddr),

    #[error("no SNMP transport available")]
    NoTransport,

    #[error("{0} did not answer")]
    Unreachable(IpAddr),
}

/// Table sizes of one SNMP device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    #[serde(rename = "sysObjectID")]
    pub sys_object_id: Option<String>,
    pub processors: usize,
    pub storages: usize,
    pub interfaces: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn label(ip: IpAddr, sys_name: Option<&str>) -> String {
    match sys_name {
        Some(name) => format!("{ip} [{name}]"),
        None => ip.to_string(),
    }
}

fn target(
    ip: IpAddr,
    name: &str,
    profile: &ProfileConfig,
    timeout: Duration,
) -> Result<SnmpTarget, RegistrationError> {
    let credentials = profile
        .credentials()
        .map_err(|e| RegistrationError::InvalidProfile {
            name: name.to_string(),
            reason: format!("{e:#}"),
        })?;

    Ok(SnmpTarget {
        ip,
        udp: profile.udp,
        credentials,
        timeout,
    })
}

fn storage_type(row: &Row) -> Option<u32> {
    row.get_u64(HR_STORAGE_TYPE)
        .ok()
        .and_then(|kind| u32::try_from(kind).ok())
}

fn non_empty(row: &Row, field: &'static str) -> Option<String> {
    row.get_str(field)
        .ok()
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Set `limit` on every index of `resource` found in `data`
///
/// Returns the number of thresholds set.
fn apply_limit(
    detector: &mut CriticalDetector,
    data: &NodeData,
    resource: Resource,
    limit: u8,
    overwrite: bool,
) -> usize {
    let candidates: Vec<(String, Option<String>)> = match resource {
        Resource::Processor if data.row_count(Table::Processor) > 0 => {
            vec![(ALL_PROCESSORS.to_string(), None)]
        }
        Resource::Processor => Vec::new(),
        Resource::Memory | Resource::Storage => {
            let wanted = if resource == Resource::Memory {
                STORAGE_TYPE_RAM
            } else {
                STORAGE_TYPE_FIXED_DISK
            };
            data.table(Table::Storage)
                .into_iter()
                .flatten()
                .filter(|(_, row)| storage_type(row) == Some(wanted))
                .map(|(index, row)| (index.clone(), non_empty(row, HR_STORAGE_DESCR)))
                .collect()
        }
        Resource::Throughput => data
            .table(Table::Interface)
            .into_iter()
            .flatten()
            .map(|(index, row)| {
                let name = non_empty(row, IF_NAME).or_else(|| non_empty(row, IF_ALIAS));
                (index.clone(), name)
            })
            .collect(),
    };

    let mut applied = 0;
    for (index, description) in candidates {
        if detector.set(resource, &index, limit, description, overwrite) {
            applied += 1;
        }
    }
    applied
}

enum Session {
    Snmp {
        handle: PollHandle,
        task: JoinHandle<()>,
    },
    Icmp {
        handle: PingHandle,
        task: JoinHandle<()>,
    },
}

impl Session {
    fn is_snmp(&self) -> bool {
        matches!(self, Session::Snmp { .. })
    }

    /// Ask the session to stop; does not wait for it
    async fn stop(self) -> JoinHandle<()> {
        let result = match &self {
            Session::Snmp { handle, .. } => handle.shutdown().await,
            Session::Icmp { handle, .. } => handle.shutdown().await,
        };
        if let Err(e) = result {
            trace!("session already stopped: {e:#}");
        }

        match self {
            Session::Snmp { task, .. } | Session::Icmp { task, .. } => task,
        }
    }
}

struct FleetInner {
    engine: EngineConfig,
    profiles: BTreeMap<String, ProfileConfig>,
    monitors: Mutex<BTreeMap<IpAddr, MonitorConfig>>,
    speeds: Mutex<BTreeMap<IpAddr, BTreeMap<String, u64>>>,
    sessions: Mutex<HashMap<IpAddr, Session>>,
    store: Arc<SeriesStore>,
    thresholds: Arc<ThresholdRegistry>,
    top: Arc<TopTable>,
    deriver: Arc<Deriver>,
    transport: Option<Arc<dyn SnmpTransport>>,
    prober: Arc<dyn Prober>,
    events: broadcast::Sender<MonitorEvent>,
    background: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Session listener; stops sessions once the fleet is gone
struct Listener(Weak<FleetInner>);

#[async_trait]
impl PollListener for Listener {
    async fn on_poll(&self, device: &str, report: PollReport) -> Option<Duration> {
        let inner = self.0.upgrade()?;
        inner.on_poll(device, report).await
    }
}

#[async_trait]
impl PingListener for Listener {
    async fn on_success(&self, ip: IpAddr, rtt: Duration) {
        trace!("{ip}: echo reply after {rtt:?}");
        if let Some(inner) = self.0.upgrade() {
            inner.on_ping(ip, true);
        }
    }

    async fn on_failure(&self, ip: IpAddr) {
        if let Some(inner) = self.0.upgrade() {
            inner.on_ping(ip, false);
        }
    }
}

impl FleetInner {
    fn publish(&self, event: MonitorEvent) {
        if self.events.send(event).is_err() {
            trace!("no event subscribers");
        }
    }

    fn is_registered(&self, ip: IpAddr, protocol: Protocol) -> bool {
        match lock(&self.sessions).get(&ip) {
            Some(session) => session.is_snmp() == (protocol == Protocol::Snmp),
            None => false,
        }
    }

    /// Validate and spawn a session for `monitor`
    ///
    /// Returns an ICMP session the new SNMP session replaces; the caller
    /// stops it.
    fn spawn_session(
        self: &Arc<Self>,
        ip: IpAddr,
        monitor: &MonitorConfig,
        critical: Option<&CriticalConfig>,
    ) -> Result<Option<Session>, RegistrationError> {
        if ip.is_unspecified() || ip.is_multicast() {
            return Err(RegistrationError::InvalidAddress(ip));
        }

        let listener = Arc::new(Listener(Arc::downgrade(self)));
        let mut sessions = lock(&self.sessions);

        match monitor.protocol {
            Protocol::Icmp => {
                if sessions.contains_key(&ip) {
                    return Err(RegistrationError::AlreadyRegistered(ip));
                }

                lock(&self.monitors).insert(ip, monitor.clone());
                let (handle, task) = PingHandle::spawn(
                    ip,
                    self.prober.clone(),
                    listener,
                    self.engine.ping_timeouts(),
                    self.engine.ping_success_delay(),
                );
                sessions.insert(ip, Session::Icmp { handle, task });
                Ok(None)
            }

            Protocol::Snmp => {
                if sessions.get(&ip).is_some_and(Session::is_snmp) {
                    return Err(RegistrationError::AlreadyRegistered(ip));
                }

                let name = monitor.profile.clone().unwrap_or_default();
                let profile = self
                    .profiles
                    .get(&name)
                    .ok_or_else(|| RegistrationError::UnknownProfile(name.clone()))?;
                let target = target(ip, &name, profile, self.engine.snmp_timeout())?;
                let transport = self
                    .transport
                    .clone()
                    .ok_or(RegistrationError::NoTransport)?;

                let limit = self.engine.max_devices;
                let count = sessions.values().filter(|session| session.is_snmp()).count();
                if limit > 0 && count >= limit {
                    warn!("device limit {limit} reached, rejecting {ip}");
                    self.publish(MonitorEvent::new(
                        FLEET_ID,
                        EventCategory::System,
                        format!("device limit {limit} exceeded"),
                        false,
                        true,
                    ));
                    return Err(RegistrationError::LimitExceeded(limit));
                }

                let replaced = sessions.remove(&ip);
                if replaced.is_some() {
                    debug!("{ip}: SNMP session replaces ICMP session");
                }

                let device = ip.to_string();
                let detector = critical
                    .map(CriticalDetector::from_config)
                    .unwrap_or_default();
                self.thresholds.insert(&device, detector);
                self.top.admit(&device);
                lock(&self.monitors).insert(ip, monitor.clone());

                let context = PollContext {
                    transport,
                    deriver: self.deriver.clone(),
                    listener,
                    speeds: lock(&self.speeds).get(&ip).cloned().unwrap_or_default(),
                    failure_window: self.engine.failure_window,
                };
                let (handle, task) = PollHandle::spawn(target, context);
                sessions.insert(ip, Session::Snmp { handle, task });
                Ok(replaced)
            }
        }
    }

    async fn register(
        self: &Arc<Self>,
        ip: IpAddr,
        monitor: MonitorConfig,
        critical: Option<&CriticalConfig>,
    ) -> Result<(), RegistrationError> {
        if let Some(replaced) = self.spawn_session(ip, &monitor, critical)? {
            drop(replaced.stop().await);
        }
        debug!("{ip}: {} session started", monitor.protocol);
        Ok(())
    }

    fn report_registration(
        &self,
        ip: IpAddr,
        protocol: Protocol,
        result: &Result<(), RegistrationError>,
    ) {
        let protocol = protocol.to_string().to_uppercase();
        let event = match result {
            Ok(()) => {
                info!("{ip}: {protocol} registered");
                MonitorEvent::new(
                    ip.to_string(),
                    EventCategory::Registration,
                    format!("{ip} {protocol} registered"),
                    true,
                    false,
                )
            }
            Err(e) => {
                warn!("{ip}: {protocol} registration failed: {e}");
                MonitorEvent::new(
                    ip.to_string(),
                    EventCategory::Registration,
                    format!("{ip} {protocol} registration failed: {e}"),
                    false,
                    false,
                )
            }
        };
        self.publish(event);
    }

    /// Record reachability; publishes an event only when the flag flips
    fn set_shutdown(&self, ip: IpAddr, shutdown: bool, label: &str) {
        let flipped = match lock(&self.monitors).get_mut(&ip) {
            Some(monitor) if monitor.shutdown != shutdown => {
                monitor.shutdown = shutdown;
                true
            }
            _ => false,
        };
        if !flipped {
            return;
        }

        let message = if shutdown {
            warn!("{label} not responding");
            format!("{label} not responding")
        } else {
            info!("{label} responding");
            format!("{label} responding")
        };
        self.publish(MonitorEvent::new(
            ip.to_string(),
            EventCategory::Shutdown,
            message,
            !shutdown,
            true,
        ));
    }

    fn on_critical(&self, ip: IpAddr, transition: &CriticalTransition, sys_name: Option<&str>) {
        let device = ip.to_string();
        let critical = self.thresholds.is_critical(&device);
        if let Some(monitor) = lock(&self.monitors).get_mut(&ip) {
            monitor.critical = critical;
        }

        let message = match &transition.description {
            Some(description) => format!("{} {transition} ({description})", label(ip, sys_name)),
            None => format!("{} {transition}", label(ip, sys_name)),
        };
        if transition.critical {
            warn!("{message}");
        } else {
            info!("{message}");
        }

        self.publish(MonitorEvent::new(
            device,
            EventCategory::Critical,
            message,
            !transition.critical,
            true,
        ));
    }

    async fn save_snapshot(&self, device: &str, data: &NodeData) {
        let json = match serde_json::to_string(data) {
            Ok(json) => json,
            Err(e) => {
                error!("{device}: failed to encode snapshot: {e}");
                return;
            }
        };

        let row = SnapshotRow {
            device: device.to_string(),
            taken_at: data.timestamp,
            data: json,
        };
        if let Err(e) = self.store.save_snapshot(row).await {
            error!("{device}: failed to save snapshot: {e}");
        }
    }

    async fn on_poll(&self, device: &str, report: PollReport) -> Option<Duration> {
        let ip: IpAddr = device.parse().ok()?;
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        if !self.is_registered(ip, Protocol::Snmp) {
            trace!("{device}: poll finished after removal");
            self.store.purge_device(device);
            return None;
        }

        let PollReport {
            outcome,
            data,
            transitions,
            sys_name,
            ..
        } = report;
        let name = sys_name.as_deref();

        match outcome {
            PollOutcome::Success { .. } => {
                self.set_shutdown(ip, false, &label(ip, name));
                for transition in &transitions {
                    self.on_critical(ip, transition, name);
                }
                if let Some(data) = data {
                    self.save_snapshot(device, &data).await;
                }
                Some(self.engine.request_interval())
            }
            PollOutcome::Timeout => {
                self.set_shutdown(ip, true, &label(ip, name));
                Some(Duration::ZERO)
            }
            PollOutcome::Exception(_) => Some(self.engine.request_interval()),
        }
    }

    fn on_ping(&self, ip: IpAddr, success: bool) {
        if !self.is_registered(ip, Protocol::Icmp) {
            return;
        }
        self.set_shutdown(ip, !success, &format!("{ip} ICMP"));
    }
}

fn spawn_flush(store: Arc<SeriesStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period.max(MIN_FLUSH_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = store.flush().await {
                trace!("flush failed: {e}");
            }
        }
    })
}

fn spawn_retention(store: Arc<SeriesStore>, retention_days: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(RETENTION_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match store.cleanup(retention_days).await {
                Ok(0) => {}
                Ok(deleted) => info!("deleted {deleted} points older than {retention_days} days"),
                Err(e) => error!("retention cleanup failed: {e}"),
            }
        }
    })
}

/// The running monitoring engine
#[derive(Clone)]
pub struct Fleet {
    inner: Arc<FleetInner>,
}

impl Fleet {
    /// Start the engine and a session for every configured monitor
    ///
    /// Monitors that cannot be started are logged and skipped.
    pub async fn start(
        config: Config,
        backend: Arc<dyn StorageBackend>,
        transport: Option<Arc<dyn SnmpTransport>>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let Config {
            profiles,
            monitors,
            critical,
            interfaces,
            engine,
            storage,
        } = config;

        let store = Arc::new(SeriesStore::new(engine.rolling_interval_ms, backend));
        let thresholds = Arc::new(ThresholdRegistry::new());
        let top = Arc::new(TopTable::new(engine.top_capacity));
        let deriver = Arc::new(Deriver::new(
            store.clone(),
            thresholds.clone(),
            top.clone(),
        ));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mut background = vec![spawn_flush(store.clone(), engine.flush_interval())];
        if let Some(days) = storage.as_ref().and_then(|storage| storage.retention_days()) {
            background.push(spawn_retention(store.clone(), days));
        }

        let fleet = Self {
            inner: Arc::new(FleetInner {
                engine,
                profiles,
                monitors: Mutex::new(BTreeMap::new()),
                speeds: Mutex::new(interfaces),
                sessions: Mutex::new(HashMap::new()),
                store,
                thresholds,
                top,
                deriver,
                transport,
                prober,
                events,
                background: Mutex::new(background),
                closed: AtomicBool::new(false),
            }),
        };

        for (ip, monitor) in monitors {
            let protocol = monitor.protocol;
            if let Err(e) = fleet.inner.register(ip, monitor, critical.get(&ip)).await {
                warn!("{ip}: skipping {protocol} monitor: {e}");
            }
        }

        info!("fleet started with {} sessions", lock(&fleet.inner.sessions).len());
        fleet
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.events.subscribe()
    }

    fn poll_handle(&self, ip: IpAddr) -> Option<PollHandle> {
        match lock(&self.inner.sessions).get(&ip) {
            Some(Session::Snmp { handle, .. }) => Some(handle.clone()),
            _ => None,
        }
    }

    fn poll_handles(&self, target: Option<IpAddr>) -> Vec<PollHandle> {
        lock(&self.inner.sessions)
            .iter()
            .filter(|(ip, _)| target.is_none_or(|target| target == **ip))
            .filter_map(|(_, session)| match session {
                Session::Snmp { handle, .. } => Some(handle.clone()),
                Session::Icmp { .. } => None,
            })
            .collect()
    }

    /// Register a device and start monitoring it
    #[instrument(skip(self))]
    pub async fn register_device(
        &self,
        ip: IpAddr,
        protocol: Protocol,
        profile: Option<String>,
    ) -> Result<(), RegistrationError> {
        let monitor = MonitorConfig {
            protocol,
            profile,
            shutdown: false,
            critical: false,
        };

        let result = self.inner.register(ip, monitor, None).await;
        self.inner.report_registration(ip, protocol, &result);
        result
    }

    /// Stop monitoring a device and drop its state
    ///
    /// Persisted series stay until retention removes them. Returns `false`
    /// for unknown devices.
    #[instrument(skip(self))]
    pub async fn deregister_device(&self, ip: IpAddr) -> bool {
        let Some(session) = lock(&self.inner.sessions).remove(&ip) else {
            return false;
        };
        drop(session.stop().await);

        let device = ip.to_string();
        self.inner.thresholds.remove(&device);
        self.inner.top.remove(&device);
        self.inner.store.purge_device(&device);
        lock(&self.inner.monitors).remove(&ip);

        info!("{ip}: deregistered");
        true
    }

    /// Probe `ip` and register it if it answers
    ///
    /// ICMP probes once with the first ping timeout. SNMP tries every
    /// profile in turn and registers with the first one that answers.
    #[instrument(skip(self))]
    pub async fn test_address(&self, ip: IpAddr, protocol: Protocol) -> Result<(), RegistrationError> {
        let result = match protocol {
            Protocol::Icmp => self.test_icmp(ip).await,
            Protocol::Snmp => self.test_snmp(ip).await,
        };
        self.inner.report_registration(ip, protocol, &result);
        result
    }

    async fn test_icmp(&self, ip: IpAddr) -> Result<(), RegistrationError> {
        if lock(&self.inner.sessions).contains_key(&ip) {
            return Err(RegistrationError::AlreadyRegistered(ip));
        }

        let limit = self
            .inner
            .engine
            .ping_timeouts()
            .first()
            .copied()
            .unwrap_or(FALLBACK_PROBE_TIMEOUT);
        match tokio::time::timeout(limit, self.inner.prober.probe(ip, limit)).await {
            Ok(Ok(rtt)) => debug!("{ip}: echo reply after {rtt:?}"),
            Ok(Err(e)) => {
                debug!("{ip}: {e}");
                return Err(RegistrationError::Unreachable(ip));
            }
            Err(_) => return Err(RegistrationError::Unreachable(ip)),
        }

        let monitor = MonitorConfig {
            protocol: Protocol::Icmp,
            profile: None,
            shutdown: false,
            critical: false,
        };
        self.inner.register(ip, monitor, None).await
    }

    async fn test_snmp(&self, ip: IpAddr) -> Result<(), RegistrationError> {
        if self.inner.is_registered(ip, Protocol::Snmp) {
            return Err(RegistrationError::AlreadyRegistered(ip));
        }
        let transport = self
            .inner
            .transport
            .clone()
            .ok_or(RegistrationError::NoTransport)?;

        for (name, profile) in &self.inner.profiles {
            let target = match target(ip, name, profile, self.inner.engine.snmp_timeout()) {
                Ok(target) => target,
                Err(e) => {
                    warn!("{e}");
                    continue;
                }
            };

            match trial_poll(transport.as_ref(), &target).await {
                Ok(data) => {
                    debug!("{ip}: answered with profile {name} as {:?}", data.sys_name());
                    let monitor = MonitorConfig {
                        protocol: Protocol::Snmp,
                        profile: Some(name.clone()),
                        shutdown: false,
                        critical: false,
                    };
                    return self.inner.register(ip, monitor, None).await;
                }
                Err(e) => trace!("{ip}: profile {name}: {e}"),
            }
        }

        Err(RegistrationError::Unreachable(ip))
    }

    /// Latest snapshot of an SNMP device
    ///
    /// Without live data the persisted snapshot is returned with `failure`
    /// set to 100.
    pub async fn get_node_data(&self, ip: IpAddr) -> Option<NodeData> {
        let handle = self.poll_handle(ip)?;
        match handle.data().await {
            Ok(Some(data)) => return Some(data),
            Ok(None) => trace!("{ip}: no live data yet"),
            Err(e) => debug!("{ip}: session unavailable: {e:#}"),
        }

        let row = match self.inner.store.load_snapshot(&ip.to_string()).await {
            Ok(row) => row?,
            Err(e) => {
                warn!("{ip}: failed to load snapshot: {e}");
                return None;
            }
        };

        match serde_json::from_str::<NodeData>(&row.data) {
            Ok(mut data) => {
                data.failure = Some(100);
                Some(data)
            }
            Err(e) => {
                warn!("{ip}: discarding unreadable snapshot: {e}");
                None
            }
        }
    }

    pub async fn get_series(
        &self,
        ip: IpAddr,
        kind: MetricKind,
        index: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        summarize: bool,
    ) -> SeriesData {
        let key = SeriesKey::new(ip.to_string(), kind, index);
        self.inner.store.get_data(&key, start, end, summarize).await
    }

    pub fn get_top(&self, count: usize) -> BTreeMap<TopCategory, Vec<TopEntry>> {
        self.inner.top.get_top(count)
    }

    pub async fn get_failure_rate(&self, ip: IpAddr) -> Option<u32> {
        self.poll_handle(ip)?.failure_rate().await.ok()
    }

    /// Fleet-wide average series load in percent
    pub fn get_load(&self) -> f64 {
        self.inner.store.fleet_load()
    }

    pub fn device_load(&self, ip: IpAddr) -> Option<f64> {
        self.inner.store.device_load(&ip.to_string())
    }

    /// Apply `limit` to every index of `resource` (or of all resources)
    ///
    /// Indices come from each device's latest snapshot; devices without one
    /// are skipped. Without `target` every SNMP device is updated. Returns
    /// the number of thresholds set.
    #[instrument(skip(self))]
    pub async fn set_critical(
        &self,
        target: Option<IpAddr>,
        resource: Option<Resource>,
        limit: u8,
        overwrite: bool,
    ) -> usize {
        let resources = resource.map_or_else(|| Resource::ALL.to_vec(), |resource| vec![resource]);

        let mut applied = 0;
        for handle in self.poll_handles(target) {
            let Ok(Some(data)) = handle.data().await else {
                debug!("{}: no snapshot to take indices from", handle.device);
                continue;
            };

            applied += self
                .inner
                .thresholds
                .with(&handle.device, |detector| {
                    resources
                        .iter()
                        .map(|resource| apply_limit(detector, &data, *resource, limit, overwrite))
                        .sum::<usize>()
                })
                .unwrap_or(0);
        }

        debug!("{applied} thresholds set");
        applied
    }

    /// Drop thresholds of one resource, or of all of them
    pub fn reset_critical(&self, ip: IpAddr, resource: Option<Resource>) -> bool {
        let device = ip.to_string();
        let cleared = self
            .inner
            .thresholds
            .with(&device, |detector| detector.clear(resource))
            .is_some();

        if cleared {
            let critical = self.inner.thresholds.is_critical(&device);
            if let Some(monitor) = lock(&self.inner.monitors).get_mut(&ip) {
                monitor.critical = critical;
            }
        }
        cleared
    }

    pub fn thresholds(&self, ip: IpAddr) -> Option<CriticalConfig> {
        self.inner
            .thresholds
            .with(&ip.to_string(), |detector| detector.to_config())
    }

    /// Forget the failure history of an SNMP device
    pub async fn reset_response(&self, ip: IpAddr) -> bool {
        match self.poll_handle(ip) {
            Some(handle) => handle.reset_response().await.is_ok(),
            None => false,
        }
    }

    /// Replace the per-ifIndex capacity overrides of a device
    pub async fn set_speeds(&self, ip: IpAddr, speeds: BTreeMap<String, u64>) {
        lock(&self.inner.speeds).insert(ip, speeds.clone());
        if let Some(handle) = self.poll_handle(ip) {
            if let Err(e) = handle.set_speeds(speeds).await {
                debug!("{ip}: {e:#}");
            }
        }
    }

    /// Number of live series
    pub fn resource_count(&self) -> usize {
        self.inner.store.resource_count()
    }

    /// Table sizes of every SNMP device with data
    pub async fn test_summary(&self) -> BTreeMap<IpAddr, DeviceSummary> {
        let mut summary = BTreeMap::new();
        for handle in self.poll_handles(None) {
            let Ok(Some(data)) = handle.data().await else {
                continue;
            };
            let Ok(ip) = handle.device.parse::<IpAddr>() else {
                continue;
            };

            summary.insert(
                ip,
                DeviceSummary {
                    sys_object_id: data.sys_object_id().map(str::to_string),
                    processors: data.row_count(Table::Processor),
                    storages: data.row_count(Table::Storage),
                    interfaces: data.row_count(Table::Interface),
                },
            );
        }
        summary
    }

    pub fn monitor(&self, ip: IpAddr) -> Option<MonitorConfig> {
        lock(&self.inner.monitors).get(&ip).cloned()
    }

    pub fn monitors(&self) -> BTreeMap<IpAddr, MonitorConfig> {
        lock(&self.inner.monitors).clone()
    }

    pub async fn storage_stats(&self) -> anyhow::Result<String> {
        self.inner
            .store
            .stats()
            .await
            .context("failed to read storage statistics")
    }

    /// Stop every session and close storage
    ///
    /// Sessions get the shutdown grace period to finish; storage is flushed
    /// and closed afterwards either way.
    #[instrument(skip(self))]
    pub async fn close(&self) -> anyhow::Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing fleet");

        let sessions: Vec<Session> = lock(&self.inner.sessions)
            .drain()
            .map(|(_, session)| session)
            .collect();
        let mut tasks = Vec::with_capacity(sessions.len());
        for session in sessions {
            tasks.push(session.stop().await);
        }

        for task in lock(&self.inner.background).drain(..) {
            task.abort();
        }

        let grace = self.inner.engine.shutdown_grace();
        if tokio::time::timeout(grace, join_all(tasks)).await.is_err() {
            warn!("sessions still running after {grace:?}");
        }

        self.inner
            .store
            .close()
            .await
            .context("failed to close storage")?;

        info!("fleet closed");
        Ok(())
    }
}
