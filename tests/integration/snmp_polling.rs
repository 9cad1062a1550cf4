//! SNMP sessions driven through the fleet

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;
use fleetmon::{EventCategory, Fleet};
use fleetmon::config::{MonitorConfig, Protocol, ThresholdConfig};
use fleetmon::monitors::{Resource, TopCategory};
use fleetmon::snmp::{NodeData, Table};
use fleetmon::storage::MetricKind;
use pretty_assertions::assert_eq;
use tokio::time::sleep;

use crate::helpers::{
    Agent, CPU_INDEX, FakeProber, FakeTransport, ip, next_event, start_fleet, test_config,
};

const WAIT: Duration = Duration::from_secs(120);

async fn wait_for_data(fleet: &Fleet, target: IpAddr) -> NodeData {
    for _ in 0..100 {
        if let Some(data) = fleet.get_node_data(target).await {
            return data;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("no data for {target}");
}

async fn register(fleet: &Fleet, target: IpAddr) {
    fleet
        .register_device(target, Protocol::Snmp, Some("default".to_string()))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_poll_produces_data_series_and_top() {
    let transport = FakeTransport::new();
    let target = ip("10.0.0.1");
    transport.add(target, Agent::new("core-1"));

    let fleet = start_fleet(test_config(), Some(transport), FakeProber::new()).await;
    register(&fleet, target).await;

    let data = wait_for_data(&fleet, target).await;
    assert_eq!(data.sys_name(), Some("core-1"));
    assert_eq!(data.failure, None);
    assert_eq!(data.row_count(Table::Processor), 1);
    assert_eq!(data.row_count(Table::Storage), 2);
    assert_eq!(data.row_count(Table::Interface), 1);

    assert!(fleet.resource_count() > 0);
    let now = Utc::now();
    let series = fleet
        .get_series(
            target,
            MetricKind::ProcessorLoad,
            CPU_INDEX,
            now - chrono::Duration::hours(1),
            now + chrono::Duration::hours(1),
            false,
        )
        .await;
    assert_eq!(series.len(), 1);

    let top = fleet.get_top(10);
    let processors = &top[&TopCategory::Processor];
    assert_eq!(processors.len(), 1);
    assert_eq!(processors[0].device, "10.0.0.1");
    assert_eq!(processors[0].value, 10);
    assert_eq!(fleet.get_failure_rate(target).await, Some(0));

    let summary = fleet.test_summary().await;
    let device = &summary[&target];
    assert_eq!(device.sys_object_id.as_deref(), Some("1.3.6.1.4.1.8072.3.2.10"));
    assert_eq!((device.processors, device.storages, device.interfaces), (1, 2, 1));

    fleet.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_flip_reachability() {
    let transport = FakeTransport::new();
    let target = ip("10.0.0.1");
    let mut agent = Agent::new("core-1");
    agent.responding = false;
    transport.add(target, agent);

    let fleet = start_fleet(test_config(), Some(transport.clone()), FakeProber::new()).await;
    let mut events = fleet.subscribe();
    register(&fleet, target).await;

    let down = next_event(&mut events, EventCategory::Shutdown, WAIT).await;
    assert_eq!(down.message, "10.0.0.1 not responding");
    assert!(!down.is_positive);
    assert!(fleet.monitor(target).unwrap().shutdown);
    assert_eq!(fleet.get_failure_rate(target).await, Some(100));

    transport.update(target, |agent| agent.responding = true);

    let up = next_event(&mut events, EventCategory::Shutdown, WAIT).await;
    assert_eq!(up.message, "10.0.0.1 [core-1] responding");
    assert!(up.is_positive);
    assert!(!fleet.monitor(target).unwrap().shutdown);

    let rate = fleet.get_failure_rate(target).await.unwrap();
    assert!(rate > 0 && rate < 100, "rate {rate}");

    assert!(fleet.reset_response(target).await);
    assert_eq!(fleet.get_failure_rate(target).await, Some(0));

    fleet.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exceptions_keep_the_schedule() {
    let transport = FakeTransport::new();
    let target = ip("10.0.0.1");
    let mut agent = Agent::new("core-1");
    agent.broken = true;
    transport.add(target, agent);

    let fleet = start_fleet(test_config(), Some(transport.clone()), FakeProber::new()).await;
    register(&fleet, target).await;

    // requests at 0, 10 and 20 seconds
    sleep(Duration::from_secs(25)).await;
    assert_eq!(transport.walks(target), 3);
    assert_eq!(fleet.get_failure_rate(target).await, Some(0));
    assert!(!fleet.monitor(target).unwrap().shutdown);

    fleet.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_critical_transitions_from_configured_thresholds() {
    let transport = FakeTransport::new();
    let target = ip("10.0.0.1");
    transport.add(target, Agent::new("core-1"));

    let mut config = test_config();
    let processors = BTreeMap::from([(
        "0".to_string(),
        ThresholdConfig {
            limit: 50,
            description: None,
        },
    )]);
    config
        .critical
        .insert(target, BTreeMap::from([(Resource::Processor, processors)]));
    config.monitors.insert(
        target,
        MonitorConfig {
            protocol: Protocol::Snmp,
            profile: Some("default".to_string()),
            shutdown: false,
            critical: false,
        },
    );

    let fleet = start_fleet(config, Some(transport.clone()), FakeProber::new()).await;
    let mut events = fleet.subscribe();
    wait_for_data(&fleet, target).await;

    transport.update(target, |agent| agent.cpu_load = 90);
    let critical = next_event(&mut events, EventCategory::Critical, WAIT).await;
    assert_eq!(
        critical.message,
        format!("10.0.0.1 [core-1] processor.{CPU_INDEX} 90% critical")
    );
    assert!(!critical.is_positive);
    assert!(fleet.monitor(target).unwrap().critical);

    transport.update(target, |agent| agent.cpu_load = 20);
    let normal = next_event(&mut events, EventCategory::Critical, WAIT).await;
    assert!(normal.message.ends_with("20% normal"));
    assert!(normal.is_positive);
    assert!(!fleet.monitor(target).unwrap().critical);

    fleet.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_bulk_thresholds_from_snapshot() {
    let transport = FakeTransport::new();
    let target = ip("10.0.0.1");
    transport.add(target, Agent::new("core-1"));

    let fleet = start_fleet(test_config(), Some(transport), FakeProber::new()).await;
    register(&fleet, target).await;
    wait_for_data(&fleet, target).await;

    // processor "0", memory "1", storage "31" and interface "1"
    assert_eq!(fleet.set_critical(None, None, 80, false).await, 4);
    assert_eq!(fleet.set_critical(Some(target), None, 90, false).await, 0);
    assert_eq!(
        fleet
            .set_critical(Some(target), Some(Resource::Storage), 90, true)
            .await,
        1
    );

    let thresholds = fleet.thresholds(target).unwrap();
    assert_eq!(thresholds[&Resource::Storage]["31"].limit, 90);
    assert_eq!(thresholds[&Resource::Memory]["1"].limit, 80);
    assert_eq!(
        thresholds[&Resource::Throughput]["1"].description.as_deref(),
        Some("eth0")
    );

    assert!(fleet.reset_critical(target, Some(Resource::Processor)));
    let thresholds = fleet.thresholds(target).unwrap();
    assert!(!thresholds.contains_key(&Resource::Processor));

    assert!(fleet.reset_critical(target, None));
    assert!(fleet.thresholds(target).unwrap().is_empty());
    assert!(!fleet.reset_critical(ip("10.9.9.9"), None));

    fleet.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_served_while_device_is_down() {
    let transport = FakeTransport::new();
    let target = ip("10.0.0.1");
    transport.add(target, Agent::new("core-1"));

    let fleet = start_fleet(test_config(), Some(transport.clone()), FakeProber::new()).await;
    register(&fleet, target).await;
    wait_for_data(&fleet, target).await;

    assert!(fleet.deregister_device(target).await);
    assert_eq!(fleet.get_top(10)[&TopCategory::Processor], vec![]);
    assert_eq!(fleet.get_node_data(target).await, None);

    transport.update(target, |agent| agent.responding = false);
    register(&fleet, target).await;

    let data = fleet.get_node_data(target).await.unwrap();
    assert_eq!(data.failure, Some(100));
    assert_eq!(data.sys_name(), Some("core-1"));

    fleet.close().await.unwrap();
}

/// Percentage and bits per second of the device's throughput rate entry
fn throughput_rate(fleet: &Fleet) -> Option<(i64, i64)> {
    fleet.get_top(10)[&TopCategory::ThroughputRate]
        .first()
        .map(|entry| (entry.value, entry.rate))
}

#[tokio::test]
async fn test_speed_override_sets_capacity() {
    const IF_SPEED: i64 = 100_000_000;
    const OVERRIDE: i64 = 1_000_000_000;

    let transport = FakeTransport::new();
    let target = ip("10.0.0.1");
    let mut agent = Agent::new("core-1");
    agent.traffic = 1_000_000;
    transport.add(target, agent);

    let mut config = test_config();
    config.engine.request_interval_ms = 100;

    let fleet = start_fleet(config, Some(transport), FakeProber::new()).await;
    register(&fleet, target).await;

    // ifSpeed is the capacity until overridden
    let mut ranked = None;
    for _ in 0..100 {
        ranked = throughput_rate(&fleet);
        if ranked.is_some() {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    let (percent, bps) = ranked.expect("no throughput ranked");
    assert!(bps > 0);
    assert_eq!(percent, bps * 100 / IF_SPEED);

    fleet
        .set_speeds(target, BTreeMap::from([("1".to_string(), OVERRIDE as u64)]))
        .await;

    let mut overridden = false;
    for _ in 0..100 {
        sleep(Duration::from_millis(50)).await;
        let Some((percent, bps)) = throughput_rate(&fleet) else {
            continue;
        };
        if percent == bps * 100 / OVERRIDE && percent != bps * 100 / IF_SPEED {
            overridden = true;
            break;
        }
    }
    assert!(overridden, "throughput never ranked against the override");
    assert!(fleet.device_load(target).is_some());

    fleet.close().await.unwrap();
}
