//! Registration, admission and shutdown of the fleet

use std::time::Duration;

use assert_matches::assert_matches;
use fleetmon::config::{MonitorConfig, Protocol};
use fleetmon::{EventCategory, RegistrationError};
use pretty_assertions::assert_eq;

use crate::helpers::{
    Agent, FakeProber, FakeTransport, ip, next_event, profile, start_fleet, test_config,
};

const WAIT: Duration = Duration::from_secs(60);

#[tokio::test(start_paused = true)]
async fn test_register_and_deregister_icmp() {
    let prober = FakeProber::new();
    let target = ip("192.0.2.1");
    prober.set_reachable(target, true);

    let fleet = start_fleet(test_config(), None, prober).await;
    let mut events = fleet.subscribe();

    fleet.register_device(target, Protocol::Icmp, None).await.unwrap();

    let event = next_event(&mut events, EventCategory::Registration, WAIT).await;
    assert_eq!(event.message, "192.0.2.1 ICMP registered");
    assert!(event.is_positive);
    assert_eq!(fleet.monitor(target).map(|m| m.protocol), Some(Protocol::Icmp));

    let again = fleet.register_device(target, Protocol::Icmp, None).await;
    assert_eq!(again, Err(RegistrationError::AlreadyRegistered(target)));

    assert!(fleet.deregister_device(target).await);
    assert!(!fleet.deregister_device(target).await);
    assert_eq!(fleet.monitor(target), None);

    fleet.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_snmp_rejected_without_transport() {
    let fleet = start_fleet(test_config(), None, FakeProber::new()).await;
    let mut events = fleet.subscribe();

    let result = fleet
        .register_device(ip("10.0.0.1"), Protocol::Snmp, Some("default".to_string()))
        .await;
    assert_eq!(result, Err(RegistrationError::NoTransport));

    let event = next_event(&mut events, EventCategory::Registration, WAIT).await;
    assert!(!event.is_positive);
    assert!(event.message.starts_with("10.0.0.1 SNMP registration failed"));

    fleet.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_bad_registrations() {
    let fleet = start_fleet(test_config(), Some(FakeTransport::new()), FakeProber::new()).await;

    let unknown = fleet
        .register_device(ip("10.0.0.1"), Protocol::Snmp, Some("missing".to_string()))
        .await;
    assert_eq!(unknown, Err(RegistrationError::UnknownProfile("missing".to_string())));

    let unspecified = fleet
        .register_device(ip("0.0.0.0"), Protocol::Icmp, None)
        .await;
    assert_matches!(unspecified, Err(RegistrationError::InvalidAddress(_)));

    let multicast = fleet
        .register_device(ip("224.0.0.1"), Protocol::Icmp, None)
        .await;
    assert_matches!(multicast, Err(RegistrationError::InvalidAddress(_)));

    assert!(fleet.monitors().is_empty());
    fleet.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_invalid_profile_rejected() {
    let mut config = test_config();
    let mut broken = profile("public");
    broken.community = None;
    config.profiles.insert("broken".to_string(), broken);

    let fleet = start_fleet(config, Some(FakeTransport::new()), FakeProber::new()).await;
    let result = fleet
        .register_device(ip("10.0.0.1"), Protocol::Snmp, Some("broken".to_string()))
        .await;
    assert_matches!(result, Err(RegistrationError::InvalidProfile { name, .. }) if name == "broken");

    fleet.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_device_limit_counts_snmp_only() {
    let transport = FakeTransport::new();
    transport.add(ip("10.0.0.1"), Agent::new("core-1"));
    transport.add(ip("10.0.0.2"), Agent::new("core-2"));

    let mut config = test_config();
    config.engine.max_devices = 1;
    let fleet = start_fleet(config, Some(transport), FakeProber::new()).await;
    let mut events = fleet.subscribe();

    let default = Some("default".to_string());
    fleet
        .register_device(ip("10.0.0.1"), Protocol::Snmp, default.clone())
        .await
        .unwrap();
    let second = fleet
        .register_device(ip("10.0.0.2"), Protocol::Snmp, default)
        .await;
    assert_eq!(second, Err(RegistrationError::LimitExceeded(1)));

    let event = next_event(&mut events, EventCategory::System, WAIT).await;
    assert_eq!(event.message, "device limit 1 exceeded");
    assert_eq!(event.device_id, fleetmon::fleet::FLEET_ID);

    // ICMP devices do not count against the limit
    fleet
        .register_device(ip("192.0.2.1"), Protocol::Icmp, None)
        .await
        .unwrap();
    assert_eq!(fleet.monitors().len(), 2);

    fleet.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_snmp_registration_replaces_icmp() {
    let transport = FakeTransport::new();
    let target = ip("10.0.0.1");
    transport.add(target, Agent::new("core-1"));
    let prober = FakeProber::new();
    prober.set_reachable(target, true);

    let fleet = start_fleet(test_config(), Some(transport), prober).await;

    fleet.register_device(target, Protocol::Icmp, None).await.unwrap();
    fleet
        .register_device(target, Protocol::Snmp, Some("default".to_string()))
        .await
        .unwrap();

    let monitor = fleet.monitor(target).unwrap();
    assert_eq!(monitor.protocol, Protocol::Snmp);
    assert_eq!(monitor.profile.as_deref(), Some("default"));

    // but not the other way round
    let downgrade = fleet.register_device(target, Protocol::Icmp, None).await;
    assert_eq!(downgrade, Err(RegistrationError::AlreadyRegistered(target)));

    fleet.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_configured_monitors_restored() {
    let prober = FakeProber::new();
    let pinged = ip("192.0.2.10");
    prober.set_reachable(pinged, true);

    let mut config = test_config();
    config.monitors.insert(
        pinged,
        MonitorConfig {
            protocol: Protocol::Icmp,
            profile: None,
            shutdown: true,
            critical: false,
        },
    );
    config.monitors.insert(
        ip("10.0.0.9"),
        MonitorConfig {
            protocol: Protocol::Snmp,
            profile: Some("missing".to_string()),
            shutdown: false,
            critical: false,
        },
    );

    let fleet = start_fleet(config, Some(FakeTransport::new()), prober).await;
    let mut events = fleet.subscribe();

    // the broken entry is skipped, the other one keeps its stored state
    let monitors = fleet.monitors();
    assert_eq!(monitors.len(), 1);
    assert!(monitors[&pinged].shutdown);

    let event = next_event(&mut events, EventCategory::Shutdown, WAIT).await;
    assert_eq!(event.message, "192.0.2.10 ICMP responding");
    assert!(event.is_positive);
    assert!(event.is_transition);
    assert!(!fleet.monitor(pinged).unwrap().shutdown);

    fleet.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_test_address_tries_profiles_in_turn() {
    let transport = FakeTransport::new();
    let target = ip("10.0.0.1");
    transport.add(target, Agent::new("core-1"));

    let mut config = test_config();
    config.profiles.clear();
    config.profiles.insert("a-wrong".to_string(), profile("private"));
    config.profiles.insert("b-right".to_string(), profile("public"));

    let fleet = start_fleet(config, Some(transport.clone()), FakeProber::new()).await;

    fleet.test_address(target, Protocol::Snmp).await.unwrap();

    let monitor = fleet.monitor(target).unwrap();
    assert_eq!(monitor.profile.as_deref(), Some("b-right"));
    assert!(transport.walks(target) >= 2);

    let again = fleet.test_address(target, Protocol::Snmp).await;
    assert_eq!(again, Err(RegistrationError::AlreadyRegistered(target)));

    fleet.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_test_address_unreachable() {
    let fleet = start_fleet(test_config(), Some(FakeTransport::new()), FakeProber::new()).await;
    let mut events = fleet.subscribe();
    let target = ip("192.0.2.99");

    let icmp = fleet.test_address(target, Protocol::Icmp).await;
    assert_eq!(icmp, Err(RegistrationError::Unreachable(target)));

    let event = next_event(&mut events, EventCategory::Registration, WAIT).await;
    assert!(!event.is_positive);
    assert!(event.message.starts_with("192.0.2.99 ICMP registration failed"));

    let snmp = fleet.test_address(target, Protocol::Snmp).await;
    assert_eq!(snmp, Err(RegistrationError::Unreachable(target)));
    assert_eq!(fleet.monitor(target), None);

    fleet.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_close_stops_everything() {
    let transport = FakeTransport::new();
    let target = ip("10.0.0.1");
    transport.add(target, Agent::new("core-1"));

    let fleet = start_fleet(test_config(), Some(transport.clone()), FakeProber::new()).await;
    fleet
        .register_device(target, Protocol::Snmp, Some("default".to_string()))
        .await
        .unwrap();
    fleet
        .register_device(ip("192.0.2.1"), Protocol::Icmp, None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    fleet.close().await.unwrap();
    let walks = transport.walks(target);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.walks(target), walks);
    assert_eq!(fleet.get_node_data(target).await, None);

    // closing twice is harmless
    fleet.close().await.unwrap();
}
