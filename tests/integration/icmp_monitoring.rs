//! ICMP sessions driven through the fleet

use std::time::Duration;

use fleetmon::EventCategory;
use fleetmon::config::Protocol;
use pretty_assertions::assert_eq;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::sleep;

use crate::helpers::{FakeProber, ip, next_event, start_fleet, test_config};

#[tokio::test(start_paused = true)]
async fn test_unreachable_then_recovered() {
    let prober = FakeProber::new();
    let target = ip("192.0.2.1");

    let fleet = start_fleet(test_config(), None, prober.clone()).await;
    let mut events = fleet.subscribe();
    fleet.register_device(target, Protocol::Icmp, None).await.unwrap();

    // all three attempts time out: 2 + 3 + 5 seconds
    let down = next_event(&mut events, EventCategory::Shutdown, Duration::from_secs(11)).await;
    assert_eq!(down.message, "192.0.2.1 ICMP not responding");
    assert!(!down.is_positive);
    assert!(fleet.monitor(target).unwrap().shutdown);

    prober.set_reachable(target, true);
    let up = next_event(&mut events, EventCategory::Shutdown, Duration::from_secs(30)).await;
    assert_eq!(up.message, "192.0.2.1 ICMP responding");
    assert!(up.is_positive);
    assert!(!fleet.monitor(target).unwrap().shutdown);

    fleet.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_steady_state_is_quiet() {
    let prober = FakeProber::new();
    let target = ip("192.0.2.2");
    prober.set_reachable(target, true);

    let fleet = start_fleet(test_config(), None, prober).await;
    fleet.register_device(target, Protocol::Icmp, None).await.unwrap();
    let mut events = fleet.subscribe();

    sleep(Duration::from_secs(30)).await;
    assert_eq!(events.try_recv().unwrap_err(), TryRecvError::Empty);
    assert!(!fleet.monitor(target).unwrap().shutdown);

    fleet.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_deregistered_device_stops_reporting() {
    let prober = FakeProber::new();
    let target = ip("192.0.2.3");

    let fleet = start_fleet(test_config(), None, prober).await;
    fleet.register_device(target, Protocol::Icmp, None).await.unwrap();
    let mut events = fleet.subscribe();

    sleep(Duration::from_secs(3)).await;
    assert!(fleet.deregister_device(target).await);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(events.try_recv().unwrap_err(), TryRecvError::Empty);

    fleet.close().await.unwrap();
}
