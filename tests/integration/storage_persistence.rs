//! Series and snapshots surviving a restart on the SQLite backend

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetmon::Fleet;
use fleetmon::config::Protocol;
use fleetmon::snmp::SnmpTransport;
use fleetmon::storage::StorageBackend;
use fleetmon::storage::backend::QueryRange;
use fleetmon::storage::schema::{MetricKind, SeriesKey};
use fleetmon::storage::sqlite::SqliteBackend;
use tempfile::tempdir;
use tokio::time::sleep;

use crate::helpers::{Agent, CPU_INDEX, FakeProber, FakeTransport, ip, test_config};

#[tokio::test]
async fn test_history_and_snapshot_survive_restart() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("fleet.db");

    let target = ip("10.0.0.1");
    let transport = FakeTransport::new();
    transport.add(target, Agent::new("core-1"));

    let mut config = test_config();
    config.engine.snmp_timeout_ms = 200;

    let backend = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
    let fleet = Fleet::start(
        config.clone(),
        backend,
        Some(transport.clone() as Arc<dyn SnmpTransport>),
        FakeProber::new(),
    )
    .await;
    fleet
        .register_device(target, Protocol::Snmp, Some("default".to_string()))
        .await
        .unwrap();

    let mut polled = false;
    for _ in 0..50 {
        if fleet.get_node_data(target).await.is_some() {
            polled = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(polled, "first poll never completed");

    // closing flushes the queued points
    fleet.close().await.unwrap();

    let backend = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
    let now = Utc::now();
    let points = backend
        .query_range(QueryRange {
            key: SeriesKey::new("10.0.0.1", MetricKind::ProcessorLoad, CPU_INDEX),
            start: now - chrono::Duration::hours(1),
            end: now + chrono::Duration::hours(1),
        })
        .await
        .unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].value, 10);
    assert!(backend.load_snapshot("10.0.0.1").await.unwrap().is_some());

    // restarted while the device is down: the stored snapshot is served
    transport.update(target, |agent| agent.responding = false);
    let fleet = Fleet::start(
        config,
        backend,
        Some(transport as Arc<dyn SnmpTransport>),
        FakeProber::new(),
    )
    .await;
    fleet
        .register_device(target, Protocol::Snmp, Some("default".to_string()))
        .await
        .unwrap();

    let data = fleet.get_node_data(target).await.unwrap();
    assert_eq!(data.failure, Some(100));
    assert_eq!(data.sys_name(), Some("core-1"));

    fleet.close().await.unwrap();
}

#[tokio::test]
async fn test_storage_stats_reported() {
    let temp_dir = tempdir().unwrap();
    let backend = Arc::new(
        SqliteBackend::new(temp_dir.path().join("stats.db"))
            .await
            .unwrap(),
    );

    let fleet = Fleet::start(test_config(), backend, None, FakeProber::new()).await;
    let stats = fleet.storage_stats().await.unwrap();
    assert!(!stats.is_empty());

    fleet.close().await.unwrap();
}
