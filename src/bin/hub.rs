use std::sync::Arc;

use clap::Parser;
use fleetmon::{
    EventCategory, Fleet, MonitorEvent,
    config::{StorageConfig, read_config_file},
    icmp::IcmpProber,
    snmp::{SnmpTransport, UdpTransport},
    storage::{StorageBackend, memory::MemoryBackend},
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("fleetmon", LevelFilter::TRACE),
        ("fleetmon_hub", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

async fn open_backend(storage: Option<&StorageConfig>) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match storage {
        None | Some(StorageConfig::None) => {
            info!("using in-memory storage");
            Ok(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "storage-sqlite")]
        Some(StorageConfig::Sqlite { path, .. }) => {
            use anyhow::Context;
            use fleetmon::storage::sqlite::SqliteBackend;

            info!("using sqlite storage at {}", path.display());
            let backend = SqliteBackend::new(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        Some(StorageConfig::Sqlite { .. }) => {
            anyhow::bail!("sqlite storage requires the storage-sqlite feature")
        }
    }
}

fn log_event(event: &MonitorEvent) {
    let MonitorEvent {
        device_id,
        message,
        category,
        is_positive,
        ..
    } = event;

    match (category, is_positive) {
        (EventCategory::System, _) => error!("[{category}] {device_id}: {message}"),
        (_, false) => warn!("[{category}] {message}"),
        (_, true) => info!("[{category}] {message}"),
    }
}

async fn log_events(mut events: broadcast::Receiver<MonitorEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(missed)) => warn!("event log lagged, {missed} events lost"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    let backend = open_backend(config.storage.as_ref()).await?;

    let transport: Arc<dyn SnmpTransport> = Arc::new(UdpTransport::new());
    let fleet = Fleet::start(config, backend, Some(transport), Arc::new(IcmpProber::new())).await;
    let logger = tokio::spawn(log_events(fleet.subscribe()));

    tokio::signal::ctrl_c().await?;
    info!("received ctrl-c, shutting down");

    fleet.close().await?;
    logger.abort();

    Ok(())
}
