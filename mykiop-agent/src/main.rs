//! MykiOp Agent - vehicle edge node
//!
//! Wires the door controller feed, the remote store, the durable cache and
//! the housekeeping tasks around a single coordinator task.

use anyhow::{Context, Result};
use mykiop_agent::clock::VehicleClock;
use mykiop_agent::config::AgentConfig;
use mykiop_agent::coordinator::{spawn_day_boundary_timer, Command, Coordinator};
use mykiop_agent::media::{CommandRecorder, DisabledMedia, MediaPipeline};
use mykiop_agent::network::{spawn_network_monitor, ReachabilityProbe, TcpProbe};
use mykiop_agent::reconcile::{Collaborators, Reconciler};
use mykiop_agent::remote::HttpRemote;
use mykiop_agent::telemetry::MqttTelemetry;
use mykiop_agent::{mqtt, DayBoundaryArchiver, DurableCache};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mykiop_agent=info")),
        )
        .init();

    if std::env::args().any(|arg| arg == "--write-default-config") {
        let path = AgentConfig::config_file_path()?;
        AgentConfig::default()
            .save_to(&path)
            .await
            .context("Failed to write default config")?;
        info!("Default config written to {}", path.display());
        return Ok(());
    }

    info!("MykiOp Agent starting...");

    let config = AgentConfig::load().await.context("Failed to load config")?;
    config.validate().context("Invalid config")?;
    let device_id = config.vehicle.device_id.clone();
    info!("Vehicle {} ({})", device_id, config.vehicle.timezone);

    let clock = VehicleClock::system(config.timezone()?);
    let cache = DurableCache::open(config.cache_path())
        .await
        .context("Failed to open data cache")?;

    let remote = Arc::new(HttpRemote::new(
        &config.remote.database_url,
        &config.remote.storage_url,
        &config.remote.collection,
        config.request_timeout(),
    )?);
    let probe: Arc<dyn ReachabilityProbe> = Arc::new(TcpProbe::new(
        &config.network.probe_host,
        config.network.probe_port,
        config.probe_timeout(),
    ));

    let (client, eventloop) = mqtt::connect(&config);
    let telemetry = Arc::new(MqttTelemetry::new(
        client.clone(),
        &config.mqtt.telemetry_prefix,
        &device_id,
    ));

    let media: Box<dyn MediaPipeline> = if config.media.record_command.is_empty() {
        info!("Recording disabled");
        Box::new(DisabledMedia)
    } else {
        let recorder = CommandRecorder::new(
            config.media.record_command.clone(),
            config.media_dir(),
            config.media.extension.clone(),
            clock.clone(),
        );
        Box::new(match config.conversion() {
            Some(conversion) => recorder.with_conversion(conversion),
            None => recorder,
        })
    };

    let collaborators = Collaborators {
        aggregates: remote.clone(),
        objects: remote,
        telemetry,
        probe: probe.clone(),
    };
    let engine = Reconciler::new(&device_id, collaborators, cache, clock, config.request_timeout());
    let archiver = DayBoundaryArchiver::new(&config.storage.data_dir);
    let coordinator = Coordinator::new(engine, archiver, media);

    let (tx, rx) = mpsc::channel(64);
    let monitor = spawn_network_monitor(probe, config.poll_interval(), tx.clone());
    let timer = spawn_day_boundary_timer(config.day_check_interval(), tx.clone());
    let ingress = mqtt::spawn_event_loop(client, eventloop, config.sensor_topic(), tx.clone());

    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for shutdown signal: {}", e);
            return;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if shutdown_tx.send(Command::Status(reply_tx)).await.is_ok() {
            if let Ok(status) = reply_rx.await {
                info!(
                    "Stopping with {} cached entries, totals {}/{}/{}",
                    status.pending_entries,
                    status.totals.enter_count,
                    status.totals.myki_taps,
                    status.totals.offender_count
                );
            }
        }
        let _ = shutdown_tx.send(Command::Shutdown).await;
    });
    drop(tx);

    coordinator.run(rx).await;

    monitor.abort();
    timer.abort();
    ingress.abort();
    info!("MykiOp Agent stopped");
    Ok(())
}
