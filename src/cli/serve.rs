use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use axum::serve;
use eyre::Result;
use tokio::net::TcpListener;

use crate::{
    automation::Automation,
    config::Config,
    control::Controller,
    hardware::{self, RelayBank},
    sensors::{MeshFeed, SensorGateway},
    server,
    store::{AssignmentStore, RuntimeLog},
};

pub async fn launch(config_path: &str, port: Option<u16>) -> Result<()> {
    let config = Config::load(config_path).await?;

    let store = AssignmentStore::new(&config.storage.assignments);
    let assignments = store.load().await?;

    let mut relays = RelayBank::new(hardware::default_backend(config.fans.active_low)?);

    // Pre-open the relays of every persisted assignment
    for fan in &assignments {
        relays.initialize(fan.pin);
    }

    tracing::info!(fans = assignments.len(), "Loaded fan assignments");

    let controller = Arc::new(Controller::new(
        config.fans.pins.clone(),
        store,
        RuntimeLog::new(&config.storage.runtime_log),
        relays,
        assignments,
    ));

    let sensors = Arc::new(SensorGateway::new(
        Box::new(MeshFeed::new(&config.sensor)?),
        Duration::from_secs(config.sensor.cache_secs),
    ));

    tokio::spawn(Automation::new(controller.clone(), sensors.clone(), &config.fans).run());

    let app = server::create_router(controller.clone(), sensors);
    let port = port.unwrap_or(config.server.port);
    let socket = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;

    tracing::info!("Listening on http://0.0.0.0:{port}");
    serve(socket, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Best-effort: every fan off before the process exits
    controller.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Failed to listen for the shutdown signal");
    }
}
