pub mod commands;
pub mod config;
pub mod device;
pub mod logging;
pub mod profile;
pub mod serial;
pub mod server;
pub mod session;

use std::sync::Arc;
use anyhow::Context;
use tokio::sync::watch;

use config::Settings;
use device::Coordinator;
use serial::{Connector, EmulatorConnector, EmulatorHandle, SerialConnector};
use session::SessionRegistry;

/// Pick the device transport: the emulator when a mock sensor count is
/// configured, the serial port otherwise.
pub fn connector_for(settings: &Settings) -> Arc<dyn Connector> {
    match settings.mock_sensors {
        Some(sensor_count) => Arc::new(EmulatorConnector::new(
            EmulatorHandle::new(sensor_count),
            settings.serial_timeout,
        )),
        None => Arc::new(SerialConnector::new(
            settings.serial_port.clone(),
            settings.serial_timeout,
        )),
    }
}

/// Run the bridge until Ctrl-C.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let connector = connector_for(&settings);
    let registry = Arc::new(SessionRegistry::new());
    let (coordinator, state) = Coordinator::new(connector, registry, settings.coordinator_config());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let coordinator_task = tokio::spawn(coordinator.run(shutdown_rx));

    let app = server::router(state, &settings.build_dir);
    let listener = tokio::net::TcpListener::bind(settings.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.listen_addr))?;
    log::info!("Listening on http://{}", settings.listen_addr);
    log::info!("Serving UI files from {}", settings.build_dir.display());

    let server_shutdown = shutdown_tx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {}", e);
            }
            log::info!("Shutting down");
            server_shutdown.send_replace(true);
        })
        .await
        .context("HTTP server failed")?;

    shutdown_tx.send_replace(true);
    coordinator_task.await.context("Coordinator task panicked")?;
    Ok(())
}
