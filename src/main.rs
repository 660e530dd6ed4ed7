use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

use carsink::config::Config;
use carsink::service::{ServiceOptions, SinkHandle, SinkService};
use carsink::sidecar::Sidecar;

fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    log::info!("Starting carsink Bluetooth audio sink");

    let config = Config::from_env().context("Invalid configuration")?;
    log::debug!("Configuration: {:?}", config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    // Platform events flow into the same queue as commands and ticks
    let (inputs, receiver) = mpsc::unbounded_channel();
    let sidecar = Sidecar::spawn(&config, inputs.clone()).context("Failed to start platform sidecar")?;
    let platform = Arc::new(sidecar.clone());

    let (mut service, handle) = SinkService::with_inputs(
        ServiceOptions::from(&config),
        platform.clone(),
        platform,
        inputs,
        receiver,
    );

    // Setup signal handler for Ctrl+C (SIGINT) and SIGTERM
    let handle_for_signal = handle.clone();
    ctrlc::set_handler(move || {
        log::info!("Received interrupt signal, shutting down...");
        handle_for_signal.shutdown();
    })
    .context("Failed to install signal handler")?;

    runtime.block_on(async move {
        tokio::spawn(log_changes(handle));
        service.start();
        service.run().await;
    });

    if sidecar.is_running() {
        match sidecar.stop() {
            Ok(_) => log::info!("Sidecar stopped successfully"),
            Err(e) => log::error!("Error stopping sidecar: {}", e),
        }
    }

    log::info!("Bluetooth sink stopped");
    Ok(())
}

/// Follow the published player state and log connection changes
async fn log_changes(handle: SinkHandle) {
    let mut player = handle.player_state();
    let mut status = player.borrow().connection_status;

    while player.changed().await.is_ok() {
        let current = player.borrow_and_update().connection_status;
        if current != status {
            status = current;
            log::info!("Connection status: {:?}", status);
        }
    }
}
