//! Service wiring: instrument, bus, bridge, control loop, router, gateway.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bridge::{spawn_control_loop, Bridge, BridgeSettings};
use crate::bus::{spawn_command_router, MessageBus};
use crate::config::BridgeConfig;
use crate::hardware::{HardwareFacade, SimulatedInstrument};
use crate::server::GatewayServer;

/// Connects the simulated instrument and runs the service until cancelled.
///
/// # Errors
///
/// Fails on invalid configuration, an unreachable instrument, or a gateway
/// socket that cannot be bound.
pub async fn run(config: BridgeConfig, cancel_token: CancellationToken) -> Result<()> {
    let settings = config.bridge_settings().context("Invalid configuration")?;

    let hardware = SimulatedInstrument::connect(&config.simulator, settings.tables.clone())
        .context("Failed to connect to instrument")?;

    run_with_hardware(hardware, &config, settings, cancel_token).await
}

/// Runs the service on an already connected instrument.
pub async fn run_with_hardware<H>(
    hardware: H,
    config: &BridgeConfig,
    settings: BridgeSettings,
    cancel_token: CancellationToken,
) -> Result<()>
where
    H: HardwareFacade + 'static,
{
    let bus = MessageBus::default();
    let bridge = Bridge::new(hardware, Arc::new(bus.clone()), settings)
        .context("Initial stage readback failed")?;

    let control = spawn_control_loop(bridge.clone(), config.tick(), cancel_token.clone())
        .context("Failed to spawn control loop thread")?;

    let router = spawn_command_router(&bus, bridge, cancel_token.clone());

    let server = GatewayServer::new(&config.socket_path, bus, cancel_token.clone());
    let result = server.run().await;
    if let Err(ref e) = result {
        error!(error = %e, "Gateway error");
    }

    // A gateway failure stops everything else too
    cancel_token.cancel();

    if let Err(e) = router.await {
        error!(error = %e, "Command router task failed");
    }

    tokio::task::spawn_blocking(move || control.join())
        .await
        .context("Failed to join control loop")?
        .map_err(|_| anyhow!("Control loop thread panicked"))?;

    info!("Bridge stopped");
    result.map_err(Into::into)
}
