//! Routes command envelopes from the bus to the bridge.
//!
//! Commands arrive on the bus's lossless command queue, never on the
//! broadcast side, so status traffic cannot push them out while a slow
//! hardware call is in progress. Each command is applied on the blocking
//! pool, one at a time, in delivery order.

use temlink_protocol::{Command, Topic};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{Envelope, MessageBus};
use crate::bridge::Bridge;
use crate::hardware::HardwareFacade;

/// Subscribes to the command topics of `bus` and feeds them into `bridge`.
///
/// The subscription is taken before this returns, so every command
/// published afterwards is applied. The task stops on cancellation; a
/// command already on the hardware finishes first.
pub fn spawn_command_router<H>(
    bus: &MessageBus,
    bridge: Bridge<H>,
    cancel_token: CancellationToken,
) -> JoinHandle<()>
where
    H: HardwareFacade + 'static,
{
    let commands = bus.subscribe_commands();
    tokio::spawn(run_router(bridge, commands, cancel_token))
}

async fn run_router<H>(
    bridge: Bridge<H>,
    mut commands: mpsc::UnboundedReceiver<Envelope>,
    cancel_token: CancellationToken,
) where
    H: HardwareFacade + 'static,
{
    info!("Command router started");
    loop {
        let envelope = tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                debug!("Command router shutting down");
                break;
            }

            envelope = commands.recv() => match envelope {
                Some(envelope) => envelope,
                None => {
                    debug!("Bus closed");
                    break;
                }
            },
        };

        if let Some(command) = decode(envelope) {
            apply(&bridge, command).await;
        }
    }
    debug!("Command router stopped");
}

/// Decodes command envelopes; anything else yields `None`.
fn decode(envelope: Envelope) -> Option<Command> {
    let topic: Topic = match envelope.topic.parse() {
        Ok(topic) => topic,
        Err(_) => {
            trace!(topic = %envelope.topic, "Ignoring unknown topic");
            return None;
        }
    };

    if !topic.is_command() {
        return None;
    }

    match Command::decode(topic, envelope.payload) {
        Ok(command) => command,
        Err(e) => {
            warn!(%topic, error = %e, "Rejected malformed command");
            None
        }
    }
}

async fn apply<H>(bridge: &Bridge<H>, command: Command)
where
    H: HardwareFacade + 'static,
{
    let topic = command.topic();
    let worker_bridge = bridge.clone();

    match tokio::task::spawn_blocking(move || worker_bridge.handle(&command)).await {
        Ok(Ok(())) => debug!(%topic, "Command applied"),
        Ok(Err(e)) => error!(%topic, error = %e, "Command failed"),
        Err(e) => error!(%topic, error = %e, "Command task aborted"),
    }
}
