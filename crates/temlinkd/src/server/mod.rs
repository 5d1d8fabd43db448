//! Unix socket gateway onto the message bus.
//!
//! The gateway:
//! - Listens on a Unix socket for client connections
//! - Spawns a ConnectionHandler for each client
//! - Publishes client messages onto the bus
//! - Forwards bus traffic to subscribed clients, filtered by topic
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  GatewayServer  │
//! │                 │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐  publish  ┌─────────────────┐
//! │ConnectionHandler│──────────▶│   MessageBus    │
//! │   (per client)  │           │                 │
//! └─────────────────┘           └───────┬─────────┘
//!         ▲                             │ subscribe
//!         │ message                     ▼
//!         │                     ┌─────────────────┐
//!         └─────────────────────│   broadcaster   │
//!                               └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{
    ConnectionError, ConnectionHandler, Subscriber, SubscriberWriter, SubscribersMap,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use temlink_protocol::GatewayMessage;

use crate::bus::{Envelope, MessageBus};

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/temlink.sock";

/// Maximum number of concurrent subscribers
pub const MAX_SUBSCRIBERS: usize = 10;

/// Maximum message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
pub const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Unix socket gateway.
///
/// Manages client connections and forwards bus traffic.
pub struct GatewayServer {
    /// Path to the Unix socket
    socket_path: PathBuf,

    /// Bus that clients publish into and subscribe to
    bus: MessageBus,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,

    /// Connection counter for generating client IDs
    connection_counter: AtomicU64,

    /// Active subscribers (keyed by client_id)
    subscribers: SubscribersMap,
}

impl GatewayServer {
    /// Creates a new gateway server.
    ///
    /// # Arguments
    ///
    /// * `socket_path` - Path where the Unix socket will be created
    /// * `bus` - Message bus to bridge onto the socket
    /// * `cancel_token` - Token for graceful shutdown
    pub fn new(
        socket_path: impl Into<PathBuf>,
        bus: MessageBus,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            bus,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Runs the server.
    ///
    /// Listens for connections until the cancellation token is triggered.
    /// This method does not return until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        // Remove a stale socket left by a previous run
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| ServerError::SocketSetup {
                path: self.socket_path.clone(),
                error: e.to_string(),
            })?;
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| ServerError::SocketSetup {
                    path: self.socket_path.clone(),
                    error: e.to_string(),
                })?;
            }
        }

        let listener =
            UnixListener::bind(&self.socket_path).map_err(|e| ServerError::SocketSetup {
                path: self.socket_path.clone(),
                error: e.to_string(),
            })?;

        info!(
            socket = %self.socket_path.display(),
            "Gateway listening"
        );

        self.spawn_bus_forwarder();

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Gateway shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// Handles a new client connection by spawning a handler task.
    fn handle_connection(&self, stream: tokio::net::UnixStream, connection_number: u64) {
        let (reader, writer) = stream.into_split();
        let bus = self.bus.clone();
        let subscribers = Arc::clone(&self.subscribers);
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(
                reader,
                writer,
                bus,
                Arc::clone(&subscribers),
                connection_number,
            );

            let client_id = tokio::select! {
                id = handler.run() => id,
                _ = cancel_token.cancelled() => None,
            };

            if let Some(id) = client_id {
                let mut subs = subscribers.write().await;
                if subs.remove(&id).is_some() {
                    debug!(client_id = %id, "Removed disconnected subscriber");
                }
            }
        });
    }

    /// Spawns the task that forwards bus envelopes to subscribers.
    fn spawn_bus_forwarder(&self) {
        let mut bus_rx = self.bus.subscribe();
        let subscribers = Arc::clone(&self.subscribers);
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Bus forwarder shutting down");
                        break;
                    }

                    result = bus_rx.recv() => {
                        match result {
                            Ok(envelope) => {
                                forward_envelope(&subscribers, &envelope).await;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "Bus forwarder lagged, skipped messages");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Bus closed");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Returns the number of active subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Performs cleanup on shutdown.
    async fn cleanup(&self) {
        self.subscribers.write().await.clear();

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }

        info!("Gateway cleanup complete");
    }
}

/// Sends one bus envelope to every subscriber whose filter matches.
///
/// Subscribers that fail or time out are dropped.
async fn forward_envelope(subscribers: &SubscribersMap, envelope: &Envelope) {
    let msg = GatewayMessage::message(
        envelope.topic.clone(),
        envelope.payload.clone(),
        envelope.sent_at,
    );

    let json = match serde_json::to_string(&msg) {
        Ok(j) => j,
        Err(e) => {
            error!(error = %e, "Failed to serialize bus message");
            return;
        }
    };

    let subs = subscribers.read().await;
    let mut failed_clients = Vec::new();

    for (client_id, sub) in subs.iter() {
        if !sub.accepts(&envelope.topic) {
            continue;
        }

        let mut writer = sub.writer.lock().await;
        let send_result = timeout(WRITE_TIMEOUT, async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await;

        match send_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(client_id = %client_id, error = %e, "Failed to forward message");
                failed_clients.push(client_id.clone());
            }
            Err(_) => {
                debug!(client_id = %client_id, "Forwarding timed out");
                failed_clients.push(client_id.clone());
            }
        }
    }

    // Drop the read lock before taking the write lock
    drop(subs);

    if !failed_clients.is_empty() {
        let mut subs = subscribers.write().await;
        for client_id in failed_clients {
            subs.remove(&client_id);
            debug!(client_id = %client_id, "Removed failed subscriber");
        }
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Too many subscribers (max: {max})")]
    TooManySubscribers { max: usize },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}
