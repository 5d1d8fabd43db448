//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming messages
//! - Publishes client messages onto the bus
//! - Registers the client as a topic subscriber on request
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use temlink_protocol::{ClientMessage, GatewayMessage, MessageType, ProtocolVersion};

use super::{ServerError, MAX_MESSAGE_SIZE, MAX_SUBSCRIBERS, READ_TIMEOUT, WRITE_TIMEOUT};
use crate::bus::{ChannelError, MessageBus, MessageChannel};

/// Type alias for subscriber writer handle
pub type SubscriberWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// A client receiving bus traffic.
pub struct Subscriber {
    /// Writer for forwarded messages
    pub writer: SubscriberWriter,

    /// Topics to forward (None = every topic)
    pub topics: Option<Vec<String>>,
}

impl Subscriber {
    /// Returns true if messages on `topic` should reach this client.
    pub fn accepts(&self, topic: &str) -> bool {
        match &self.topics {
            Some(topics) => topics.iter().any(|t| t == topic),
            None => true,
        }
    }
}

/// Type alias for the subscribers map
pub type SubscribersMap = Arc<RwLock<HashMap<String, Subscriber>>>;

/// Unique identifier for this connection
type ClientId = String;

/// Connection handler for a single client.
pub struct ConnectionHandler {
    /// Buffered reader for incoming messages
    reader: BufReader<OwnedReadHalf>,

    /// Buffered writer, shared with the bus forwarder once subscribed
    writer: SubscriberWriter,

    /// Bus that published messages go to
    bus: MessageBus,

    /// Shared subscribers map
    subscribers: SubscribersMap,

    /// Unique client identifier (assigned after handshake)
    client_id: Option<ClientId>,

    /// Number assigned by the accept loop
    connection_number: u64,
}

impl ConnectionHandler {
    /// Creates a new connection handler.
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        bus: MessageBus,
        subscribers: SubscribersMap,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            bus,
            subscribers,
            client_id: None,
            connection_number,
        }
    }

    /// Runs the connection handler.
    ///
    /// Performs the handshake, then processes messages until the
    /// connection closes. Returns the client id for subscriber cleanup.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        match self.handle_handshake().await {
            Ok(()) => {
                info!(client_id = ?self.client_id, "Client handshake completed");
            }
            Err(e) => {
                warn!(
                    connection = self.connection_number,
                    error = %e,
                    "Handshake failed"
                );
                return None;
            }
        }

        let client_id = self.client_id.clone();

        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        info!(client_id = ?self.client_id, "Client disconnected");
        client_id
    }

    /// Expects `connect`, checks the protocol version, answers
    /// `connected` or `rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout),
        };

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );

            self.send_message(GatewayMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;

            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));

                self.client_id = Some(assigned_id.clone());
                self.send_message(GatewayMessage::connected(assigned_id))
                    .await?;
                Ok(())
            }
            other => {
                self.send_message(GatewayMessage::error(
                    "Expected Connect message for handshake",
                ))
                .await?;

                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Reads and handles messages until EOF, timeout or a fatal error.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(e)) if e.is_recoverable() => {
                    warn!(client_id = ?self.client_id, error = %e, "Dropped bad message");
                    self.send_message(GatewayMessage::error(&e.to_string()))
                        .await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            match self.handle_message(msg).await {
                Ok(()) => {}
                Err(ConnectionError::Eof) => return Ok(()),
                Err(e) => {
                    error!(client_id = ?self.client_id, error = %e, "Error handling message");
                    let _ = self
                        .send_message(GatewayMessage::error(&e.to_string()))
                        .await;
                }
            }
        }
    }

    /// Handles a single client message.
    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        match msg.message {
            MessageType::Connect { .. } => {
                self.send_message(GatewayMessage::error("Already connected"))
                    .await?;
            }

            MessageType::Publish { topic, payload } => {
                debug!(client_id = ?self.client_id, topic = %topic, "Client published");
                self.bus.publish(&topic, payload)?;
            }

            MessageType::Subscribe { topics } => {
                self.handle_subscribe(topics).await?;
            }

            MessageType::Unsubscribe => {
                if let Some(ref client_id) = self.client_id {
                    self.subscribers.write().await.remove(client_id);
                }
                debug!(client_id = ?self.client_id, "Client unsubscribed");
            }

            MessageType::Ping { seq } => {
                self.send_message(GatewayMessage::pong(seq)).await?;
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        }

        Ok(())
    }

    /// Adds or replaces this client's subscription.
    async fn handle_subscribe(
        &mut self,
        topics: Option<Vec<String>>,
    ) -> Result<(), ConnectionError> {
        let client_id = match &self.client_id {
            Some(id) => id.clone(),
            None => {
                self.send_message(GatewayMessage::error("Must connect before subscribing"))
                    .await?;
                return Ok(());
            }
        };

        {
            let mut subs = self.subscribers.write().await;

            if subs.len() >= MAX_SUBSCRIBERS && !subs.contains_key(&client_id) {
                drop(subs);
                let err = ServerError::TooManySubscribers {
                    max: MAX_SUBSCRIBERS,
                };
                self.send_message(GatewayMessage::error_with_code(
                    &err.to_string(),
                    "too_many_subscribers",
                ))
                .await?;
                return Ok(());
            }

            subs.insert(
                client_id.clone(),
                Subscriber {
                    writer: Arc::clone(&self.writer),
                    topics: topics.clone(),
                },
            );
        }

        debug!(client_id = %client_id, topics = ?topics, "Client subscribed");

        self.send_message(GatewayMessage::subscribed(topics)).await
    }

    /// Reads one newline-terminated message, refusing lines over the size limit.
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();

        let limit = (MAX_MESSAGE_SIZE + 1) as u64;
        let bytes_read = (&mut self.reader)
            .take(limit)
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            // The rest of an oversized line cannot be resynchronised
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_str(&line)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );

        Ok(msg)
    }

    /// Sends a message to the client.
    async fn send_message(&self, msg: GatewayMessage) -> Result<(), ConnectionError> {
        let json =
            serde_json::to_string(&msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        let mut writer = self.writer.lock().await;

        match timeout(WRITE_TIMEOUT, async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }

    /// Returns the client ID (if connected).
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Publish failed: {0}")]
    Publish(#[from] ChannelError),
}

impl ConnectionError {
    /// Errors after which the connection can keep reading.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ParseError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(2, 0),
            server: ProtocolVersion::new(1, 0),
        };
        assert!(err.to_string().contains("2.0"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_message_size_error() {
        let err = ConnectionError::MessageTooLarge {
            size: 2_000_000,
            max: MAX_MESSAGE_SIZE,
        };
        assert!(err.to_string().contains("2000000"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_parse_errors_are_recoverable() {
        assert!(ConnectionError::ParseError("bad".to_string()).is_recoverable());
        assert!(!ConnectionError::Eof.is_recoverable());
    }

    #[tokio::test]
    async fn test_subscriber_topic_filter() {
        let (_client, server) = tokio::net::UnixStream::pair().unwrap();
        let (_, writer) = server.into_split();
        let writer = Arc::new(Mutex::new(BufWriter::new(writer)));

        let all = Subscriber {
            writer: Arc::clone(&writer),
            topics: None,
        };
        assert!(all.accepts("scope.status"));

        let filtered = Subscriber {
            writer,
            topics: Some(vec!["stage.motion.status".to_string()]),
        };
        assert!(filtered.accepts("stage.motion.status"));
        assert!(!filtered.accepts("scope.status"));
    }
}
