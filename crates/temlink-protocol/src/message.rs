//! Gateway message types.
//!
//! The gateway speaks newline-delimited JSON over a Unix socket. Each line
//! is one message tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::ProtocolVersion;

/// Message types that clients send to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Handshake
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Publish a payload on a topic
    Publish {
        topic: String,
        payload: serde_json::Value,
    },

    /// Receive messages from the bus; no topic list means every topic
    Subscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topics: Option<Vec<String>>,
    },

    Unsubscribe,

    Ping {
        seq: u64,
    },

    Disconnect,
}

/// Messages sent from client to gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn publish(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(MessageType::Publish {
            topic: topic.into(),
            payload,
        })
    }

    pub fn subscribe(topics: Option<Vec<String>>) -> Self {
        Self::new(MessageType::Subscribe { topics })
    }

    pub fn unsubscribe() -> Self {
        Self::new(MessageType::Unsubscribe)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Messages sent from the gateway to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Handshake refused, usually a major version mismatch
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    /// Acknowledges a subscription
    Subscribed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topics: Option<Vec<String>>,
    },

    /// A message delivered from the bus
    Message {
        topic: String,
        payload: serde_json::Value,
        sent_at: DateTime<Utc>,
    },

    Pong {
        seq: u64,
    },

    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl GatewayMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn subscribed(topics: Option<Vec<String>>) -> Self {
        Self::Subscribed { topics }
    }

    pub fn message(topic: String, payload: serde_json::Value, sent_at: DateTime<Utc>) -> Self {
        Self::Message {
            topic,
            payload,
            sent_at,
        }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }
}
