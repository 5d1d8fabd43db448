//! Named-topic message transport.
//!
//! The bridge only ever sees the [`MessageChannel`] trait, so it can publish
//! while holding the hardware lock without touching the async runtime.
//! [`MessageBus`] is the in-process implementation: a broadcast channel of
//! [`Envelope`]s for the gateway server, plus a lossless queue per command
//! subscriber. Status traffic can make a slow broadcast receiver lag, but it
//! can never evict a command.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Publishing with no live subscriber is not an error

mod router;

pub use router::spawn_command_router;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use temlink_protocol::Topic;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

/// Default number of envelopes buffered per subscriber.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Errors raised while publishing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to serialize payload for {topic}: {reason}")]
    Serialize { topic: String, reason: String },

    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),

    #[error("Channel closed")]
    Closed,
}

/// Publish side of a named-topic transport.
///
/// Implementations must not block for long: `publish` is called while the
/// hardware lock is held.
pub trait MessageChannel: Send + Sync {
    fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), ChannelError>;
}

/// Serializes `payload` and publishes it on `topic`.
pub fn publish_typed<T: Serialize>(
    channel: &dyn MessageChannel,
    topic: Topic,
    payload: &T,
) -> Result<(), ChannelError> {
    let value = serde_json::to_value(payload).map_err(|e| ChannelError::Serialize {
        topic: topic.to_string(),
        reason: e.to_string(),
    })?;
    channel.publish(topic.as_str(), value)
}

/// One message on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

/// In-process broadcast bus.
///
/// Cheap to clone; every clone publishes into the same channel.
#[derive(Debug, Clone)]
pub struct MessageBus {
    sender: broadcast::Sender<Envelope>,
    command_queues: Arc<Mutex<Vec<mpsc::UnboundedSender<Envelope>>>>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            command_queues: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Receives every envelope published after this call.
    ///
    /// A receiver that falls more than `capacity` envelopes behind lags and
    /// loses the oldest ones.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Receives every command-topic envelope published after this call.
    ///
    /// The queue is unbounded, so commands are kept in publish order however
    /// far behind the consumer is.
    pub fn subscribe_commands(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.command_queues.lock().push(tx);
        rx
    }

    fn enqueue_command(&self, envelope: &Envelope) {
        self.command_queues
            .lock()
            .retain(|queue| queue.send(envelope.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl MessageChannel for MessageBus {
    fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), ChannelError> {
        if topic.is_empty() {
            return Err(ChannelError::InvalidTopic(topic.to_string()));
        }

        let envelope = Envelope {
            topic: topic.to_string(),
            payload,
            sent_at: Utc::now(),
        };

        if topic.parse::<Topic>().is_ok_and(|t| t.is_command()) {
            self.enqueue_command(&envelope);
        }

        // A send error only means nobody is listening right now.
        if self.sender.send(envelope).is_err() {
            trace!(topic, "Published with no subscribers");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use temlink_protocol::StageMotionStatus;

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = MessageBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.publish("scope.status", json!({})).is_ok());
    }

    #[test]
    fn test_subscriber_receives_envelope() {
        let bus = MessageBus::new(4);
        let mut rx = bus.subscribe();

        bus.publish("stage.motion.command", json!({"x": 100})).unwrap();

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.topic, "stage.motion.command");
        assert_eq!(envelope.payload["x"], 100);
    }

    #[test]
    fn test_command_queue_survives_status_flood() {
        let bus = MessageBus::new(4);
        let mut commands = bus.subscribe_commands();
        let mut rx = bus.subscribe();

        for i in 0..20 {
            bus.publish("scope.command", json!({"brightness": i})).unwrap();
            for _ in 0..10 {
                bus.publish("stage.motion.status", json!({})).unwrap();
            }
        }

        let queued: Vec<_> = std::iter::from_fn(|| commands.try_recv().ok()).collect();
        assert_eq!(queued.len(), 20);
        assert!(queued.iter().all(|e| e.topic == "scope.command"));
        assert_eq!(queued[19].payload["brightness"], 19);

        // the broadcast side is lossy by contrast
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
    }

    #[test]
    fn test_dropped_command_queue_is_pruned() {
        let bus = MessageBus::new(4);
        drop(bus.subscribe_commands());
        let mut live = bus.subscribe_commands();

        bus.publish("stage.motion.command", json!({"z": 1})).unwrap();

        assert_eq!(bus.command_queues.lock().len(), 1);
        assert_eq!(live.try_recv().unwrap().payload["z"], 1);
    }

    #[test]
    fn test_empty_topic_rejected() {
        let bus = MessageBus::default();
        let err = bus.publish("", json!(null)).unwrap_err();
        assert_eq!(err, ChannelError::InvalidTopic(String::new()));
    }

    #[test]
    fn test_publish_typed_uses_topic_name() {
        let bus = MessageBus::default();
        let mut rx = bus.subscribe();
        let status = StageMotionStatus {
            x: 1,
            y: 2,
            z: 3,
            in_motion: false,
        };

        publish_typed(&bus, Topic::StageMotionStatus, &status).unwrap();

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.topic, "stage.motion.status");
        assert_eq!(envelope.payload, json!({"x": 1, "y": 2, "z": 3, "in_motion": false}));
    }
}
