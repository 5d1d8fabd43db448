//! temlink Protocol - Bus payloads and gateway wire protocol
//!
//! This crate provides the topic names and typed payloads exchanged on the
//! message bus, the decoding of incoming commands, and the message types
//! spoken by the local gateway socket.

pub mod command;
pub mod message;
pub mod status;
pub mod topic;
pub mod version;

pub use command::{Command, ScopeCommand, StageMotionCommand, StageRotationCommand};
pub use message::{ClientMessage, GatewayMessage, MessageType};
pub use status::{ScopeStatus, StageMotionStatus, StageRotationStatus, EUCENTRIC_HEIGHT};
pub use topic::Topic;
pub use version::ProtocolVersion;
