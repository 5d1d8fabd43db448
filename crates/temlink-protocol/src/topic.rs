//! Named bus topics.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use temlink_core::DomainError;

/// Topics consumed and published by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "stage.motion.command")]
    StageMotionCommand,
    #[serde(rename = "stage.rotation.command")]
    StageRotationCommand,
    #[serde(rename = "scope.command")]
    ScopeCommand,
    #[serde(rename = "stage.motion.status")]
    StageMotionStatus,
    #[serde(rename = "stage.rotation.status")]
    StageRotationStatus,
    #[serde(rename = "scope.status")]
    ScopeStatus,
}

impl Topic {
    /// Topics the bridge subscribes to.
    pub const COMMANDS: [Topic; 3] = [
        Topic::StageMotionCommand,
        Topic::StageRotationCommand,
        Topic::ScopeCommand,
    ];

    /// Topics the bridge publishes.
    pub const STATUS: [Topic; 3] = [
        Topic::StageMotionStatus,
        Topic::StageRotationStatus,
        Topic::ScopeStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StageMotionCommand => "stage.motion.command",
            Self::StageRotationCommand => "stage.rotation.command",
            Self::ScopeCommand => "scope.command",
            Self::StageMotionStatus => "stage.motion.status",
            Self::StageRotationStatus => "stage.rotation.status",
            Self::ScopeStatus => "scope.status",
        }
    }

    pub fn is_command(&self) -> bool {
        Self::COMMANDS.contains(self)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::COMMANDS
            .into_iter()
            .chain(Self::STATUS)
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| DomainError::ParseError {
                field: "topic".to_string(),
                reason: format!("unknown topic '{s}'"),
            })
    }
}
