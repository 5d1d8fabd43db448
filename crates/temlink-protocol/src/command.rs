//! Command payloads received on the bus.
//!
//! Every field is optional: an absent field leaves that axis or setting
//! untouched. Decoding rejects non-finite numbers so that no handler ever
//! forwards a NaN to the instrument.

use serde::{Deserialize, Serialize};
use temlink_core::{Axis, DomainError, DomainResult, MagMode, ScreenPosition};

use crate::Topic;

/// `stage.motion.command` payload.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StageMotionCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

impl StageMotionCommand {
    /// Requested translation axes, in application order.
    pub fn axes(&self) -> impl Iterator<Item = (Axis, f64)> {
        [(Axis::X, self.x), (Axis::Y, self.y), (Axis::Z, self.z)]
            .into_iter()
            .filter_map(|(axis, value)| value.map(|v| (axis, v)))
    }

    fn validate(&self) -> DomainResult<()> {
        for (axis, value) in self.axes() {
            require_finite(&axis.to_string(), value)?;
        }
        Ok(())
    }
}

/// `stage.rotation.command` payload. Angles are in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StageRotationCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle_y: Option<f64>,
}

impl StageRotationCommand {
    /// Requested tilt axes with their angle in radians.
    pub fn axes(&self) -> impl Iterator<Item = (Axis, f64)> {
        [(Axis::TiltX, self.angle_x), (Axis::TiltY, self.angle_y)]
            .into_iter()
            .filter_map(|(axis, value)| value.map(|v| (axis, v)))
    }

    fn validate(&self) -> DomainResult<()> {
        for (axis, value) in self.axes() {
            require_finite(&axis.to_string(), value)?;
        }
        Ok(())
    }
}

/// `scope.command` payload.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScopeCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mag: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mag_mode: Option<MagMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_size: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beam_offset: Option<(f64, f64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<ScreenPosition>,
}

impl ScopeCommand {
    /// Mode used for the magnification lookup; `MAG1` when unspecified.
    pub fn effective_mag_mode(&self) -> MagMode {
        self.mag_mode.unwrap_or_default()
    }

    /// Returns true when the command carries no settings at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn validate(&self) -> DomainResult<()> {
        if let Some((x, y)) = self.beam_offset {
            require_finite("beam_offset", x)?;
            require_finite("beam_offset", y)?;
        }
        Ok(())
    }
}

/// A decoded command, tagged by the topic it arrived on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    StageMotion(StageMotionCommand),
    StageRotation(StageRotationCommand),
    Scope(ScopeCommand),
}

impl Command {
    /// Decodes a payload received on `topic`.
    ///
    /// Returns `Ok(None)` for topics that are not command topics.
    ///
    /// # Errors
    ///
    /// `DomainError::ParseError` for malformed payloads and
    /// `DomainError::InvalidFieldValue` for non-finite numbers.
    pub fn decode(topic: Topic, payload: serde_json::Value) -> DomainResult<Option<Self>> {
        let command = match topic {
            Topic::StageMotionCommand => {
                let cmd: StageMotionCommand = from_payload(topic, payload)?;
                cmd.validate()?;
                Self::StageMotion(cmd)
            }
            Topic::StageRotationCommand => {
                let cmd: StageRotationCommand = from_payload(topic, payload)?;
                cmd.validate()?;
                Self::StageRotation(cmd)
            }
            Topic::ScopeCommand => {
                let cmd: ScopeCommand = from_payload(topic, payload)?;
                cmd.validate()?;
                Self::Scope(cmd)
            }
            Topic::StageMotionStatus | Topic::StageRotationStatus | Topic::ScopeStatus => {
                return Ok(None)
            }
        };
        Ok(Some(command))
    }

    /// Topic this command is carried on.
    pub fn topic(&self) -> Topic {
        match self {
            Self::StageMotion(_) => Topic::StageMotionCommand,
            Self::StageRotation(_) => Topic::StageRotationCommand,
            Self::Scope(_) => Topic::ScopeCommand,
        }
    }
}

fn from_payload<T: for<'de> Deserialize<'de>>(
    topic: Topic,
    payload: serde_json::Value,
) -> DomainResult<T> {
    serde_json::from_value(payload).map_err(|e| DomainError::ParseError {
        field: topic.to_string(),
        reason: e.to_string(),
    })
}

fn require_finite(field: &str, value: f64) -> DomainResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(DomainError::invalid(field, value, "a finite number"))
    }
}
