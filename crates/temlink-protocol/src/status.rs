//! Status payloads published by the bridge.

use serde::{Deserialize, Serialize};
use temlink_core::{ReportedMagMode, ScreenPosition, StageReadback};

/// Eucentric height placeholder reported with every rotation status.
pub const EUCENTRIC_HEIGHT: i64 = 0;

/// `stage.motion.status` payload. Coordinates are truncated to integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMotionStatus {
    pub x: i64,
    pub y: i64,
    pub z: i64,
    pub in_motion: bool,
}

impl StageMotionStatus {
    pub fn from_readback(readback: &StageReadback, in_motion: bool) -> Self {
        Self {
            x: readback.x.trunc() as i64,
            y: readback.y.trunc() as i64,
            z: readback.z.trunc() as i64,
            in_motion,
        }
    }
}

/// `stage.rotation.status` payload. Angles are in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageRotationStatus {
    pub angle_x: f64,
    pub angle_y: f64,
    pub eucentric_height: i64,
    pub in_motion: bool,
}

impl StageRotationStatus {
    pub fn from_readback(readback: &StageReadback, in_motion: bool) -> Self {
        Self {
            angle_x: readback.tilt_x_rad(),
            angle_y: readback.tilt_y_rad(),
            eucentric_height: EUCENTRIC_HEIGHT,
            in_motion,
        }
    }
}

/// `scope.status` payload.
///
/// `focus` and `brightness` come from the bridge's own cache, not from the
/// instrument. `aperture` is not wired up and always serializes as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScopeStatus {
    pub focus: i32,
    pub aperture: Option<u32>,
    pub mag_mode: ReportedMagMode,
    pub mag: u32,
    pub tank_voltage: f64,
    pub spot_size: u8,
    pub beam_offset: (f64, f64),
    pub screen: ScreenPosition,
    pub brightness: i32,
}
