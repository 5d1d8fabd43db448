//! Stage geometry: commanded setpoints, live readbacks and tolerance bands.
//!
//! Translation is expressed in device units throughout. Rotation is carried
//! in radians on the bus and in degrees by the instrument; `StageReadback`
//! keeps the instrument's degrees and `StageSetpoint` keeps radians, so every
//! comparison goes through [`StageReadback::tilt_x_rad`] and friends.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DomainError, DomainResult};

/// Default linear tolerance, in device units.
pub const DEFAULT_TRANS_TOL: f64 = 60.0;

/// Default angular tolerance: 0.2 degrees, in radians.
pub const DEFAULT_ROT_TOL: f64 = 0.2 * std::f64::consts::PI / 180.0;

// ============================================================================
// Axes
// ============================================================================

/// One of the five stage axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    X,
    Y,
    Z,
    TiltX,
    TiltY,
}

impl Axis {
    /// All axes, translation first.
    pub const ALL: [Axis; 5] = [Axis::X, Axis::Y, Axis::Z, Axis::TiltX, Axis::TiltY];

    /// Returns true for the two tilt axes.
    pub fn is_rotation(&self) -> bool {
        matches!(self, Self::TiltX | Self::TiltY)
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::X => "x",
            Self::Y => "y",
            Self::Z => "z",
            Self::TiltX => "tilt_x",
            Self::TiltY => "tilt_y",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Readback
// ============================================================================

/// Live stage position as reported by the instrument.
///
/// Tilt angles are in degrees, as the instrument reports them.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StageReadback {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub tilt_x_deg: f64,
    pub tilt_y_deg: f64,
}

impl StageReadback {
    pub fn new(x: f64, y: f64, z: f64, tilt_x_deg: f64, tilt_y_deg: f64) -> Self {
        Self {
            x,
            y,
            z,
            tilt_x_deg,
            tilt_y_deg,
        }
    }

    pub fn tilt_x_rad(&self) -> f64 {
        self.tilt_x_deg.to_radians()
    }

    pub fn tilt_y_rad(&self) -> f64 {
        self.tilt_y_deg.to_radians()
    }

    /// Value of `axis` in setpoint units (radians for tilt).
    pub fn axis(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::TiltX => self.tilt_x_rad(),
            Axis::TiltY => self.tilt_y_rad(),
        }
    }
}

// ============================================================================
// Setpoint
// ============================================================================

/// Last commanded stage position.
///
/// This is what the stage was told to do, not where it is. Tilt is stored
/// in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StageSetpoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub tilt_x: f64,
    pub tilt_y: f64,
}

impl StageSetpoint {
    /// Seeds a setpoint from a live readback so the stage starts "at rest".
    pub fn from_readback(readback: &StageReadback) -> Self {
        Self {
            x: readback.x,
            y: readback.y,
            z: readback.z,
            tilt_x: readback.tilt_x_rad(),
            tilt_y: readback.tilt_y_rad(),
        }
    }

    pub fn axis(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::TiltX => self.tilt_x,
            Axis::TiltY => self.tilt_y,
        }
    }

    pub fn set_axis(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
            Axis::TiltX => self.tilt_x = value,
            Axis::TiltY => self.tilt_y = value,
        }
    }

    /// Absolute deviation between this setpoint and `readback` on `axis`.
    pub fn deviation(&self, readback: &StageReadback, axis: Axis) -> f64 {
        (self.axis(axis) - readback.axis(axis)).abs()
    }
}

// ============================================================================
// Tolerances
// ============================================================================

/// Tolerance bands used to decide whether the stage is still moving.
///
/// A deviation equal to the tolerance is still "at rest"; only strictly
/// larger deviations count as motion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerances {
    /// Linear tolerance in device units
    pub translation: f64,

    /// Angular tolerance in radians
    pub rotation: f64,
}

impl Tolerances {
    /// Creates tolerances, rejecting negative or non-finite bands.
    pub fn new(translation: f64, rotation: f64) -> DomainResult<Self> {
        if !translation.is_finite() || translation < 0.0 {
            return Err(DomainError::invalid(
                "trans_tol",
                translation,
                "a finite value >= 0",
            ));
        }
        if !rotation.is_finite() || rotation < 0.0 {
            return Err(DomainError::invalid(
                "rot_tol",
                rotation,
                "a finite value >= 0",
            ));
        }
        Ok(Self {
            translation,
            rotation,
        })
    }

    /// Tolerance applicable to `axis`.
    pub fn for_axis(&self, axis: Axis) -> f64 {
        if axis.is_rotation() {
            self.rotation
        } else {
            self.translation
        }
    }
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            translation: DEFAULT_TRANS_TOL,
            rotation: DEFAULT_ROT_TOL,
        }
    }
}
