//! Instrument control surface.
//!
//! `HardwareFacade` is the synchronous interface the bridge drives. Every
//! call may block on the instrument link, and every call may fail with a
//! transient timeout. Implementations:
//! - `SimulatedInstrument` - a motion-simulating stand-in used by the daemon
//!   when no vendor binding is linked
//! - `MockHardware` - a scriptable, call-recording double for tests
//!
//! Units: translation in device units, tilt in degrees. Conversion to and
//! from radians happens in the bridge, never here.

mod mock;
mod simulated;

pub use mock::{HardwareCall, MockHardware, Operation};
pub use simulated::{SimulatedInstrument, SimulatorSettings, DEFAULT_TANK_VOLTAGE};

use temlink_core::StageReadback;
use thiserror::Error;

/// Errors raised by the instrument link.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HardwareError {
    /// The link could not be established. Fatal at startup.
    #[error("hardware link unreachable: {0}")]
    Connection(String),

    /// The instrument did not answer in time. May be retried.
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    /// Any other failure reported by the instrument.
    #[error("{operation} failed: {reason}")]
    Failure {
        operation: &'static str,
        reason: String,
    },
}

impl HardwareError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type for hardware calls.
pub type HardwareResult<T> = Result<T, HardwareError>;

/// Synchronous control surface of the microscope.
///
/// Focus and brightness only have relative adjustments; there is no way to
/// read their absolute value back.
pub trait HardwareFacade: Send {
    /// Live stage position (tilt in degrees).
    fn stage_position(&self) -> HardwareResult<StageReadback>;

    fn set_x(&mut self, x: f64) -> HardwareResult<()>;
    fn set_y(&mut self, y: f64) -> HardwareResult<()>;
    fn set_z(&mut self, z: f64) -> HardwareResult<()>;
    fn set_tilt_x(&mut self, degrees: f64) -> HardwareResult<()>;
    fn set_tilt_y(&mut self, degrees: f64) -> HardwareResult<()>;

    /// Shifts objective focus by `delta` steps.
    fn adjust_focus(&mut self, delta: i32) -> HardwareResult<()>;

    /// Shifts brightness by `delta` steps.
    fn adjust_brightness(&mut self, delta: i32) -> HardwareResult<()>;

    fn select_function_mode(&mut self, mode: u8) -> HardwareResult<()>;
    fn function_mode(&self) -> HardwareResult<u8>;

    /// Selects a magnification by table index within the current function mode.
    fn set_selector(&mut self, index: u32) -> HardwareResult<()>;
    fn mag_value(&self) -> HardwareResult<u32>;

    fn select_spot_size(&mut self, size: u8) -> HardwareResult<()>;
    fn spot_size(&self) -> HardwareResult<u8>;

    /// Condenser deflector pair.
    fn set_beam_offset(&mut self, x: f64, y: f64) -> HardwareResult<()>;
    fn beam_offset(&self) -> HardwareResult<(f64, f64)>;

    fn set_beam_blank(&mut self, blanked: bool) -> HardwareResult<()>;
    fn beam_blank(&self) -> HardwareResult<bool>;

    /// Accelerating voltage, in volts.
    fn accelerating_voltage(&self) -> HardwareResult<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(HardwareError::Timeout { operation: "set_x" }.is_timeout());
        assert!(!HardwareError::Connection("refused".to_string()).is_timeout());
        assert!(!HardwareError::Failure {
            operation: "set_x",
            reason: "limit".to_string()
        }
        .is_timeout());
    }

    #[test]
    fn test_error_display() {
        let err = HardwareError::Failure {
            operation: "select_spot_size",
            reason: "out of range".to_string(),
        };
        assert_eq!(err.to_string(), "select_spot_size failed: out of range");
        assert_eq!(
            HardwareError::Timeout { operation: "select_function_mode" }.to_string(),
            "select_function_mode timed out"
        );
    }
}
