//! Scriptable hardware double.
//!
//! `MockHardware` is cheap to clone; all clones share one instrument state,
//! so a test can keep a clone while the bridge owns another. Setter calls
//! are recorded (including failed attempts) and errors can be queued per
//! operation. Commanded stage positions only show up in the readback after
//! [`MockHardware::settle`] or [`MockHardware::set_readback`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use temlink_core::{MagnificationTables, StageReadback};

use super::{HardwareError, HardwareFacade, HardwareResult, DEFAULT_TANK_VOLTAGE};

/// Identifies a facade operation for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    StagePosition,
    SetX,
    SetY,
    SetZ,
    SetTiltX,
    SetTiltY,
    AdjustFocus,
    AdjustBrightness,
    SelectFunctionMode,
    FunctionMode,
    SetSelector,
    MagValue,
    SelectSpotSize,
    SpotSize,
    SetBeamOffset,
    BeamOffset,
    SetBeamBlank,
    BeamBlank,
    AcceleratingVoltage,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StagePosition => "stage_position",
            Self::SetX => "set_x",
            Self::SetY => "set_y",
            Self::SetZ => "set_z",
            Self::SetTiltX => "set_tilt_x",
            Self::SetTiltY => "set_tilt_y",
            Self::AdjustFocus => "adjust_focus",
            Self::AdjustBrightness => "adjust_brightness",
            Self::SelectFunctionMode => "select_function_mode",
            Self::FunctionMode => "function_mode",
            Self::SetSelector => "set_selector",
            Self::MagValue => "mag_value",
            Self::SelectSpotSize => "select_spot_size",
            Self::SpotSize => "spot_size",
            Self::SetBeamOffset => "set_beam_offset",
            Self::BeamOffset => "beam_offset",
            Self::SetBeamBlank => "set_beam_blank",
            Self::BeamBlank => "beam_blank",
            Self::AcceleratingVoltage => "accelerating_voltage",
        }
    }

    /// A transient timeout for this operation.
    pub fn timeout(&self) -> HardwareError {
        HardwareError::Timeout {
            operation: self.name(),
        }
    }

    /// A non-retryable failure for this operation.
    pub fn failure(&self, reason: &str) -> HardwareError {
        HardwareError::Failure {
            operation: self.name(),
            reason: reason.to_string(),
        }
    }
}

/// A recorded setter call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HardwareCall {
    SetX(f64),
    SetY(f64),
    SetZ(f64),
    SetTiltX(f64),
    SetTiltY(f64),
    AdjustFocus(i32),
    AdjustBrightness(i32),
    SelectFunctionMode(u8),
    SetSelector(u32),
    SelectSpotSize(u8),
    SetBeamOffset(f64, f64),
    SetBeamBlank(bool),
}

#[derive(Debug)]
struct MockState {
    readback: StageReadback,
    target: StageReadback,
    focus: i32,
    brightness: i32,
    function_mode: u8,
    selector: u32,
    spot_size: u8,
    beam_offset: (f64, f64),
    beam_blank: bool,
    tank_voltage: f64,
    tables: MagnificationTables,
    calls: Vec<HardwareCall>,
    faults: HashMap<Operation, VecDeque<HardwareError>>,
}

/// Call-recording hardware double with injectable faults.
#[derive(Debug, Clone)]
pub struct MockHardware {
    state: Arc<Mutex<MockState>>,
}

impl MockHardware {
    /// Creates a mock with the stage resting at the origin.
    pub fn new() -> Self {
        Self::at(StageReadback::default())
    }

    /// Creates a mock with the stage resting at `readback`.
    pub fn at(readback: StageReadback) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                readback,
                target: readback,
                focus: 0,
                brightness: 0,
                function_mode: 0,
                selector: 0,
                spot_size: 1,
                beam_offset: (0.0, 0.0),
                beam_blank: false,
                tank_voltage: DEFAULT_TANK_VOLTAGE,
                tables: MagnificationTables::default(),
                calls: Vec::new(),
                faults: HashMap::new(),
            })),
        }
    }

    /// Queues `error` for the next call of `operation`.
    pub fn inject(&self, operation: Operation, error: HardwareError) {
        self.state
            .lock()
            .faults
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Queues `count` transient timeouts for `operation`.
    pub fn inject_timeouts(&self, operation: Operation, count: usize) {
        for _ in 0..count {
            self.inject(operation, operation.timeout());
        }
    }

    /// Overrides the live stage readback.
    pub fn set_readback(&self, readback: StageReadback) {
        self.state.lock().readback = readback;
    }

    /// Moves the live readback onto the last commanded position.
    pub fn settle(&self) {
        let mut state = self.state.lock();
        state.readback = state.target;
    }

    pub fn readback(&self) -> StageReadback {
        self.state.lock().readback
    }

    /// Every setter call attempted so far, in order.
    pub fn calls(&self) -> Vec<HardwareCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Net focus offset applied through deltas.
    pub fn focus(&self) -> i32 {
        self.state.lock().focus
    }

    /// Net brightness applied through deltas.
    pub fn brightness(&self) -> i32 {
        self.state.lock().brightness
    }

    fn with_fault<T>(
        &self,
        operation: Operation,
        call: Option<HardwareCall>,
        apply: impl FnOnce(&mut MockState) -> T,
    ) -> HardwareResult<T> {
        let mut state = self.state.lock();
        if let Some(call) = call {
            state.calls.push(call);
        }
        if let Some(error) = state
            .faults
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }
        Ok(apply(&mut state))
    }
}

impl Default for MockHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareFacade for MockHardware {
    fn stage_position(&self) -> HardwareResult<StageReadback> {
        self.with_fault(Operation::StagePosition, None, |s| s.readback)
    }

    fn set_x(&mut self, x: f64) -> HardwareResult<()> {
        self.with_fault(Operation::SetX, Some(HardwareCall::SetX(x)), |s| {
            s.target.x = x
        })
    }

    fn set_y(&mut self, y: f64) -> HardwareResult<()> {
        self.with_fault(Operation::SetY, Some(HardwareCall::SetY(y)), |s| {
            s.target.y = y
        })
    }

    fn set_z(&mut self, z: f64) -> HardwareResult<()> {
        self.with_fault(Operation::SetZ, Some(HardwareCall::SetZ(z)), |s| {
            s.target.z = z
        })
    }

    fn set_tilt_x(&mut self, degrees: f64) -> HardwareResult<()> {
        self.with_fault(
            Operation::SetTiltX,
            Some(HardwareCall::SetTiltX(degrees)),
            |s| s.target.tilt_x_deg = degrees,
        )
    }

    fn set_tilt_y(&mut self, degrees: f64) -> HardwareResult<()> {
        self.with_fault(
            Operation::SetTiltY,
            Some(HardwareCall::SetTiltY(degrees)),
            |s| s.target.tilt_y_deg = degrees,
        )
    }

    fn adjust_focus(&mut self, delta: i32) -> HardwareResult<()> {
        self.with_fault(
            Operation::AdjustFocus,
            Some(HardwareCall::AdjustFocus(delta)),
            |s| s.focus = s.focus.saturating_add(delta),
        )
    }

    fn adjust_brightness(&mut self, delta: i32) -> HardwareResult<()> {
        self.with_fault(
            Operation::AdjustBrightness,
            Some(HardwareCall::AdjustBrightness(delta)),
            |s| s.brightness = s.brightness.saturating_add(delta),
        )
    }

    fn select_function_mode(&mut self, mode: u8) -> HardwareResult<()> {
        self.with_fault(
            Operation::SelectFunctionMode,
            Some(HardwareCall::SelectFunctionMode(mode)),
            |s| s.function_mode = mode,
        )
    }

    fn function_mode(&self) -> HardwareResult<u8> {
        self.with_fault(Operation::FunctionMode, None, |s| s.function_mode)
    }

    fn set_selector(&mut self, index: u32) -> HardwareResult<()> {
        self.with_fault(
            Operation::SetSelector,
            Some(HardwareCall::SetSelector(index)),
            |s| s.selector = index,
        )
    }

    fn mag_value(&self) -> HardwareResult<u32> {
        self.with_fault(Operation::MagValue, None, |s| {
            s.tables
                .value_for(s.function_mode, s.selector)
                .unwrap_or_default()
        })
    }

    fn select_spot_size(&mut self, size: u8) -> HardwareResult<()> {
        self.with_fault(
            Operation::SelectSpotSize,
            Some(HardwareCall::SelectSpotSize(size)),
            |s| s.spot_size = size,
        )
    }

    fn spot_size(&self) -> HardwareResult<u8> {
        self.with_fault(Operation::SpotSize, None, |s| s.spot_size)
    }

    fn set_beam_offset(&mut self, x: f64, y: f64) -> HardwareResult<()> {
        self.with_fault(
            Operation::SetBeamOffset,
            Some(HardwareCall::SetBeamOffset(x, y)),
            |s| s.beam_offset = (x, y),
        )
    }

    fn beam_offset(&self) -> HardwareResult<(f64, f64)> {
        self.with_fault(Operation::BeamOffset, None, |s| s.beam_offset)
    }

    fn set_beam_blank(&mut self, blanked: bool) -> HardwareResult<()> {
        self.with_fault(
            Operation::SetBeamBlank,
            Some(HardwareCall::SetBeamBlank(blanked)),
            |s| s.beam_blank = blanked,
        )
    }

    fn beam_blank(&self) -> HardwareResult<bool> {
        self.with_fault(Operation::BeamBlank, None, |s| s.beam_blank)
    }

    fn accelerating_voltage(&self) -> HardwareResult<f64> {
        self.with_fault(Operation::AcceleratingVoltage, None, |s| s.tank_voltage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let mock = MockHardware::new();
        let mut owned = mock.clone();
        owned.set_x(100.0).unwrap();

        assert_eq!(mock.calls(), vec![HardwareCall::SetX(100.0)]);
        assert_eq!(mock.readback().x, 0.0);
        mock.settle();
        assert_eq!(owned.stage_position().unwrap().x, 100.0);
    }

    #[test]
    fn test_injected_faults_are_consumed_in_order() {
        let mut mock = MockHardware::new();
        mock.inject_timeouts(Operation::SelectFunctionMode, 2);

        assert!(mock.select_function_mode(2).unwrap_err().is_timeout());
        assert!(mock.select_function_mode(2).unwrap_err().is_timeout());
        mock.select_function_mode(2).unwrap();
        assert_eq!(mock.function_mode().unwrap(), 2);
        assert_eq!(mock.calls().len(), 3);
    }

    #[test]
    fn test_failed_delta_does_not_apply() {
        let mut mock = MockHardware::new();
        mock.inject(Operation::AdjustBrightness, Operation::AdjustBrightness.failure("busy"));

        assert!(mock.adjust_brightness(10).is_err());
        assert_eq!(mock.brightness(), 0);
        mock.adjust_brightness(10).unwrap();
        assert_eq!(mock.brightness(), 10);
    }

    #[test]
    fn test_mag_value_follows_mode_and_selector() {
        let mut mock = MockHardware::new();
        assert_eq!(mock.mag_value().unwrap(), 2000);
        mock.select_function_mode(2).unwrap();
        assert_eq!(mock.mag_value().unwrap(), 50);
    }
}
