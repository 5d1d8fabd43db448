//! Command handlers. Each runs with the bridge lock already held.

use std::thread;
use std::time::Instant;

use temlink_core::{Axis, MagMode};
use temlink_protocol::{ScopeCommand, StageMotionCommand, StageRotationCommand};
use tracing::{debug, warn};

use super::{BridgeResult, BridgeState};
use crate::hardware::{HardwareFacade, HardwareResult};

impl<H: HardwareFacade> BridgeState<H> {
    pub(super) fn move_stage_locked(&mut self, command: &StageMotionCommand) -> BridgeResult<()> {
        for (axis, value) in command.axes() {
            self.drive_axis(axis, value)?;
        }
        debug!(x = ?command.x, y = ?command.y, z = ?command.z, "Stage move commanded");
        Ok(())
    }

    pub(super) fn rotate_stage_locked(
        &mut self,
        command: &StageRotationCommand,
    ) -> BridgeResult<()> {
        for (axis, radians) in command.axes() {
            self.drive_axis(axis, radians)?;
        }
        debug!(
            angle_x = ?command.angle_x,
            angle_y = ?command.angle_y,
            "Stage rotation commanded"
        );
        Ok(())
    }

    /// Sends one absolute axis move; the setpoint and latch follow only on success.
    ///
    /// `value` is in radians for the tilt axes and converted to degrees here.
    fn drive_axis(&mut self, axis: Axis, value: f64) -> HardwareResult<()> {
        match axis {
            Axis::X => self.hardware.set_x(value)?,
            Axis::Y => self.hardware.set_y(value)?,
            Axis::Z => self.hardware.set_z(value)?,
            Axis::TiltX => self.hardware.set_tilt_x(value.to_degrees())?,
            Axis::TiltY => self.hardware.set_tilt_y(value.to_degrees())?,
        }
        self.tracker.record(axis, value);
        self.latch.mark();
        Ok(())
    }

    /// Applies optics settings in a fixed order, settles, then publishes.
    ///
    /// The magnification and the focus/brightness deltas are resolved before
    /// any hardware call, so an unknown value or an out-of-range step rejects
    /// the whole command untouched. Focus and brightness are
    /// cached per field as soon as their delta is accepted.
    pub(super) fn apply_scope_locked(&mut self, command: &ScopeCommand) -> BridgeResult<()> {
        let selection = match command.mag {
            Some(mag) => {
                let mode = command.effective_mag_mode();
                Some((mode, self.settings.tables.resolve(mode, mag)?))
            }
            None => None,
        };

        let focus = match command.focus {
            Some(focus) => Some((focus, self.scope.focus_delta(focus)?)),
            None => None,
        };
        let brightness = match command.brightness {
            Some(brightness) => Some((brightness, self.scope.brightness_delta(brightness)?)),
            None => None,
        };

        if let Some((focus, delta)) = focus {
            self.hardware.adjust_focus(delta)?;
            self.scope.focus = focus;
        }

        if let Some((brightness, delta)) = brightness {
            self.hardware.adjust_brightness(delta)?;
            self.scope.brightness = brightness;
        }

        if let Some((mode, index)) = selection {
            self.select_mode_with_retry(mode)?;
            self.hardware.set_selector(index)?;
        }

        if let Some(size) = command.spot_size {
            self.hardware.select_spot_size(size)?;
        }

        if let Some((x, y)) = command.beam_offset {
            self.hardware.set_beam_offset(x, y)?;
        }

        if let Some(screen) = command.screen {
            self.hardware.set_beam_blank(screen.is_blanked())?;
        }

        debug!(?command, "Scope command applied");

        if !self.settings.beam_settle.is_zero() {
            thread::sleep(self.settings.beam_settle);
        }

        self.publish_scope_status_locked(Instant::now())
    }

    /// Selects the function mode, retrying transient timeouts.
    ///
    /// One warning per retried attempt; the last timeout is returned once
    /// the attempts run out. Other failures are returned immediately.
    fn select_mode_with_retry(&mut self, mode: MagMode) -> HardwareResult<()> {
        let max_attempts = self.settings.mode_select_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.hardware.select_function_mode(mode.function_mode()) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_timeout() && attempt < max_attempts => {
                    warn!(
                        %mode,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Timed out selecting function mode, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use temlink_core::{DomainError, ScopeState, StageReadback};
    use temlink_protocol::Command;
    use tokio::sync::broadcast;
    use tracing_test::traced_test;

    use crate::bridge::{Bridge, BridgeError, BridgeSettings};
    use crate::bus::{Envelope, MessageBus};
    use crate::hardware::{HardwareCall, HardwareError, MockHardware, Operation};

    use super::*;

    struct Fixture {
        hw: MockHardware,
        bridge: Bridge<MockHardware>,
        rx: broadcast::Receiver<Envelope>,
    }

    fn fixture() -> Fixture {
        let hw = MockHardware::new();
        let bus = MessageBus::new(64);
        let rx = bus.subscribe();
        let settings = BridgeSettings {
            beam_settle: Duration::ZERO,
            ..Default::default()
        };
        let bridge = Bridge::new(hw.clone(), Arc::new(bus), settings).unwrap();
        Fixture { hw, bridge, rx }
    }

    fn drain(rx: &mut broadcast::Receiver<Envelope>) -> Vec<Envelope> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn scope(json: serde_json::Value) -> ScopeCommand {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_z_only_move_leaves_other_axes_alone() {
        let f = fixture();
        let before = f.bridge.setpoint();

        f.bridge
            .move_stage(&StageMotionCommand {
                z: Some(250.0),
                ..Default::default()
            })
            .unwrap();

        let after = f.bridge.setpoint();
        assert_eq!(after.z, 250.0);
        assert_eq!((after.x, after.y), (before.x, before.y));
        assert_eq!(f.hw.calls(), vec![HardwareCall::SetZ(250.0)]);
        assert!(f.bridge.latch().is_latched());
    }

    #[test]
    fn test_rotation_converts_radians_to_degrees() {
        let f = fixture();
        f.bridge
            .rotate_stage(&StageRotationCommand {
                angle_x: Some(std::f64::consts::FRAC_PI_2),
                angle_y: None,
            })
            .unwrap();

        let calls = f.hw.calls();
        assert_eq!(calls.len(), 1);
        let HardwareCall::SetTiltX(degrees) = calls[0] else {
            panic!("Expected SetTiltX, got {calls:?}");
        };
        assert!((degrees - 90.0).abs() < 1e-9);
        assert_eq!(f.bridge.setpoint().tilt_x, std::f64::consts::FRAC_PI_2);
    }

    #[test]
    fn test_failed_axis_keeps_its_setpoint() {
        let f = fixture();
        f.hw.inject(Operation::SetY, Operation::SetY.failure("limit switch"));

        let err = f
            .bridge
            .move_stage(&StageMotionCommand {
                x: Some(100.0),
                y: Some(200.0),
                z: Some(300.0),
            })
            .unwrap_err();

        assert!(matches!(err, BridgeError::Hardware(HardwareError::Failure { .. })));
        let setpoint = f.bridge.setpoint();
        assert_eq!(setpoint.x, 100.0);
        assert_eq!(setpoint.y, 0.0);
        assert_eq!(setpoint.z, 0.0);
    }

    #[test]
    fn test_brightness_sent_as_deltas() {
        let f = fixture();

        f.bridge.apply_scope(&scope(serde_json::json!({"brightness": 10}))).unwrap();
        f.bridge.apply_scope(&scope(serde_json::json!({"brightness": 25}))).unwrap();

        assert_eq!(
            f.hw.calls(),
            vec![HardwareCall::AdjustBrightness(10), HardwareCall::AdjustBrightness(15)]
        );
        assert_eq!(f.bridge.scope_state().brightness, 25);
        assert_eq!(f.hw.brightness(), 25);
    }

    #[test]
    fn test_failed_focus_delta_keeps_cache() {
        let f = fixture();
        f.bridge.apply_scope(&scope(serde_json::json!({"focus": 5}))).unwrap();
        f.hw.inject(Operation::AdjustFocus, Operation::AdjustFocus.timeout());

        assert!(f.bridge.apply_scope(&scope(serde_json::json!({"focus": 9}))).is_err());
        assert_eq!(f.bridge.scope_state().focus, 5);

        // the next delta is computed against the confirmed value
        f.bridge.apply_scope(&scope(serde_json::json!({"focus": 9}))).unwrap();
        assert_eq!(f.hw.calls().last(), Some(&HardwareCall::AdjustFocus(4)));
    }

    #[test]
    fn test_oversized_focus_step_rejected_before_hardware() {
        let mut f = fixture();
        f.bridge
            .apply_scope(&scope(serde_json::json!({"focus": -2_000_000_000})))
            .unwrap();
        drain(&mut f.rx);
        f.hw.clear_calls();

        let err = f
            .bridge
            .apply_scope(&scope(serde_json::json!({"focus": 2_000_000_000, "brightness": 4})))
            .unwrap_err();

        assert!(matches!(
            err,
            BridgeError::Domain(DomainError::InvalidFieldValue { ref field, .. }) if field == "focus"
        ));
        assert!(f.hw.calls().is_empty());
        assert_eq!(f.bridge.scope_state().focus, -2_000_000_000);
        assert_eq!(f.bridge.scope_state().focus, f.hw.focus());
        assert_eq!(f.bridge.scope_state().brightness, 0);
        assert!(drain(&mut f.rx).is_empty());
    }

    #[test]
    fn test_scope_fields_applied_in_order() {
        let f = fixture();
        f.bridge
            .apply_scope(&scope(serde_json::json!({
                "screen": "down",
                "beam_offset": [0.5, -0.5],
                "spot_size": 3,
                "mag_mode": "LM",
                "mag": 50,
                "brightness": 7,
                "focus": -2
            })))
            .unwrap();

        assert_eq!(
            f.hw.calls(),
            vec![
                HardwareCall::AdjustFocus(-2),
                HardwareCall::AdjustBrightness(7),
                HardwareCall::SelectFunctionMode(2),
                HardwareCall::SetSelector(0),
                HardwareCall::SelectSpotSize(3),
                HardwareCall::SetBeamOffset(0.5, -0.5),
                HardwareCall::SetBeamBlank(true),
            ]
        );
    }

    #[test]
    fn test_scope_command_publishes_status() {
        let mut f = fixture();
        f.bridge
            .apply_scope(&scope(serde_json::json!({"mag": 2000, "focus": 3})))
            .unwrap();

        let published = drain(&mut f.rx);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "scope.status");
        let payload = &published[0].payload;
        assert_eq!(payload["mag_mode"], "MAG");
        assert_eq!(payload["mag"], 2000);
        assert_eq!(payload["focus"], 3);
        assert_eq!(payload["aperture"], serde_json::Value::Null);
        assert_eq!(payload["screen"], "up");
    }

    #[test]
    fn test_unknown_mag_rejected_before_hardware() {
        let mut f = fixture();
        let err = f
            .bridge
            .apply_scope(&scope(serde_json::json!({
                "focus": 10,
                "mag_mode": "LM",
                "mag": 2000
            })))
            .unwrap_err();

        assert_eq!(
            err,
            BridgeError::Domain(DomainError::InvalidMagnification {
                mode: MagMode::LowMag,
                mag: 2000
            })
        );
        assert!(f.hw.calls().is_empty());
        assert_eq!(f.bridge.scope_state(), ScopeState::default());
        assert!(drain(&mut f.rx).is_empty());
    }

    #[test]
    fn test_mag_mode_without_mag_is_ignored() {
        let f = fixture();
        f.bridge.apply_scope(&scope(serde_json::json!({"mag_mode": "MAG2"}))).unwrap();
        assert!(f.hw.calls().is_empty());
    }

    #[traced_test]
    #[test]
    fn test_mode_select_retries_two_timeouts() {
        let f = fixture();
        f.hw.inject_timeouts(Operation::SelectFunctionMode, 2);

        f.bridge
            .handle(&Command::Scope(ScopeCommand {
                mag: Some(50),
                mag_mode: Some(MagMode::LowMag),
                ..Default::default()
            }))
            .unwrap();

        assert_eq!(
            f.hw.calls(),
            vec![
                HardwareCall::SelectFunctionMode(2),
                HardwareCall::SelectFunctionMode(2),
                HardwareCall::SelectFunctionMode(2),
                HardwareCall::SetSelector(0),
            ]
        );
        logs_assert(|lines: &[&str]| {
            let warnings = lines
                .iter()
                .filter(|line| line.contains("WARN"))
                .filter(|line| line.contains("Timed out selecting function mode"))
                .count();
            match warnings {
                2 => Ok(()),
                n => Err(format!("Expected 2 retry warnings, got {n}")),
            }
        });
    }

    #[traced_test]
    #[test]
    fn test_mode_select_gives_up_after_three_timeouts() {
        let f = fixture();
        f.hw.inject_timeouts(Operation::SelectFunctionMode, 3);
        let setpoint = f.bridge.setpoint();

        let err = f
            .bridge
            .apply_scope(&ScopeCommand {
                mag: Some(50),
                mag_mode: Some(MagMode::LowMag),
                ..Default::default()
            })
            .unwrap_err();

        assert!(err.is_transient());
        assert!(!f.hw.calls().contains(&HardwareCall::SetSelector(0)));
        assert_eq!(f.bridge.scope_state(), ScopeState::default());
        assert_eq!(f.bridge.setpoint(), setpoint);
        logs_assert(|lines: &[&str]| {
            let warnings = lines
                .iter()
                .filter(|line| line.contains("Timed out selecting function mode"))
                .count();
            match warnings {
                2 => Ok(()),
                n => Err(format!("Expected 2 retry warnings, got {n}")),
            }
        });
    }

    /// Fields applied before a failed mode select stay recorded, matching
    /// what the hardware already received; later fields are never sent.
    #[test]
    fn test_exhausted_mode_select_keeps_earlier_focus() {
        let f = fixture();
        f.hw.inject_timeouts(Operation::SelectFunctionMode, 3);

        let result = f.bridge.apply_scope(&scope(serde_json::json!({
            "focus": 5,
            "mag": 50,
            "mag_mode": "LM",
            "spot_size": 2
        })));

        assert!(matches!(result, Err(ref e) if e.is_transient()));
        assert_eq!(f.bridge.scope_state().focus, 5);
        assert_eq!(f.hw.focus(), 5);
        assert_eq!(
            f.hw.calls(),
            vec![
                HardwareCall::AdjustFocus(5),
                HardwareCall::SelectFunctionMode(2),
                HardwareCall::SelectFunctionMode(2),
                HardwareCall::SelectFunctionMode(2),
            ]
        );
    }

    #[test]
    fn test_other_mode_select_failures_not_retried() {
        let f = fixture();
        f.hw.inject(
            Operation::SelectFunctionMode,
            Operation::SelectFunctionMode.failure("interlock"),
        );

        let result = f.bridge.apply_scope(&ScopeCommand {
            mag: Some(2000),
            ..Default::default()
        });

        assert!(matches!(result, Err(ref e) if !e.is_transient()));
        assert_eq!(f.hw.calls(), vec![HardwareCall::SelectFunctionMode(0)]);
    }

    #[test]
    fn test_lock_released_after_failure() {
        let f = fixture();
        f.hw.inject(Operation::SetX, Operation::SetX.failure("fault"));
        assert!(f.bridge.move_stage(&StageMotionCommand { x: Some(1.0), ..Default::default() }).is_err());

        f.bridge
            .move_stage(&StageMotionCommand { x: Some(1.0), ..Default::default() })
            .unwrap();
        assert_eq!(f.bridge.setpoint().x, 1.0);
        assert_eq!(f.hw.readback(), StageReadback::default());
    }
}
