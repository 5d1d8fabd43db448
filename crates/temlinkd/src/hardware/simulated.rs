//! Simulated microscope.
//!
//! Stands in for a vendor binding. Stage axes travel toward their target at
//! a finite speed, so commands produce a visible stretch of "in motion"
//! before the readback converges.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use temlink_core::{Axis, MagnificationTables, StageReadback};
use tracing::{debug, info};

use super::{HardwareError, HardwareFacade, HardwareResult};

/// Accelerating voltage reported by the simulator, in volts.
pub const DEFAULT_TANK_VOLTAGE: f64 = 200_000.0;

/// Simulator knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    /// Translation speed, device units per second
    pub stage_speed: f64,

    /// Tilt speed, degrees per second
    pub tilt_speed_deg: f64,

    /// Accelerating voltage, volts
    pub tank_voltage: f64,

    /// Stage position at power-on
    pub initial_position: StageReadback,

    /// When false, `connect` fails as if the link were down
    pub online: bool,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            stage_speed: 2000.0,
            tilt_speed_deg: 10.0,
            tank_voltage: DEFAULT_TANK_VOLTAGE,
            initial_position: StageReadback::default(),
            online: true,
        }
    }
}

/// Straight-line travel of one axis.
#[derive(Debug, Clone, Copy)]
struct Travel {
    from: f64,
    to: f64,
    started: Instant,
    speed: f64,
}

impl Travel {
    fn at_rest(position: f64, speed: f64) -> Self {
        Self {
            from: position,
            to: position,
            started: Instant::now(),
            speed,
        }
    }

    fn position_at(&self, now: Instant) -> f64 {
        let distance = self.to - self.from;
        if self.speed <= 0.0 {
            return self.to;
        }
        let covered = self.speed * now.saturating_duration_since(self.started).as_secs_f64();
        if covered >= distance.abs() {
            self.to
        } else {
            self.from + covered * distance.signum()
        }
    }

    fn retarget(&mut self, to: f64, now: Instant) {
        self.from = self.position_at(now);
        self.to = to;
        self.started = now;
    }
}

/// In-process microscope model.
#[derive(Debug)]
pub struct SimulatedInstrument {
    axes: [Travel; 5],
    focus: i32,
    brightness: i32,
    function_mode: u8,
    selector: u32,
    spot_size: u8,
    beam_offset: (f64, f64),
    beam_blank: bool,
    tank_voltage: f64,
    tables: MagnificationTables,
}

impl SimulatedInstrument {
    /// Opens the simulated link.
    ///
    /// # Errors
    ///
    /// `HardwareError::Connection` when `settings.online` is false.
    pub fn connect(
        settings: &SimulatorSettings,
        tables: MagnificationTables,
    ) -> HardwareResult<Self> {
        if !settings.online {
            return Err(HardwareError::Connection(
                "simulated instrument is offline".to_string(),
            ));
        }

        let start = settings.initial_position;
        let linear = |v| Travel::at_rest(v, settings.stage_speed);
        let angular = |v| Travel::at_rest(v, settings.tilt_speed_deg);

        info!(
            stage_speed = settings.stage_speed,
            tilt_speed_deg = settings.tilt_speed_deg,
            "Simulated instrument connected"
        );

        Ok(Self {
            axes: [
                linear(start.x),
                linear(start.y),
                linear(start.z),
                angular(start.tilt_x_deg),
                angular(start.tilt_y_deg),
            ],
            focus: 0,
            brightness: 0,
            function_mode: 0,
            selector: 0,
            spot_size: 1,
            beam_offset: (0.0, 0.0),
            beam_blank: false,
            tank_voltage: settings.tank_voltage,
            tables,
        })
    }

    fn travel_mut(&mut self, axis: Axis) -> &mut Travel {
        let [x, y, z, tx, ty] = &mut self.axes;
        match axis {
            Axis::X => x,
            Axis::Y => y,
            Axis::Z => z,
            Axis::TiltX => tx,
            Axis::TiltY => ty,
        }
    }

    fn drive(&mut self, axis: Axis, target: f64) -> HardwareResult<()> {
        if !target.is_finite() {
            return Err(HardwareError::Failure {
                operation: "set_position",
                reason: format!("non-finite target {target} for {axis}"),
            });
        }
        debug!(axis = %axis, target, "Simulated stage retargeted");
        self.travel_mut(axis).retarget(target, Instant::now());
        Ok(())
    }

    /// Returns true while any axis is still travelling.
    pub fn is_travelling(&self) -> bool {
        let now = Instant::now();
        self.axes
            .iter()
            .any(|travel| (travel.position_at(now) - travel.to).abs() > f64::EPSILON)
    }

    /// Net focus offset accumulated from deltas.
    pub fn focus(&self) -> i32 {
        self.focus
    }

    /// Net brightness accumulated from deltas.
    pub fn brightness(&self) -> i32 {
        self.brightness
    }
}

impl HardwareFacade for SimulatedInstrument {
    fn stage_position(&self) -> HardwareResult<StageReadback> {
        let now = Instant::now();
        let [x, y, z, tx, ty] = self.axes.map(|travel| travel.position_at(now));
        Ok(StageReadback::new(x, y, z, tx, ty))
    }

    fn set_x(&mut self, x: f64) -> HardwareResult<()> {
        self.drive(Axis::X, x)
    }

    fn set_y(&mut self, y: f64) -> HardwareResult<()> {
        self.drive(Axis::Y, y)
    }

    fn set_z(&mut self, z: f64) -> HardwareResult<()> {
        self.drive(Axis::Z, z)
    }

    fn set_tilt_x(&mut self, degrees: f64) -> HardwareResult<()> {
        self.drive(Axis::TiltX, degrees)
    }

    fn set_tilt_y(&mut self, degrees: f64) -> HardwareResult<()> {
        self.drive(Axis::TiltY, degrees)
    }

    fn adjust_focus(&mut self, delta: i32) -> HardwareResult<()> {
        self.focus = self.focus.saturating_add(delta);
        Ok(())
    }

    fn adjust_brightness(&mut self, delta: i32) -> HardwareResult<()> {
        self.brightness = self.brightness.saturating_add(delta);
        Ok(())
    }

    fn select_function_mode(&mut self, mode: u8) -> HardwareResult<()> {
        if mode > 4 {
            return Err(HardwareError::Failure {
                operation: "select_function_mode",
                reason: format!("unknown function mode {mode}"),
            });
        }
        self.function_mode = mode;
        Ok(())
    }

    fn function_mode(&self) -> HardwareResult<u8> {
        Ok(self.function_mode)
    }

    fn set_selector(&mut self, index: u32) -> HardwareResult<()> {
        if self.tables.value_for(self.function_mode, index).is_none() {
            return Err(HardwareError::Failure {
                operation: "set_selector",
                reason: format!(
                    "selector {index} out of range for function mode {}",
                    self.function_mode
                ),
            });
        }
        self.selector = index;
        Ok(())
    }

    fn mag_value(&self) -> HardwareResult<u32> {
        Ok(self
            .tables
            .value_for(self.function_mode, self.selector)
            .unwrap_or_default())
    }

    fn select_spot_size(&mut self, size: u8) -> HardwareResult<()> {
        self.spot_size = size;
        Ok(())
    }

    fn spot_size(&self) -> HardwareResult<u8> {
        Ok(self.spot_size)
    }

    fn set_beam_offset(&mut self, x: f64, y: f64) -> HardwareResult<()> {
        self.beam_offset = (x, y);
        Ok(())
    }

    fn beam_offset(&self) -> HardwareResult<(f64, f64)> {
        Ok(self.beam_offset)
    }

    fn set_beam_blank(&mut self, blanked: bool) -> HardwareResult<()> {
        self.beam_blank = blanked;
        Ok(())
    }

    fn beam_blank(&self) -> HardwareResult<bool> {
        Ok(self.beam_blank)
    }

    fn accelerating_voltage(&self) -> HardwareResult<f64> {
        Ok(self.tank_voltage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn instrument() -> SimulatedInstrument {
        SimulatedInstrument::connect(&SimulatorSettings::default(), MagnificationTables::default())
            .unwrap()
    }

    #[test]
    fn test_offline_connect_fails() {
        let settings = SimulatorSettings {
            online: false,
            ..Default::default()
        };
        let err = SimulatedInstrument::connect(&settings, MagnificationTables::default())
            .unwrap_err();
        assert!(matches!(err, HardwareError::Connection(_)));
    }

    #[test]
    fn test_travel_interpolates_and_clamps() {
        let start = Instant::now();
        let travel = Travel {
            from: 0.0,
            to: 100.0,
            started: start,
            speed: 50.0,
        };
        assert_eq!(travel.position_at(start), 0.0);
        assert!((travel.position_at(start + Duration::from_secs(1)) - 50.0).abs() < 1e-9);
        assert_eq!(travel.position_at(start + Duration::from_secs(5)), 100.0);

        let reverse = Travel {
            from: 10.0,
            to: -10.0,
            started: start,
            speed: 10.0,
        };
        assert!((reverse.position_at(start + Duration::from_secs(1))).abs() < 1e-9);
    }

    #[test]
    fn test_stage_starts_at_rest() {
        let sim = instrument();
        assert!(!sim.is_travelling());
        assert_eq!(sim.stage_position().unwrap(), StageReadback::default());
    }

    #[test]
    fn test_stage_moves_toward_target() {
        let settings = SimulatorSettings {
            stage_speed: 1.0,
            ..Default::default()
        };
        let mut sim = SimulatedInstrument::connect(&settings, MagnificationTables::default())
            .unwrap();
        sim.set_x(1000.0).unwrap();
        assert!(sim.is_travelling());
        assert!(sim.stage_position().unwrap().x < 1000.0);
    }

    #[test]
    fn test_selector_must_exist_in_table() {
        let mut sim = instrument();
        assert!(sim.set_selector(3).is_err());
        sim.select_function_mode(2).unwrap();
        sim.set_selector(0).unwrap();
        assert_eq!(sim.mag_value().unwrap(), 50);
    }

    #[test]
    fn test_deltas_accumulate() {
        let mut sim = instrument();
        sim.adjust_brightness(10).unwrap();
        sim.adjust_brightness(15).unwrap();
        sim.adjust_focus(-4).unwrap();
        assert_eq!(sim.brightness(), 25);
        assert_eq!(sim.focus(), -4);
    }
}
