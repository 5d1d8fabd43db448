//! Motion detection and the one-tick hysteresis latch.

use temlink_core::{Axis, StageReadback, StageSetpoint, Tolerances};

/// Last commanded setpoint plus the tolerance bands it is judged with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionTracker {
    setpoint: StageSetpoint,
    tolerances: Tolerances,
}

impl MotionTracker {
    /// Seeds the tracker from a live readback so the stage starts at rest.
    pub fn seeded(readback: &StageReadback, tolerances: Tolerances) -> Self {
        Self {
            setpoint: StageSetpoint::from_readback(readback),
            tolerances,
        }
    }

    pub fn setpoint(&self) -> StageSetpoint {
        self.setpoint
    }

    pub fn tolerances(&self) -> Tolerances {
        self.tolerances
    }

    /// Records a confirmed command for `axis` (radians for tilt).
    pub fn record(&mut self, axis: Axis, value: f64) {
        self.setpoint.set_axis(axis, value);
    }

    /// First axis whose deviation strictly exceeds its tolerance.
    pub fn moving_axis(&self, readback: &StageReadback) -> Option<Axis> {
        Axis::ALL
            .into_iter()
            .find(|&axis| self.setpoint.deviation(readback, axis) > self.tolerances.for_axis(axis))
    }

    /// True when any single axis is outside its band.
    pub fn in_motion(&self, readback: &StageReadback) -> bool {
        self.moving_axis(readback).is_some()
    }
}

/// Motion verdict of the current tick and the sticky bit carried into the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MotionLatch {
    current: bool,
    latched: bool,
}

impl MotionLatch {
    /// Forces the next tick onto the fast period. Called after a stage move.
    pub fn mark(&mut self) {
        self.latched = true;
    }

    /// Feeds this tick's verdict and returns whether the fast period applies.
    ///
    /// Fast while moving and for exactly one tick after motion stops.
    pub fn advance(&mut self, in_motion: bool) -> bool {
        let fast = in_motion || self.latched;
        self.current = in_motion;
        self.latched = in_motion;
        fast
    }

    /// Verdict from the most recent tick.
    pub fn current(&self) -> bool {
        self.current
    }

    pub fn is_latched(&self) -> bool {
        self.latched
    }
}
