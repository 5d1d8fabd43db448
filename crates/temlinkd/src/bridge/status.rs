//! Status publication. Both publishers run with the bridge lock held.

use std::time::Instant;

use temlink_core::{ReportedMagMode, ScreenPosition, StageReadback};
use temlink_protocol::{ScopeStatus, StageMotionStatus, StageRotationStatus, Topic};

use super::{BridgeResult, BridgeState};
use crate::bus::publish_typed;
use crate::hardware::HardwareFacade;

/// When each status stream was last published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicationTimers {
    pub last_stage_status: Instant,
    pub last_scope_status: Instant,
}

impl PublicationTimers {
    pub fn starting_at(now: Instant) -> Self {
        Self {
            last_stage_status: now,
            last_scope_status: now,
        }
    }
}

impl<H: HardwareFacade> BridgeState<H> {
    /// Publishes translation and rotation status from one readback and one verdict.
    ///
    /// The timer is stamped before publishing so a failing channel does not
    /// turn every tick into a retry.
    pub(super) fn publish_stage_status_locked(
        &mut self,
        readback: &StageReadback,
        in_motion: bool,
        now: Instant,
    ) -> BridgeResult<()> {
        self.timers.last_stage_status = now;

        let motion = StageMotionStatus::from_readback(readback, in_motion);
        let rotation = StageRotationStatus::from_readback(readback, in_motion);

        publish_typed(self.channel.as_ref(), Topic::StageMotionStatus, &motion)?;
        publish_typed(self.channel.as_ref(), Topic::StageRotationStatus, &rotation)?;
        Ok(())
    }

    /// Reads the optics and publishes `scope.status`.
    ///
    /// Focus and brightness come from the local cache.
    pub(super) fn publish_scope_status_locked(&mut self, now: Instant) -> BridgeResult<()> {
        self.timers.last_scope_status = now;

        let hw = &self.hardware;
        let status = ScopeStatus {
            focus: self.scope.focus,
            aperture: None,
            mag_mode: ReportedMagMode::from_function_mode(hw.function_mode()?),
            mag: hw.mag_value()?,
            tank_voltage: hw.accelerating_voltage()?,
            spot_size: hw.spot_size()?,
            beam_offset: hw.beam_offset()?,
            screen: ScreenPosition::from_beam_blank(hw.beam_blank()?),
            brightness: self.scope.brightness,
        };

        publish_typed(self.channel.as_ref(), Topic::ScopeStatus, &status)?;
        Ok(())
    }
}
