//! The instrument bridge: command handlers, motion tracking, status
//! publication and the control loop, all behind one lock.
//!
//! # Architecture
//!
//! ```text
//!  command router ──┐                      ┌──▶ MessageChannel
//!  (blocking pool)  │   ┌──────────────┐   │    (status topics)
//!                   ├──▶│ BridgeState  │───┤
//!  control loop  ───┘   │  hardware    │   │
//!  (std thread)         │  tracker     │   └──▶ HardwareFacade
//!                       │  latch       │
//!                       │  scope cache │
//!                       │  timers      │
//!                       └──────────────┘
//!                    parking_lot::Mutex
//! ```
//!
//! Every public [`Bridge`] method takes the lock once for its whole body.
//! Nested work (a scope command publishing its status, a tick publishing
//! stage status) goes through `*_locked` helpers on `&mut BridgeState`, so
//! the lock is never re-entered.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - The lock guard is scoped; every exit path, including errors, releases it
//! - Tracked state is only written after the hardware accepted the change

mod control;
mod handlers;
mod motion;
mod status;

pub use control::{spawn_control_loop, TickReport};
pub use motion::{MotionLatch, MotionTracker};
pub use status::PublicationTimers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use temlink_core::{
    DomainError, MagnificationTables, ScopeState, StageReadback, StageSetpoint, Tolerances,
};
use temlink_protocol::{Command, ScopeCommand, StageMotionCommand, StageRotationCommand};
use thiserror::Error;
use tracing::info;

use crate::bus::{ChannelError, MessageChannel};
use crate::hardware::{HardwareError, HardwareFacade};

/// Default beam settle delay after a scope command.
pub const DEFAULT_BEAM_SETTLE: Duration = Duration::from_millis(200);

/// Default stage status period while the stage is moving (50 Hz).
pub const DEFAULT_FAST_STAGE_PERIOD: Duration = Duration::from_millis(20);

/// Default stage status period while the stage is idle.
pub const DEFAULT_SLOW_STAGE_PERIOD: Duration = Duration::from_secs(1);

/// Default scope status period.
pub const DEFAULT_SCOPE_PERIOD: Duration = Duration::from_secs(1);

/// Default total attempts for function-mode selection.
pub const DEFAULT_MODE_SELECT_ATTEMPTS: u32 = 3;

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by bridge operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Rejected command: {0}")]
    Domain(#[from] DomainError),

    #[error("Publish failed: {0}")]
    Channel(#[from] ChannelError),
}

impl BridgeError {
    /// True for hardware timeouts, which the next attempt may not hit.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Hardware(e) if e.is_timeout())
    }
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

// ============================================================================
// Settings
// ============================================================================

/// Tunables of the bridge, fixed at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeSettings {
    pub tolerances: Tolerances,
    pub tables: MagnificationTables,
    pub beam_settle: Duration,
    pub fast_stage_period: Duration,
    pub slow_stage_period: Duration,
    pub scope_period: Duration,
    pub mode_select_attempts: u32,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            tolerances: Tolerances::default(),
            tables: MagnificationTables::default(),
            beam_settle: DEFAULT_BEAM_SETTLE,
            fast_stage_period: DEFAULT_FAST_STAGE_PERIOD,
            slow_stage_period: DEFAULT_SLOW_STAGE_PERIOD,
            scope_period: DEFAULT_SCOPE_PERIOD,
            mode_select_attempts: DEFAULT_MODE_SELECT_ATTEMPTS,
        }
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// Everything guarded by the bridge lock.
pub(crate) struct BridgeState<H> {
    hardware: H,
    channel: Arc<dyn MessageChannel>,
    tracker: MotionTracker,
    latch: MotionLatch,
    scope: ScopeState,
    timers: PublicationTimers,
    settings: BridgeSettings,
}

/// Cheap-to-clone handle on the shared bridge state.
pub struct Bridge<H> {
    inner: Arc<Mutex<BridgeState<H>>>,
}

impl<H> Clone for Bridge<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: HardwareFacade> Bridge<H> {
    /// Creates the bridge from an initial hardware readback.
    ///
    /// The setpoint is seeded from the live position, so the stage is not
    /// reported as moving at startup. Focus and brightness start at zero;
    /// the instrument has no absolute readback for either.
    ///
    /// # Errors
    ///
    /// Fails if the initial stage readback fails.
    pub fn new(
        hardware: H,
        channel: Arc<dyn MessageChannel>,
        settings: BridgeSettings,
    ) -> BridgeResult<Self> {
        let readback = hardware.stage_position()?;
        let tracker = MotionTracker::seeded(&readback, settings.tolerances);

        info!(
            x = readback.x,
            y = readback.y,
            z = readback.z,
            tilt_x_deg = readback.tilt_x_deg,
            tilt_y_deg = readback.tilt_y_deg,
            "Bridge seeded from live stage position"
        );

        let state = BridgeState {
            hardware,
            channel,
            tracker,
            latch: MotionLatch::default(),
            scope: ScopeState::default(),
            timers: PublicationTimers::starting_at(Instant::now()),
            settings,
        };

        Ok(Self {
            inner: Arc::new(Mutex::new(state)),
        })
    }

    /// Applies a translation command.
    pub fn move_stage(&self, command: &StageMotionCommand) -> BridgeResult<()> {
        self.inner.lock().move_stage_locked(command)
    }

    /// Applies a rotation command (angles in radians).
    pub fn rotate_stage(&self, command: &StageRotationCommand) -> BridgeResult<()> {
        self.inner.lock().rotate_stage_locked(command)
    }

    /// Applies a scope command and publishes the resulting scope status.
    pub fn apply_scope(&self, command: &ScopeCommand) -> BridgeResult<()> {
        self.inner.lock().apply_scope_locked(command)
    }

    /// Dispatches a decoded command to its handler.
    pub fn handle(&self, command: &Command) -> BridgeResult<()> {
        match command {
            Command::StageMotion(cmd) => self.move_stage(cmd),
            Command::StageRotation(cmd) => self.rotate_stage(cmd),
            Command::Scope(cmd) => self.apply_scope(cmd),
        }
    }

    /// Runs one control-loop step at time `now`.
    pub fn tick(&self, now: Instant) -> BridgeResult<TickReport> {
        self.inner.lock().tick_locked(now)
    }

    /// Compares the live readback against the last setpoint.
    pub fn in_motion(&self) -> BridgeResult<bool> {
        let state = self.inner.lock();
        let readback = state.hardware.stage_position()?;
        Ok(state.tracker.in_motion(&readback))
    }

    /// Reads the stage and publishes both stage status messages now.
    pub fn publish_stage_status(&self) -> BridgeResult<()> {
        let mut state = self.inner.lock();
        let readback = state.hardware.stage_position()?;
        let in_motion = state.tracker.in_motion(&readback);
        state.publish_stage_status_locked(&readback, in_motion, Instant::now())
    }

    /// Reads the optics and publishes scope status now.
    pub fn publish_scope_status(&self) -> BridgeResult<()> {
        self.inner.lock().publish_scope_status_locked(Instant::now())
    }

    /// Last commanded stage position.
    pub fn setpoint(&self) -> StageSetpoint {
        self.inner.lock().tracker.setpoint()
    }

    /// Last confirmed focus and brightness.
    pub fn scope_state(&self) -> ScopeState {
        self.inner.lock().scope
    }

    pub fn latch(&self) -> MotionLatch {
        self.inner.lock().latch
    }

    pub fn timers(&self) -> PublicationTimers {
        self.inner.lock().timers
    }

    /// Live stage position, read under the lock.
    pub fn readback(&self) -> BridgeResult<StageReadback> {
        Ok(self.inner.lock().hardware.stage_position()?)
    }

    pub fn settings(&self) -> BridgeSettings {
        self.inner.lock().settings.clone()
    }
}
