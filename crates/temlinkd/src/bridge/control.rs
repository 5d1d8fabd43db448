//! Control loop: one motion evaluation per tick, adaptive stage pacing,
//! fixed-rate scope pacing.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Bridge, BridgeResult, BridgeState};
use crate::hardware::HardwareFacade;

/// Log every Nth consecutive tick failure at warn level.
const FAILURE_LOG_EVERY: u64 = 100;

/// What one tick observed and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    /// Motion verdict from this tick's readback
    pub in_motion: bool,

    /// Whether the fast stage period applied
    pub fast: bool,

    pub stage_published: bool,
    pub scope_published: bool,
}

/// A publish is due once strictly more than `period` has elapsed.
fn is_due(last: Instant, now: Instant, period: Duration) -> bool {
    now.saturating_duration_since(last) > period
}

impl<H: HardwareFacade> BridgeState<H> {
    pub(super) fn tick_locked(&mut self, now: Instant) -> BridgeResult<TickReport> {
        let readback = self.hardware.stage_position()?;
        let in_motion = self.tracker.in_motion(&readback);
        let fast = self.latch.advance(in_motion);

        let mut report = TickReport {
            in_motion,
            fast,
            ..Default::default()
        };

        let stage_period = if fast {
            self.settings.fast_stage_period
        } else {
            self.settings.slow_stage_period
        };

        // Both streams get their chance; the first failure is reported.
        let mut failure = None;

        if is_due(self.timers.last_stage_status, now, stage_period) {
            match self.publish_stage_status_locked(&readback, in_motion, now) {
                Ok(()) => report.stage_published = true,
                Err(e) => failure = Some(e),
            }
        }

        if is_due(self.timers.last_scope_status, now, self.settings.scope_period) {
            match self.publish_scope_status_locked(now) {
                Ok(()) => report.scope_published = true,
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

/// Starts the control loop on a dedicated OS thread.
///
/// Every hardware call blocks, so the loop stays off the async runtime.
/// The thread exits once `cancel_token` is cancelled.
pub fn spawn_control_loop<H>(
    bridge: Bridge<H>,
    tick: Duration,
    cancel_token: CancellationToken,
) -> std::io::Result<JoinHandle<()>>
where
    H: HardwareFacade + 'static,
{
    thread::Builder::new()
        .name("control-loop".to_string())
        .spawn(move || run_control_loop(&bridge, tick, &cancel_token))
}

fn run_control_loop<H: HardwareFacade>(
    bridge: &Bridge<H>,
    tick: Duration,
    cancel_token: &CancellationToken,
) {
    info!(tick_ms = tick.as_millis() as u64, "Control loop started");

    let mut consecutive_failures: u64 = 0;

    while !cancel_token.is_cancelled() {
        let started = Instant::now();

        match bridge.tick(started) {
            Ok(_) => {
                if consecutive_failures > 0 {
                    info!(
                        failed_ticks = consecutive_failures,
                        "Control loop recovered"
                    );
                    consecutive_failures = 0;
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures % FAILURE_LOG_EVERY == 1 {
                    warn!(
                        error = %e,
                        consecutive_failures,
                        "Control loop tick failed"
                    );
                } else {
                    debug!(error = %e, "Control loop tick failed");
                }
            }
        }

        if let Some(remaining) = tick.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }

    info!("Control loop stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use temlink_core::StageReadback;
    use temlink_protocol::StageMotionCommand;

    use crate::bridge::{BridgeError, BridgeSettings};
    use crate::bus::{ChannelError, MessageBus, MessageChannel};
    use crate::hardware::{MockHardware, Operation};

    use super::*;

    /// Forwards to a bus but refuses every stage topic.
    struct StageRejectingChannel(MessageBus);

    impl MessageChannel for StageRejectingChannel {
        fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), ChannelError> {
            if topic.starts_with("stage.") {
                return Err(ChannelError::Closed);
            }
            self.0.publish(topic, payload)
        }
    }

    const MS: Duration = Duration::from_millis(1);

    fn bridge_with(hw: &MockHardware) -> (Bridge<MockHardware>, Instant) {
        let bridge = Bridge::new(
            hw.clone(),
            Arc::new(MessageBus::default()),
            BridgeSettings {
                beam_settle: Duration::ZERO,
                ..Default::default()
            },
        )
        .unwrap();
        let start = bridge.timers().last_stage_status;
        (bridge, start)
    }

    #[test]
    fn test_is_due_is_strict() {
        let start = Instant::now();
        let period = Duration::from_millis(20);
        assert!(!is_due(start, start + period, period));
        assert!(is_due(start, start + period + MS, period));
        assert!(!is_due(start + period, start, period));
    }

    #[test]
    fn test_idle_stage_uses_slow_period() {
        let hw = MockHardware::new();
        let (bridge, start) = bridge_with(&hw);

        let report = bridge.tick(start + 30 * MS).unwrap();
        assert!(!report.fast);
        assert!(!report.stage_published);

        let report = bridge.tick(start + 1001 * MS).unwrap();
        assert!(report.stage_published);
        assert!(report.scope_published);
    }

    #[test]
    fn test_motion_switches_to_fast_period_with_one_tick_tail() {
        let hw = MockHardware::new();
        let (bridge, start) = bridge_with(&hw);

        bridge
            .move_stage(&StageMotionCommand {
                x: Some(100.0),
                ..Default::default()
            })
            .unwrap();
        assert!(bridge.in_motion().unwrap());

        // moving: fast period
        let report = bridge.tick(start + 25 * MS).unwrap();
        assert!(report.in_motion && report.fast && report.stage_published);

        // converged: one more fast tick
        hw.settle();
        let report = bridge.tick(start + 50 * MS).unwrap();
        assert!(!report.in_motion);
        assert!(report.fast);
        assert!(report.stage_published);

        // then back to the slow period
        let report = bridge.tick(start + 75 * MS).unwrap();
        assert!(!report.fast);
        assert!(!report.stage_published);
    }

    #[test]
    fn test_scope_pacing_ignores_motion() {
        let hw = MockHardware::new();
        let (bridge, start) = bridge_with(&hw);
        hw.set_readback(StageReadback::new(500.0, 0.0, 0.0, 0.0, 0.0));

        let report = bridge.tick(start + 500 * MS).unwrap();
        assert!(report.fast && report.stage_published);
        assert!(!report.scope_published);

        let report = bridge.tick(start + 1100 * MS).unwrap();
        assert!(report.scope_published);
    }

    #[test]
    fn test_failed_stage_publish_still_publishes_scope() {
        let bus = MessageBus::default();
        let mut rx = bus.subscribe();
        let bridge = Bridge::new(
            MockHardware::new(),
            Arc::new(StageRejectingChannel(bus)),
            BridgeSettings::default(),
        )
        .unwrap();
        let start = bridge.timers().last_scope_status;
        let now = start + 1001 * MS;

        let err = bridge.tick(now).unwrap_err();

        assert_eq!(err, BridgeError::Channel(ChannelError::Closed));
        assert_eq!(rx.try_recv().unwrap().topic, "scope.status");
        assert_eq!(bridge.timers().last_scope_status, now);
        assert_eq!(bridge.timers().last_stage_status, now);
    }

    #[test]
    fn test_failed_readback_leaves_latch_alone() {
        let hw = MockHardware::new();
        let (bridge, start) = bridge_with(&hw);
        bridge
            .move_stage(&StageMotionCommand {
                y: Some(90.0),
                ..Default::default()
            })
            .unwrap();

        hw.inject(Operation::StagePosition, Operation::StagePosition.timeout());
        assert!(bridge.tick(start + 10 * MS).is_err());
        assert!(bridge.latch().is_latched());
    }

    #[test]
    fn test_control_loop_stops_on_cancel() {
        let hw = MockHardware::new();
        let (bridge, _) = bridge_with(&hw);
        let cancel = CancellationToken::new();

        let handle = spawn_control_loop(bridge, Duration::from_millis(1), cancel.clone()).unwrap();
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        handle.join().unwrap();
    }
}
