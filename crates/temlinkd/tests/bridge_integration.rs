//! Integration tests for the bridge: motion pacing across ticks, the
//! control loop thread, and the simulated instrument.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use temlink_core::{MagnificationTables, StageReadback, Tolerances};
use temlink_protocol::{Command, ScopeCommand, StageMotionCommand, StageRotationCommand, Topic};
use temlinkd::bridge::{spawn_control_loop, Bridge, BridgeSettings};
use temlinkd::bus::{Envelope, MessageBus};
use temlinkd::hardware::{MockHardware, SimulatedInstrument, SimulatorSettings};

// ============================================================================
// Helpers
// ============================================================================

const MS: Duration = Duration::from_millis(1);

fn quiet_settings() -> BridgeSettings {
    BridgeSettings {
        beam_settle: Duration::ZERO,
        ..Default::default()
    }
}

fn drain(rx: &mut broadcast::Receiver<Envelope>) -> Vec<Envelope> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

fn on_topic(envelopes: &[Envelope], topic: Topic) -> Vec<&Envelope> {
    envelopes.iter().filter(|e| e.topic == topic.as_str()).collect()
}

// ============================================================================
// Pacing Scenario
// ============================================================================

/// Stage starts at the origin, is told to go to x=100 and converges.
#[test]
fn test_translation_scenario_paces_fast_then_slow() {
    let hw = MockHardware::at(StageReadback::default());
    let bus = MessageBus::new(256);
    let mut rx = bus.subscribe();
    let bridge = Bridge::new(hw.clone(), Arc::new(bus), quiet_settings()).unwrap();
    let start = bridge.timers().last_stage_status;

    assert!(!bridge.in_motion().unwrap());

    bridge
        .handle(&Command::decode(Topic::StageMotionCommand, json!({"x": 100})).unwrap().unwrap())
        .unwrap();
    assert!(bridge.in_motion().unwrap());

    // While moving, every tick past the 20 ms period publishes.
    let mut now = start;
    for _ in 0..5 {
        now += 21 * MS;
        let report = bridge.tick(now).unwrap();
        assert!(report.in_motion && report.fast && report.stage_published);
    }

    hw.settle();
    assert!(!bridge.in_motion().unwrap());

    // First tick after convergence: still fast, publishes the settled position.
    now += 21 * MS;
    let report = bridge.tick(now).unwrap();
    assert!(!report.in_motion);
    assert!(report.fast);
    assert!(report.stage_published);

    // Second tick: slow period, nothing due.
    now += 21 * MS;
    let report = bridge.tick(now).unwrap();
    assert!(!report.fast);
    assert!(!report.stage_published);

    let published = drain(&mut rx);
    let motion = on_topic(&published, Topic::StageMotionStatus);
    let rotation = on_topic(&published, Topic::StageRotationStatus);
    assert_eq!(motion.len(), 6);
    assert_eq!(rotation.len(), 6);

    for (m, r) in motion.iter().zip(&rotation) {
        assert_eq!(m.payload["in_motion"], r.payload["in_motion"]);
    }
    let last = motion.last().unwrap();
    assert_eq!(last.payload, json!({"x": 100, "y": 0, "z": 0, "in_motion": false}));
}

#[test]
fn test_rotation_scenario_uses_rotation_tolerance() {
    let hw = MockHardware::new();
    let settings = BridgeSettings {
        tolerances: Tolerances::new(60.0, 1.0_f64.to_radians()).unwrap(),
        ..quiet_settings()
    };
    let bridge = Bridge::new(hw.clone(), Arc::new(MessageBus::default()), settings).unwrap();

    bridge
        .rotate_stage(&StageRotationCommand {
            angle_x: Some(10.0_f64.to_radians()),
            angle_y: None,
        })
        .unwrap();
    assert!(bridge.in_motion().unwrap());

    // 9.5 degrees is within a 1 degree band of 10
    hw.set_readback(StageReadback::new(0.0, 0.0, 0.0, 9.5, 0.0));
    assert!(!bridge.in_motion().unwrap());
}

#[test]
fn test_failed_command_does_not_block_next_one() {
    let hw = MockHardware::new();
    let bridge = Bridge::new(hw.clone(), Arc::new(MessageBus::default()), quiet_settings()).unwrap();

    let bad = ScopeCommand {
        mag: Some(1234),
        ..Default::default()
    };
    assert!(bridge.apply_scope(&bad).is_err());

    bridge
        .move_stage(&StageMotionCommand {
            z: Some(5.0),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(bridge.setpoint().z, 5.0);
}

// ============================================================================
// Control Loop Thread
// ============================================================================

#[test]
fn test_control_loop_reports_simulated_move() {
    let simulator = SimulatorSettings {
        stage_speed: 1000.0,
        ..Default::default()
    };
    let hardware = SimulatedInstrument::connect(&simulator, MagnificationTables::default()).unwrap();

    let bus = MessageBus::new(4096);
    let mut rx = bus.subscribe();
    let bridge = Bridge::new(hardware, Arc::new(bus), quiet_settings()).unwrap();

    let cancel = CancellationToken::new();
    let handle =
        spawn_control_loop(bridge.clone(), Duration::from_millis(10), cancel.clone()).unwrap();

    bridge
        .move_stage(&StageMotionCommand {
            x: Some(200.0),
            ..Default::default()
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(500));
    cancel.cancel();
    handle.join().unwrap();

    let published = drain(&mut rx);
    let motion = on_topic(&published, Topic::StageMotionStatus);

    let moving = motion
        .iter()
        .filter(|e| e.payload["in_motion"] == json!(true))
        .count();
    assert!(moving >= 3, "expected several fast updates, got {moving}");

    // The tail publication lands once the stage is inside the band.
    let last = motion.last().unwrap();
    assert_eq!(last.payload["in_motion"], json!(false));
    assert!(last.payload["x"].as_i64().unwrap() >= 140);
    assert!(!bridge.in_motion().unwrap());
}
