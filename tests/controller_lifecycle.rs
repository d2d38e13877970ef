//! Lifecycle behavior of the background controller: start, stop,
//! status and live reconfiguration.

use std::thread::sleep;
use std::time::Duration;

use quorumsim::{
    ConfigError, ProtocolKind, SimConfig, SimError, SimulationController,
};

fn fast_config() -> SimConfig {
    SimConfig::new(ProtocolKind::ProofOfAuthority)
        .with_nodes(4)
        .with_delay(0.05)
        .with_seed(11)
}

#[test]
fn start_runs_rounds_and_stop_unloads() {
    let mut controller = SimulationController::new().with_pacing(Duration::from_millis(1));
    controller.start(fast_config()).unwrap();
    assert!(controller.is_running());

    // give the loop time to finalize at least one block
    for _ in 0..100 {
        if controller.status().metrics.blocks_finalized > 0 {
            break;
        }
        sleep(Duration::from_millis(5));
    }
    let snap = controller.status();
    assert!(snap.running);
    assert!(snap.metrics.blocks_finalized > 0, "no blocks finalized");
    assert_eq!(snap.protocol.as_deref(), Some("proof_of_authority"));

    controller.stop();
    assert!(!controller.is_running());
    let snap = controller.status();
    assert!(!snap.running);
    assert_eq!(snap.pending_deliveries, 0);
    assert!(snap.chain.is_empty(), "stop unloads the simulation");
}

#[test]
fn stop_is_idempotent() {
    let mut controller = SimulationController::new().with_pacing(Duration::from_millis(1));
    controller.start(fast_config()).unwrap();
    controller.stop();
    controller.stop();
    assert!(!controller.is_running());
    assert_eq!(controller.status().pending_deliveries, 0);
}

#[test]
fn stop_without_start_is_a_no_op() {
    let mut controller = SimulationController::new();
    controller.stop();
    let snap = controller.status();
    assert!(!snap.running);
    assert!(snap.protocol.is_none());
}

#[test]
fn start_while_running_is_rejected() {
    let mut controller = SimulationController::new().with_pacing(Duration::from_millis(1));
    controller.start(fast_config()).unwrap();
    assert!(matches!(
        controller.start(fast_config()),
        Err(SimError::AlreadyRunning)
    ));
    controller.stop();
    // after stopping, a fresh start succeeds
    controller.start(fast_config()).unwrap();
    controller.stop();
}

#[test]
fn invalid_config_is_rejected_synchronously() {
    let mut controller = SimulationController::new();
    let config = SimConfig::new(ProtocolKind::Pbft).with_nodes(2);
    let err = controller.start(config).unwrap_err();
    assert!(matches!(
        err,
        SimError::Config(ConfigError::TooFewNodes { required: 4, got: 2, .. })
    ));
    assert!(!controller.is_running());
}

#[test]
fn delay_can_change_while_running() {
    let mut controller = SimulationController::new().with_pacing(Duration::from_millis(1));
    assert!(matches!(
        controller.set_delay(0.2),
        Err(SimError::NotRunning)
    ));
    controller.start(fast_config()).unwrap();
    controller.set_delay(0.2).unwrap();
    assert!(controller.set_delay(f64::INFINITY).is_err());
    controller.stop();
}
