use bitvec::prelude::*;
use jtag_dap::probe::{
    fake_probe::{FakeProbe, Operation},
    CommandQueue, CommandResult, JtagCommand, JtagEngine, JtagError, RegisterState, ScanCommand,
    ScanRegister, TapState,
};
use pretty_assertions::assert_eq;

#[test]
fn loopback_scan_captures_shifted_bits() {
    let probe = FakeProbe::new();
    let log = probe.operations();
    let mut engine = JtagEngine::new(Box::new(probe));

    let mut queue = CommandQueue::new();
    queue.schedule(JtagCommand::Reset {
        trst: true,
        srst: false,
    });
    queue.schedule(ScanCommand::ir(bitvec![u8, Lsb0; 0, 1, 0, 1]));
    let capture =
        queue.schedule(ScanCommand::dr(bitvec![u8, Lsb0; 1, 0, 1, 1, 0, 0, 1]).with_capture());

    let mut results = engine.execute(&queue).unwrap();

    assert_eq!(
        results.take(capture).unwrap(),
        CommandResult::Captured(bitvec![u8, Lsb0; 1, 0, 1, 1, 0, 0, 1])
    );
    assert_eq!(engine.tap_state(), TapState::Idle);

    let scans = log.scans();
    assert_eq!(scans.len(), 2);
    assert!(matches!(
        scans[0],
        Operation::Scan {
            register: ScanRegister::Ir,
            bits: 4,
            ..
        }
    ));
}

#[test]
fn scan_can_end_in_pause() {
    let mut engine = JtagEngine::new(Box::new(FakeProbe::new()));

    let mut queue = CommandQueue::new();
    queue.schedule(
        ScanCommand::dr(bitvec![u8, Lsb0; 1; 8])
            .with_end_state(TapState::Dr(RegisterState::Pause)),
    );
    engine.execute(&queue).unwrap();

    assert_eq!(engine.tap_state(), TapState::Dr(RegisterState::Pause));
}

#[test]
fn execution_stops_at_the_first_failure() {
    let mut engine = JtagEngine::new(Box::new(FakeProbe::new()));

    let mut queue = CommandQueue::new();
    let first = queue.schedule(ScanCommand::dr(bitvec![u8, Lsb0; 1, 1]).with_capture());
    queue.schedule(JtagCommand::PathMove {
        path: vec![TapState::Dr(RegisterState::Select)],
    });
    queue.schedule(ScanCommand::dr(bitvec![u8, Lsb0; 0, 1]).with_capture());

    let mut error = engine.execute(&queue).unwrap_err();

    assert_eq!(error.index, 1);
    assert!(matches!(error.error, JtagError::Unsupported("PathMove")));
    assert_eq!(error.results.len(), 1);
    assert!(error.results.take(first).is_ok());
}

#[test]
fn backend_failure_requires_a_reset() {
    // Call 0 is the scan.
    let mut engine = JtagEngine::new(Box::new(FakeProbe::new().fail_at_call(0)));

    let mut queue = CommandQueue::new();
    queue.schedule(ScanCommand::dr(bitvec![u8, Lsb0; 1]));
    assert!(engine.execute(&queue).is_err());
    assert!(!engine.is_state_trusted());

    let mut queue = CommandQueue::new();
    queue.schedule(ScanCommand::dr(bitvec![u8, Lsb0; 1]));
    let error = engine.execute(&queue).unwrap_err();
    assert!(matches!(error.error, JtagError::StateUntrusted));

    engine.move_to(TapState::Reset).unwrap();
    assert!(engine.is_state_trusted());
    assert_eq!(engine.tap_state(), TapState::Reset);
}
