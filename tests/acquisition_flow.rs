//! End-to-end acquisition against the simulated tileboard.
//!
//! These tests drive the full connect → configure → start → poll → stop →
//! decode sequence and check both the returned table and the order in which
//! the board services saw each request.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tileboard_daq::client::Interrupt;
use tileboard_daq::sim::{Call, Role, SimConfig, SimulatedTileboard};
use tileboard_daq::{Acquisition, DaqError};

fn position(calls: &[Call], role: Role, message: &str) -> usize {
    calls
        .iter()
        .position(|c| c.role == role && c.message == message)
        .unwrap_or_else(|| panic!("{:?} never received {:?}", role, message))
}

fn last_position(calls: &[Call], role: Role, message: &str) -> usize {
    calls
        .iter()
        .rposition(|c| c.role == role && c.message == message)
        .unwrap_or_else(|| panic!("{:?} never received {:?}", role, message))
}

#[test]
fn test_acquire_returns_requested_events() {
    let dir = tempfile::tempdir().unwrap();
    let board = SimulatedTileboard::default();
    let settings = board.settings(dir.path(), "pedestal").unwrap();

    let mut acquisition = Acquisition::connect(&settings, Arc::new(board.clone())).unwrap();
    let table = acquisition.acquire(100).unwrap();

    assert_eq!(table.n_events(), 100);
    assert_eq!(board.written_files(), vec![dir.path().join("pedestal.raw")]);
    assert_eq!(acquisition.run_path(), dir.path().join("pedestal.raw"));

    // 2 halves x 39 channels
    let adc = table.column("adc").unwrap();
    assert_eq!(adc.width(), 78);
    assert_eq!(adc.rows(), Some(100));
    let event = table.column("event").unwrap();
    assert_eq!(event.get(99, 0), Some(99));
}

#[test]
fn test_sink_is_handled_before_instrument() {
    let dir = tempfile::tempdir().unwrap();
    let board = SimulatedTileboard::default();
    let settings = board.settings(dir.path(), "ordering").unwrap();

    Acquisition::connect(&settings, Arc::new(board.clone()))
        .unwrap()
        .acquire(10)
        .unwrap();
    let calls = board.calls();

    assert!(position(&calls, Role::Sink, "configure") < position(&calls, Role::Instrument, "configure"));
    // the sink must acknowledge "running" before the instrument is started
    assert!(last_position(&calls, Role::Sink, "start") < position(&calls, Role::Instrument, "start"));
    assert!(position(&calls, Role::Sink, "stop") < position(&calls, Role::Instrument, "stop"));
    // completion is polled before anything is stopped
    assert!(last_position(&calls, Role::Instrument, "run_done") < position(&calls, Role::Sink, "stop"));

    let stops = calls.iter().filter(|c| c.message == "stop").count();
    assert_eq!(stops, 2);
}

#[test]
fn test_run_settings_reach_the_board() {
    let dir = tempfile::tempdir().unwrap();
    let board = SimulatedTileboard::default();
    let settings = board.settings(dir.path(), "calib").unwrap();

    Acquisition::connect(&settings, Arc::new(board.clone()))
        .unwrap()
        .acquire(25)
        .unwrap();

    let instrument = board.configuration(Role::Instrument).unwrap();
    assert_eq!(
        instrument.get_path("daq.NEvents").and_then(|v| v.as_u64()),
        Some(25)
    );
    // untouched keys of the document are transmitted too
    assert_eq!(
        instrument
            .get_path("daq.l1a_settings.bx_spacing")
            .and_then(|v| v.as_u64()),
        Some(43)
    );

    let sink = board.configuration(Role::Sink).unwrap();
    assert_eq!(
        sink.get_path("client.run_type").and_then(|v| v.as_str()),
        Some("calib")
    );
    assert_eq!(
        sink.get_path("client.outputDirectory").and_then(|v| v.as_str()),
        Some(dir.path().to_str().unwrap())
    );
    assert_eq!(
        sink.get_path("client.hw_type").and_then(|v| v.as_str()),
        Some("TB")
    );
}

#[test]
fn test_connect_brings_up_slow_control() {
    let dir = tempfile::tempdir().unwrap();
    let board = SimulatedTileboard::default();
    let settings = board.settings(dir.path(), "run").unwrap();

    let mut acquisition = Acquisition::connect(&settings, Arc::new(board.clone())).unwrap();

    let slow = board.messages(Role::SlowControl);
    assert_eq!(slow[0], "initialize");
    assert!(slow.contains(&"set_gpio_direction 15".to_string()));
    assert_eq!(board.gpio(), (0b1111, 0b0011));

    acquisition.slow_control_mut().set_calib_dac(0, 512).unwrap();
    assert_eq!(acquisition.slow_control_mut().read_calib_dac(0).unwrap(), 512);
}

#[test]
fn test_consecutive_runs_reuse_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let board = SimulatedTileboard::default();
    let settings = board.settings(dir.path(), "repeat").unwrap();
    let mut acquisition = Acquisition::connect(&settings, Arc::new(board.clone())).unwrap();

    assert_eq!(acquisition.acquire(3).unwrap().n_events(), 3);
    assert_eq!(acquisition.acquire(7).unwrap().n_events(), 7);
    assert_eq!(board.written_files().len(), 2);
}

#[test]
fn test_raised_interrupt_abandons_start() {
    let dir = tempfile::tempdir().unwrap();
    let board = SimulatedTileboard::new(SimConfig {
        start_after: 1000,
        ..SimConfig::default()
    });
    let settings = board.settings(dir.path(), "never").unwrap();
    let interrupt: Arc<dyn Interrupt> = Arc::new(AtomicBool::new(true));

    let mut acquisition = Acquisition::connect(&settings, Arc::new(board.clone()))
        .unwrap()
        .with_interrupt(interrupt);
    let err = acquisition.acquire(10).unwrap_err();

    assert!(matches!(err, DaqError::Interrupted(_)));
    // cleanup still stops both sides
    assert_eq!(board.messages(Role::Sink).last().map(String::as_str), Some("stop"));
    assert_eq!(
        board.messages(Role::Instrument).last().map(String::as_str),
        Some("stop")
    );
}
