mod helpers;

use engram::state::{ServerRecord, StateStore};
use engram::supervisor::{port_bindable, Supervisor};
use helpers::test_config;
use std::net::TcpListener;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn is_running_false_without_record() {
    let tmp = TempDir::new().unwrap();
    let supervisor = Supervisor::new(test_config(&tmp));
    assert!(!supervisor.is_running());
}

#[test]
fn is_running_false_for_nonexistent_pid() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    StateStore::new(config.state_file())
        .save(&ServerRecord::new(999_999, 8001, "127.0.0.1"))
        .unwrap();

    let supervisor = Supervisor::new(config);
    assert!(!supervisor.is_running());
}

#[cfg(unix)]
#[test]
fn is_running_false_for_exited_process() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    StateStore::new(config.state_file())
        .save(&ServerRecord::new(helpers::dead_pid(), 8001, "127.0.0.1"))
        .unwrap();

    let supervisor = Supervisor::new(config);
    assert!(!supervisor.is_running());
}

#[test]
fn resolve_address_returns_recorded_url_without_verification() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    // A dead pid: resolve_address must not care.
    StateStore::new(config.state_file())
        .save(&ServerRecord::new(999_999, 8123, "127.0.0.1"))
        .unwrap();

    let supervisor = Supervisor::new(config);
    assert_eq!(
        supervisor.resolve_address().as_deref(),
        Some("http://127.0.0.1:8123")
    );
}

#[test]
fn resolve_address_absent_without_record() {
    let tmp = TempDir::new().unwrap();
    let supervisor = Supervisor::new(test_config(&tmp));
    assert!(supervisor.resolve_address().is_none());
}

#[test]
fn negotiation_reuses_recorded_port_when_still_bindable() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let port = helpers::free_port();
    StateStore::new(config.state_file())
        .save(&ServerRecord::new(999_999, port, "127.0.0.1"))
        .unwrap();

    let supervisor = Supervisor::new(config);
    assert_eq!(supervisor.negotiate_port(), port);
}

#[test]
fn negotiation_skips_recorded_port_held_by_another_listener() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);

    // Occupy a port and record it; scanning starts at the same port.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = listener.local_addr().unwrap().port();
    config.server.start_port = taken;
    StateStore::new(config.state_file())
        .save(&ServerRecord::new(999_999, taken, "127.0.0.1"))
        .unwrap();

    let supervisor = Supervisor::new(config);
    let negotiated = supervisor.negotiate_port();

    assert_ne!(negotiated, taken);
    assert!(negotiated > taken);
    assert!((negotiated as u32) < taken as u32 + 100);
    assert!(port_bindable("127.0.0.1", negotiated));
}

#[test]
fn start_reports_failure_when_binary_is_missing() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let supervisor = Supervisor::new(config.clone());

    assert!(!supervisor.start(false, Duration::from_secs(1)));
    // A failed launch must not leave a record behind.
    assert!(StateStore::new(config.state_file()).load().is_none());
}

#[test]
fn start_defers_to_a_live_lock_holder() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    std::fs::create_dir_all(config.servers_dir()).unwrap();
    std::fs::write(config.lock_file(), "12345").unwrap();

    let supervisor = Supervisor::new(config.clone());
    // Fire-and-forget mode: trusting the lock holder counts as success,
    // and no spawn is attempted (the configured binary does not exist).
    assert!(supervisor.start(false, Duration::from_secs(1)));
    assert!(StateStore::new(config.state_file()).load().is_none());
}

#[test]
fn waiting_start_observes_the_lock_holders_launch() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    std::fs::create_dir_all(config.servers_dir()).unwrap();
    std::fs::write(config.lock_file(), "12345").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    // The lock holder publishes its record a moment after this caller
    // begins waiting; readiness needs both the record and the listener.
    let state_file = config.state_file();
    let publisher = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(150));
        StateStore::new(state_file)
            .save(&ServerRecord::new(std::process::id(), port, "127.0.0.1"))
            .unwrap();
    });

    let supervisor = Supervisor::new(config);
    assert!(supervisor.start(true, Duration::from_secs(5)));
    publisher.join().unwrap();

    assert_eq!(
        supervisor.resolve_address().unwrap(),
        format!("http://127.0.0.1:{port}")
    );
    drop(listener);
}

#[test]
fn start_reclaims_a_stale_lock() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.supervisor.lock_stale_secs = 0;
    std::fs::create_dir_all(config.servers_dir()).unwrap();
    std::fs::write(config.lock_file(), "12345").unwrap();

    let supervisor = Supervisor::new(config);
    // The stale lock is removed and the launch proceeds, then fails because
    // the binary is missing. Deferring would have returned true.
    assert!(!supervisor.start(false, Duration::from_secs(1)));
}

#[test]
fn start_with_dead_pid_record_attempts_a_fresh_launch() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    StateStore::new(config.state_file())
        .save(&ServerRecord::new(999_999, 8001, "127.0.0.1"))
        .unwrap();

    let supervisor = Supervisor::new(config);
    assert!(!supervisor.is_running());
    // Not an "already running" no-op: the launch is attempted and fails
    // because the configured binary does not exist.
    assert!(!supervisor.start(false, Duration::from_secs(1)));
}

#[test]
fn stop_succeeds_with_nothing_to_stop() {
    let tmp = TempDir::new().unwrap();
    let supervisor = Supervisor::new(test_config(&tmp));
    assert!(supervisor.stop(Duration::from_secs(1)));
}

#[test]
fn stop_clears_record_of_dead_process() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    StateStore::new(config.state_file())
        .save(&ServerRecord::new(999_999, 8001, "127.0.0.1"))
        .unwrap();

    let supervisor = Supervisor::new(config.clone());
    assert!(supervisor.stop(Duration::from_secs(1)));
    assert!(StateStore::new(config.state_file()).load().is_none());
}

#[cfg(unix)]
#[test]
fn start_then_stop_a_real_detached_process() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    // Stub server: accepts the http-server argv and stays alive.
    config.server.bin = helpers::write_script(
        tmp.path(),
        "stub-server",
        "#!/bin/sh\nexec sleep 30\n",
    );

    let supervisor = Supervisor::new(config.clone()).with_session("test-session");

    // Fire-and-forget: success as soon as the process handle exists.
    assert!(supervisor.start(false, Duration::from_secs(1)));

    let record = StateStore::new(config.state_file()).load().unwrap();
    assert!(record.port >= config.server.start_port);
    assert!(record.port < config.server.start_port + config.server.port_scan_attempts);
    assert_eq!(record.session_id.as_deref(), Some("test-session"));
    assert!(supervisor.is_running());
    assert_eq!(
        supervisor.resolve_address().unwrap(),
        format!("http://127.0.0.1:{}", record.port)
    );

    // A second start is an idempotent no-op while the process lives.
    assert!(supervisor.start(false, Duration::from_secs(1)));
    let record_after = StateStore::new(config.state_file()).load().unwrap();
    assert_eq!(record_after.pid, record.pid);

    assert!(supervisor.stop(Duration::from_secs(5)));
    assert!(!supervisor.is_running());
    assert!(StateStore::new(config.state_file()).load().is_none());
}

#[cfg(unix)]
#[test]
fn start_with_wait_times_out_when_port_never_binds() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    // The stub never listens, so readiness can never be observed.
    config.server.bin = helpers::write_script(
        tmp.path(),
        "stub-server",
        "#!/bin/sh\nexec sleep 30\n",
    );

    let supervisor = Supervisor::new(config.clone());
    let started = std::time::Instant::now();
    assert!(!supervisor.start(true, Duration::from_millis(400)));
    assert!(started.elapsed() < Duration::from_secs(5));

    // The process itself was launched; clean it up.
    assert!(supervisor.stop(Duration::from_secs(5)));
}

#[test]
fn log_tail_returns_last_lines() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    std::fs::create_dir_all(config.servers_dir()).unwrap();
    let lines: Vec<String> = (1..=30).map(|i| format!("line {i}")).collect();
    std::fs::write(config.log_file(), lines.join("\n")).unwrap();

    let supervisor = Supervisor::new(config);
    let tail = supervisor.log_tail(20);
    assert_eq!(tail.len(), 20);
    assert_eq!(tail.first().unwrap(), "line 11");
    assert_eq!(tail.last().unwrap(), "line 30");
}
