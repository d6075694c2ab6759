//! Singleton server lifecycle: discovery, start, readiness, stop.
//!
//! [`Supervisor`] guarantees that after a successful [`Supervisor::start`] a
//! specific address is reachable, launching the external server binary if
//! necessary without creating duplicate instances. Process liveness and
//! listener liveness are different facts: both must hold before a request is
//! attempted, so readiness checks the state record and the negotiated port
//! independently.
//!
//! Every public operation is defensive. OS errors, timeouts, and missing
//! files become boolean failures or `None`, never panics: callers are
//! short-lived hook processes that must not crash because a background
//! service is unavailable.

use crate::config::EngramConfig;
use crate::state::{ServerRecord, StateStore};
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::{debug, info, warn};

pub struct Supervisor {
    config: EngramConfig,
    store: StateStore,
    session_id: Option<String>,
}

impl Supervisor {
    pub fn new(config: EngramConfig) -> Self {
        let store = StateStore::new(config.state_file());
        Self {
            config,
            store,
            session_id: None,
        }
    }

    /// Attach a session identifier, recorded alongside the launched server.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Whether the recorded server process is alive. Liveness of the process
    /// only; the port may not be bound yet.
    pub fn is_running(&self) -> bool {
        match self.store.load() {
            Some(record) => process_alive(record.pid),
            None => false,
        }
    }

    /// Base URL of the recorded instance, without any liveness verification.
    /// The fast path for clients; a dead server surfaces as a failed request.
    pub fn resolve_address(&self) -> Option<String> {
        self.store.load().map(|record| record.url)
    }

    /// Ensure a server is running. Idempotent: if the recorded process is
    /// alive this is a no-op, so redundant calls from concurrent short-lived
    /// callers do not launch duplicates.
    ///
    /// With `wait_for_ready`, polls until the state record exists and the
    /// negotiated port accepts connections, up to `max_wait`. Without it,
    /// returns as soon as the process handle is obtained.
    pub fn start(&self, wait_for_ready: bool, max_wait: Duration) -> bool {
        if self.is_running() {
            debug!("server already running");
            return true;
        }

        let lock = match StartLock::acquire(
            &self.config.lock_file(),
            self.config.supervisor.lock_stale_after(),
        ) {
            Some(lock) => lock,
            None => {
                debug!("another caller holds the start lock, deferring to it");
                if wait_for_ready {
                    return self.wait_until_ready(None, max_wait);
                }
                return true;
            }
        };

        // A racer may have finished starting between the pre-check and the
        // lock acquisition.
        if self.is_running() {
            return true;
        }

        let port = self.negotiate_port();
        let pid = match self.spawn_server(port) {
            Ok(pid) => pid,
            Err(err) => {
                warn!(error = %err, "failed to launch server");
                self.dump_log_tail();
                return false;
            }
        };

        let mut record = ServerRecord::new(pid, port, &self.config.server.host);
        record.session_id = self.session_id.clone();
        if let Err(err) = self.store.save(&record) {
            warn!(error = %err, "failed to persist server record");
        }
        info!(pid, port, "server launched");
        drop(lock);

        if !wait_for_ready {
            return true;
        }

        if self.wait_until_ready(Some(port), max_wait) {
            true
        } else {
            warn!(port, "server did not become ready within {max_wait:?}");
            self.dump_log_tail();
            false
        }
    }

    /// Stop the recorded server: graceful termination first, then a force
    /// kill once `timeout` elapses. Idempotent; a missing record or dead
    /// process reports success after clearing state.
    pub fn stop(&self, timeout: Duration) -> bool {
        let Some(record) = self.store.load() else {
            return true;
        };
        if !process_alive(record.pid) {
            self.store.clear();
            return true;
        }

        let pid = Pid::from_u32(record.pid);
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        if let Some(process) = sys.process(pid) {
            if process.kill_with(Signal::Term).is_none() {
                // Platform without SIGTERM support
                process.kill();
            }
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !process_alive(record.pid) {
                self.store.clear();
                info!(pid = record.pid, "server stopped");
                return true;
            }
            std::thread::sleep(self.config.supervisor.stop_poll_interval());
        }

        warn!(pid = record.pid, "graceful stop timed out, force killing");
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        if let Some(process) = sys.process(pid) {
            process.kill();
        }
        std::thread::sleep(Duration::from_millis(500));
        self.store.clear();
        !process_alive(record.pid)
    }

    /// Pick a likely-free port: reuse the recorded one if it can still be
    /// bound, otherwise scan upward from the configured start port, otherwise
    /// hand back the start port and let the server's own bind report the
    /// failure. The probe only proves bindability at the instant of the
    /// check; the server's bind call stays authoritative.
    pub fn negotiate_port(&self) -> u16 {
        let host = &self.config.server.host;

        if let Some(record) = self.store.load() {
            if port_bindable(host, record.port) {
                debug!(port = record.port, "reusing recorded port");
                return record.port;
            }
        }

        let start = self.config.server.start_port;
        for offset in 0..self.config.server.port_scan_attempts {
            let port = start.saturating_add(offset);
            if port_bindable(host, port) {
                debug!(port, "selected available port");
                return port;
            }
        }

        warn!(port = start, "no available port found, falling back to start port");
        start
    }

    /// Launch the server detached from this process so the caller's exit or
    /// timeout never tears it down. Output is appended to the shared log
    /// file so concurrent launches cannot corrupt each other's diagnostics.
    fn spawn_server(&self, port: u16) -> Result<u32> {
        let log_file = self.config.log_file();
        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let stdout_log = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_file)
            .with_context(|| format!("failed to open log file {}", log_file.display()))?;
        let stderr_log = stdout_log
            .try_clone()
            .context("failed to clone log file handle")?;

        let mut cmd = Command::new(&self.config.server.bin);
        cmd.arg("http-server")
            .arg("--host")
            .arg(&self.config.server.host)
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
        }

        debug!(bin = %self.config.server.bin, port, "spawning server");
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.config.server.bin))?;

        // The handle is dropped without waiting: the server must outlive
        // this process.
        Ok(child.id())
    }

    /// Poll until the state record exists and the target port accepts a
    /// connection. `port` is `None` when another caller is starting the
    /// server and the negotiated port is only knowable from the record.
    fn wait_until_ready(&self, port: Option<u16>, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        let interval = self.config.supervisor.ready_poll_interval();
        let probe_timeout = self.config.supervisor.probe_timeout();

        loop {
            std::thread::sleep(interval);

            if let Some(record) = self.store.load() {
                let target = port.unwrap_or(record.port);
                if port_listening(&self.config.server.host, target, probe_timeout) {
                    debug!(port = target, "server ready");
                    return true;
                }
            }

            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// Last lines of the server log, for startup diagnostics.
    pub fn log_tail(&self, lines: usize) -> Vec<String> {
        let Ok(contents) = std::fs::read_to_string(self.config.log_file()) else {
            return Vec::new();
        };
        let all: Vec<&str> = contents.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].iter().map(|line| line.to_string()).collect()
    }

    fn dump_log_tail(&self) {
        let lines = self.log_tail(self.config.supervisor.log_tail_lines);
        if lines.is_empty() {
            debug!("server log is empty");
            return;
        }
        for line in lines {
            debug!("server log: {line}");
        }
    }
}

/// OS-level liveness of a process. Zombies count as dead: the process has
/// exited even if its parent has not reaped it yet.
pub fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    match sys.process(pid) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// Transient bind-and-release probe: can a listener be bound here right now?
pub fn port_bindable(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// Connect probe: is something accepting connections here?
pub fn port_listening(host: &str, port: u16, timeout: Duration) -> bool {
    let Ok(mut addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    let Some(addr) = addrs.next() else {
        return false;
    };
    TcpStream::connect_timeout(&addr, timeout).is_ok()
}

/// Exclusive create-if-absent lock file gating the negotiate+spawn critical
/// section. Holding it is advisory: losing the race is not an error, the
/// loser defers to the winner's server. A lock older than `stale_after` is
/// presumed leaked by a crashed starter and removed.
struct StartLock {
    path: PathBuf,
}

impl StartLock {
    fn acquire(path: &Path, stale_after: Duration) -> Option<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        match Self::try_create(path) {
            Some(lock) => Some(lock),
            None => {
                let stale = std::fs::metadata(path)
                    .and_then(|meta| meta.modified())
                    .ok()
                    .and_then(|modified| modified.elapsed().ok())
                    .map(|age| age > stale_after)
                    .unwrap_or(false);
                if !stale {
                    return None;
                }
                debug!(path = %path.display(), "removing stale start lock");
                let _ = std::fs::remove_file(path);
                // Single retry; losing again means a live racer got there first.
                Self::try_create(path)
            }
        }
    }

    fn try_create(path: &Path) -> Option<StartLock> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Some(StartLock {
                    path: path.to_path_buf(),
                })
            }
            Err(_) => None,
        }
    }
}

impl Drop for StartLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
