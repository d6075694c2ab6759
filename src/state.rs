//! Server state record persistence.
//!
//! A single advisory JSON record at `~/.engram/servers/engram.state` describes
//! the last known server instance. The record is never trusted on its own:
//! consumers pair every read with a liveness check of the recorded pid and a
//! connect probe of the recorded port, so staleness is detected rather than
//! prevented.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Persisted description of a running server instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    /// OS process id presumed to be the server.
    pub pid: u32,
    /// TCP port the server is listening on.
    pub port: u16,
    /// Fully-formed base address, e.g. `http://127.0.0.1:8001`.
    pub url: String,
    /// Session that launched the server, for log correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// RFC 3339 launch timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
}

impl ServerRecord {
    pub fn new(pid: u32, port: u16, host: &str) -> Self {
        Self {
            pid,
            port,
            url: format!("http://{host}:{port}"),
            session_id: None,
            started_at: Some(chrono::Local::now().to_rfc3339()),
        }
    }
}

/// Single-record store at a fixed path. All operations fail soft: a missing,
/// unreadable, or unparsable record reads as "no server".
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record, treating any I/O or parse error as absence.
    pub fn load(&self) -> Option<ServerRecord> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) => {
                debug!(path = %self.path.display(), error = %err, "no readable state record");
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ignoring unparsable state record");
                None
            }
        }
    }

    /// Overwrite the record. Writes to a temp file then renames so a reader
    /// never observes a half-written record.
    pub fn save(&self, record: &ServerRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let contents =
            serde_json::to_string_pretty(record).context("failed to serialize state record")?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, contents)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename into {}", self.path.display()))?;

        debug!(path = %self.path.display(), pid = record.pid, port = record.port, "state record written");
        Ok(())
    }

    /// Remove the record if present. Idempotent; failures are logged only.
    pub fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "state record removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to remove state record")
            }
        }
    }
}
