//! Local memory-service supervisor and resilient request client.
//!
//! Short-lived processes (editor hooks, session lifecycle scripts) need a
//! long-running per-machine knowledge service without knowing whether it is
//! running, which port it bound, or whether it is healthy. `engram` is the
//! client-side core that makes that safe: it discovers or starts the
//! singleton background server, negotiates and persists its address,
//! verifies readiness, issues requests with a bounded timeout, and degrades
//! to a one-shot command invocation when the service is unreachable.
//!
//! # Architecture
//!
//! - **State store**: a single advisory JSON record at
//!   `~/.engram/servers/engram.state` describing the known instance. Never
//!   trusted on its own — every read is paired with a liveness check.
//! - **Supervisor**: idempotent start/stop, port negotiation, and readiness
//!   gating (process alive AND port accepting, which are different facts).
//! - **Resilient client**: HTTP primary path, minimal built-in transport as
//!   an alternative, and an explicit degrade path that runs the same
//!   capability as a one-shot command.
//!
//! # Modules
//!
//! - [`config`] — Configuration loading from TOML files and environment variables
//! - [`state`] — ServerRecord persistence with fail-soft reads
//! - [`supervisor`] — Server lifecycle: discovery, start, readiness, stop
//! - [`client`] — Request dispatch, transports, and the direct-invocation fallback

pub mod client;
pub mod config;
pub mod state;
pub mod supervisor;
