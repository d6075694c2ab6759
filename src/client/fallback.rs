//! Direct invocation fallback: run the capability as a one-shot command.
//!
//! Pays process cold-start cost on every call and shares no cache with the
//! server. The command is expected to emit a JSON document on stdout and a
//! non-zero exit code with diagnostics on stderr otherwise; both outcomes
//! map to the same [`ApiResponse`] shape as the HTTP path.

use super::{ApiResponse, Operation};
use crate::config::EngramConfig;
use serde_json::{Map, Value};
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::debug;

/// Render the argv (after the binary name) for an operation, or `None` when
/// the operation has no one-shot equivalent. Payload fields become
/// `--key value` flags; the key set is the same one the HTTP body carries.
pub fn command_line(op: &Operation) -> Option<Vec<String>> {
    let command = op.command?;
    let mut args = vec![command.to_string()];
    if let Some(payload) = &op.payload {
        for (key, value) in payload {
            args.push(format!("--{key}"));
            args.push(flag_value(value));
        }
    }
    Some(args)
}

/// Strings pass through bare; everything else is rendered as JSON text.
fn flag_value(value: &Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    }
}

/// Execute the operation as a one-shot command with a hard timeout.
pub fn invoke(op: &Operation, config: &EngramConfig) -> ApiResponse {
    let Some(args) = command_line(op) else {
        return ApiResponse::failure(format!("no direct fallback for {}", op.endpoint));
    };

    let bin = &config.client.fallback_bin;
    let timeout = config.client.fallback_timeout();
    debug!(bin = %bin, command = %args[0], "invoking direct fallback");

    let mut child = match Command::new(bin)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => return ApiResponse::failure(format!("failed to invoke {bin}: {err}")),
    };

    // Drain the pipes off-thread so a chatty child cannot deadlock against
    // a full pipe buffer while we poll for exit.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || read_all(stdout));
    let stderr_reader = std::thread::spawn(move || read_all(stderr));

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
        }
    };

    let Some(status) = status else {
        // Do not join the readers here: a grandchild that inherited the
        // pipes could hold them open past the deadline. The threads finish
        // on their own once the pipes close.
        return ApiResponse::failure(format!("direct invocation timed out after {timeout:?}"));
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    if !status.success() {
        let diagnostics = stderr.trim();
        return ApiResponse::failure(if diagnostics.is_empty() {
            format!("direct invocation exited with {status}")
        } else {
            diagnostics.to_string()
        });
    }

    match serde_json::from_str::<Value>(stdout.trim()) {
        Ok(data) => {
            let mut extra = Map::new();
            extra.insert("data".to_string(), data);
            ApiResponse {
                success: true,
                error: None,
                extra,
            }
        }
        Err(err) => {
            ApiResponse::failure(format!("direct invocation produced unparsable output: {err}"))
        }
    }
}

fn read_all(pipe: Option<impl Read>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf);
    }
    buf
}
