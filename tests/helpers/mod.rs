#![allow(dead_code)]

use engram::config::EngramConfig;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;
use std::time::Duration;
use tempfile::TempDir;

/// Config rooted in a temp dir, pointing at binaries that do not exist so no
/// test launches a real server by accident. Poll intervals are tightened to
/// keep the suite fast.
pub fn test_config(tmp: &TempDir) -> EngramConfig {
    let mut config = EngramConfig::default();
    config.storage.home_dir = tmp.path().to_string_lossy().into_owned();
    config.server.bin = tmp
        .path()
        .join("missing-server-bin")
        .to_string_lossy()
        .into_owned();
    config.client.fallback_bin = tmp
        .path()
        .join("missing-cli-bin")
        .to_string_lossy()
        .into_owned();
    config.supervisor.ready_poll_interval_ms = 50;
    config.supervisor.stop_poll_interval_ms = 20;
    config
}

/// A free port, found by binding to 0 and releasing.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Serve exactly one canned HTTP response on a fresh port, then exit.
pub fn serve_once(status: u16, body: &str) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let reason = match status {
        200 => "OK",
        500 => "Internal Server Error",
        _ => "Status",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );

    let handle = std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            read_request(&mut stream);
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
        }
    });
    (port, handle)
}

/// Accept one connection and never respond, to exercise timeout handling.
pub fn serve_silent() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            read_request(&mut stream);
            // Hold the connection open long enough for any client timeout
            // under test to fire first.
            std::thread::sleep(Duration::from_secs(10));
        }
    });
    (port, handle)
}

/// Read a full HTTP request: headers, then Content-Length bytes of body.
fn read_request(stream: &mut TcpStream) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(header_end) = find_subsequence(&buf, b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..header_end]);
            let content_length = headers
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if buf.len() >= header_end + 4 + content_length {
                return;
            }
        }
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Write an executable shell script into `dir` and return its path.
#[cfg(unix)]
pub fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().into_owned()
}

/// Pid of a process that has already exited. Spawning and waiting guarantees
/// the pid is dead; sequential pid allocation makes immediate reuse unlikely.
#[cfg(unix)]
pub fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}
