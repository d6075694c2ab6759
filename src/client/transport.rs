//! HTTP transports for the primary request path.
//!
//! Two behaviorally equivalent implementations: [`ReqwestTransport`] (the
//! default, behind the `reqwest-client` feature) and [`MinimalTransport`], a
//! built-in HTTP/1.0-over-`TcpStream` client for builds without the full
//! stack. Both send the same path and JSON body and surface the same
//! [`TransportError`] taxonomy, so the layer above cannot tell them apart.

use super::Method;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("server returned HTTP {0}")]
    Status(u16),
    #[error("malformed response body: {0}")]
    MalformedBody(String),
    #[error("unsupported url: {0}")]
    BadUrl(String),
}

pub trait Transport {
    /// Issue one request and return the parsed JSON body of a 2xx response.
    fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, TransportError>;
}

#[cfg(feature = "reqwest-client")]
pub type DefaultTransport = ReqwestTransport;
#[cfg(not(feature = "reqwest-client"))]
pub type DefaultTransport = MinimalTransport;

#[cfg(feature = "reqwest-client")]
pub struct ReqwestTransport {
    client: Option<reqwest::blocking::Client>,
    timeout: Duration,
}

#[cfg(feature = "reqwest-client")]
impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .ok();
        Self { client, timeout }
    }
}

#[cfg(feature = "reqwest-client")]
impl Transport for ReqwestTransport {
    fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, TransportError> {
        let Some(client) = &self.client else {
            return Err(TransportError::Connect("http client unavailable".into()));
        };

        let request = match method {
            Method::Get => client.get(url),
            // A POST always carries a JSON body; `{}` when the operation has
            // no payload, matching the minimal transport.
            Method::Post => client
                .post(url)
                .json(body.unwrap_or(&Value::Object(serde_json::Map::new()))),
        };

        let map_err = |err: reqwest::Error| {
            if err.is_timeout() {
                TransportError::Timeout(self.timeout)
            } else {
                TransportError::Connect(err.to_string())
            }
        };

        let response = request.send().map_err(map_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        let body = response.text().map_err(map_err)?;
        serde_json::from_str(&body).map_err(|err| TransportError::MalformedBody(err.to_string()))
    }
}

/// Hand-rolled HTTP/1.0 client over a plain TCP stream. Speaking 1.0 keeps
/// the response un-chunked, so parsing reduces to "everything after the
/// header terminator, until the server closes the connection".
pub struct MinimalTransport {
    timeout: Duration,
}

impl MinimalTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Transport for MinimalTransport {
    fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, TransportError> {
        let (host, port, path) = parse_url(url)?;

        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|err| TransportError::Connect(err.to_string()))?
            .next()
            .ok_or_else(|| TransportError::Connect(format!("no address for {host}:{port}")))?;

        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        let request = match method {
            Method::Get => format!(
                "GET {path} HTTP/1.0\r\nHost: {host}:{port}\r\nAccept: application/json\r\nConnection: close\r\n\r\n"
            ),
            Method::Post => {
                let payload = body
                    .map(|value| value.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                format!(
                    "POST {path} HTTP/1.0\r\nHost: {host}:{port}\r\nAccept: application/json\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
                    payload.len()
                )
            }
        };

        stream
            .write_all(request.as_bytes())
            .map_err(|err| self.map_io_error(err))?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .map_err(|err| self.map_io_error(err))?;

        let (status, body) = parse_response(&raw)?;
        if !(200..300).contains(&status) {
            return Err(TransportError::Status(status));
        }
        serde_json::from_str(&body).map_err(|err| TransportError::MalformedBody(err.to_string()))
    }
}

impl MinimalTransport {
    fn map_io_error(&self, err: std::io::Error) -> TransportError {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                TransportError::Timeout(self.timeout)
            }
            _ => TransportError::Connect(err.to_string()),
        }
    }
}

/// Split `http://host:port/path` into parts. Only plain HTTP is supported.
fn parse_url(url: &str) -> Result<(String, u16, String), TransportError> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| TransportError::BadUrl(url.to_string()))?;

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| TransportError::BadUrl(url.to_string()))?;
            (host, port)
        }
        None => (authority, 80),
    };

    if host.is_empty() {
        return Err(TransportError::BadUrl(url.to_string()));
    }
    Ok((host.to_string(), port, path))
}

/// Parse a raw HTTP response into (status code, body).
fn parse_response(raw: &[u8]) -> Result<(u16, String), TransportError> {
    let text = String::from_utf8_lossy(raw);
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        return Err(TransportError::MalformedBody(
            "missing header terminator".into(),
        ));
    };

    let status_line = head.lines().next().unwrap_or("");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            TransportError::MalformedBody(format!("bad status line: {status_line}"))
        })?;

    Ok((status, body.to_string()))
}
