//! Resilient request client: prefer the shared server, degrade to direct
//! invocation.
//!
//! [`ResilientClient::call`] is the primary path: resolve the recorded
//! address, issue the request with a bounded timeout, and map every failure
//! mode (no record, connection refused, timeout, non-2xx, malformed body) to
//! a structured [`ApiResponse`]. [`ResilientClient::call_with_fallback`] is
//! the explicit two-stage pipeline: attempt the primary path, and on a
//! structured failure run the same operation as a one-shot command via
//! [`fallback`]. Nothing here raises past the API boundary.
//!
//! The client never starts the server. Starting is a deliberate lifecycle
//! action, not a side effect of a request; only the designated lifecycle
//! entry point launches, no matter how many callers are probing.

pub mod fallback;
pub mod ops;
pub mod transport;

use crate::config::EngramConfig;
use crate::supervisor::Supervisor;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// HTTP-shaped method. Only these two appear in the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// One logical operation, usable by both delivery paths: `endpoint` +
/// `payload` describe the HTTP request, `command` + `payload` describe the
/// equivalent one-shot invocation. Built by the constructors in [`ops`], so
/// the two paths cannot drift apart.
#[derive(Debug, Clone)]
pub struct Operation {
    pub endpoint: &'static str,
    pub method: Method,
    /// Subcommand for the direct invocation fallback. `None` for operations
    /// that only exist on the server (health, shutdown).
    pub command: Option<&'static str>,
    pub payload: Option<Map<String, Value>>,
}

/// Structured result of any operation, on either path. Extra
/// operation-specific fields pass through opaquely in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ApiResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            extra: Map::new(),
        }
    }

    /// Interpret a response body. A body without the `success` flag is
    /// indistinguishable from garbage and maps to a structured failure.
    fn from_value(value: Value) -> Self {
        match serde_json::from_value(value) {
            Ok(response) => response,
            Err(err) => Self::failure(format!("request failed: malformed response body: {err}")),
        }
    }
}

/// Issues logical operations against the shared background service.
///
/// The transport is created at construction and released when the client
/// goes out of scope; nothing waits on a finalizer.
pub struct ResilientClient {
    session_id: String,
    config: EngramConfig,
    supervisor: Supervisor,
    transport: transport::DefaultTransport,
}

impl ResilientClient {
    pub fn new(session_id: impl Into<String>, config: EngramConfig) -> Self {
        let transport = transport::DefaultTransport::new(config.client.request_timeout());
        let supervisor = Supervisor::new(config.clone());
        Self {
            session_id: session_id.into(),
            config,
            supervisor,
            transport,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Primary path: dispatch to the recorded server address. An absent
    /// record is an immediate structured failure; the client never starts
    /// the server on its own.
    pub fn call(&self, op: &Operation) -> ApiResponse {
        use transport::Transport as _;

        let Some(base) = self.supervisor.resolve_address() else {
            debug!(session = %self.session_id, endpoint = op.endpoint, "no server address recorded");
            return ApiResponse::failure("server not running");
        };

        let url = format!("{base}{}", op.endpoint);
        debug!(session = %self.session_id, method = op.method.as_str(), url = %url, "dispatching request");

        let body = op.payload.as_ref().map(|map| Value::Object(map.clone()));
        match self.transport.execute(op.method, &url, body.as_ref()) {
            Ok(value) => ApiResponse::from_value(value),
            Err(err) => ApiResponse::failure(format!("request failed: {err}")),
        }
    }

    /// Two-stage pipeline: primary path first, direct invocation on a
    /// structured failure. The result shape is identical either way.
    pub fn call_with_fallback(&self, op: &Operation) -> ApiResponse {
        let primary = self.call(op);
        if primary.success {
            return primary;
        }
        debug!(
            session = %self.session_id,
            endpoint = op.endpoint,
            error = primary.error.as_deref().unwrap_or(""),
            "primary path failed, degrading to direct invocation"
        );
        fallback::invoke(op, &self.config)
    }
}
