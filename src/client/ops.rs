//! Per-operation request constructors.
//!
//! Thin shape adapters over the generic [`Operation`](super::Operation):
//! each fixes the endpoint path, the method, the direct-invocation command,
//! and which payload fields are required. Both delivery paths consume the
//! same value, so they stay equivalent by construction.

use super::{Method, Operation};
use serde_json::{json, Map, Value};

fn payload(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

/// Search stored knowledge for entries relevant to `query`.
pub fn search(query: &str, project_id: &str, limit: usize, min_score: f64) -> Operation {
    Operation {
        endpoint: "/api/v1/search",
        method: Method::Post,
        command: Some("search"),
        payload: Some(payload(&[
            ("query", json!(query)),
            ("project_id", json!(project_id)),
            ("limit", json!(limit)),
            ("min_score", json!(min_score)),
        ])),
    }
}

/// Record a candidate question/answer pair for later validation.
pub fn record_candidate(project_id: &str, question: &str, answer: &str) -> Operation {
    Operation {
        endpoint: "/api/v1/record-candidate",
        method: Method::Post,
        command: Some("record-candidate"),
        payload: Some(payload(&[
            ("project_id", json!(project_id)),
            ("question", json!(question)),
            ("answer", json!(answer)),
        ])),
    }
}

/// Record which previously-shown entries a session actually used.
pub fn record_hit(project_id: &str, qa_ids: &[String], shown_ids: &[String]) -> Operation {
    Operation {
        endpoint: "/api/v1/record-hit",
        method: Method::Post,
        command: Some("record-hit"),
        payload: Some(payload(&[
            ("project_id", json!(project_id)),
            ("qa_ids", json!(qa_ids)),
            ("shown_ids", json!(shown_ids)),
        ])),
    }
}

/// Record a validation verdict. The payload shape is owned by the server;
/// it passes through untouched.
pub fn record_validation(payload: Map<String, Value>) -> Operation {
    Operation {
        endpoint: "/api/v1/record-validation",
        method: Method::Post,
        command: Some("record-validation"),
        payload: Some(payload),
    }
}

/// Evaluate a finished session server-side. Server-only: the evaluation
/// pipeline has no one-shot equivalent.
pub fn evaluate_session(payload: Map<String, Value>) -> Operation {
    Operation {
        endpoint: "/api/v1/evaluate-session",
        method: Method::Post,
        command: None,
        payload: Some(payload),
    }
}

pub fn health() -> Operation {
    Operation {
        endpoint: "/health",
        method: Method::Get,
        command: None,
        payload: None,
    }
}

/// Ask the server to shut itself down.
pub fn shutdown() -> Operation {
    Operation {
        endpoint: "/shutdown",
        method: Method::Post,
        command: None,
        payload: None,
    }
}
