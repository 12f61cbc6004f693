//! Standard response envelope
//!
//! Success: `{ "ok": true, "result": ..., "error": null, "status": 200, "timestamp": ... }`
//! Failure: `{ "ok": false, "error": "...", "status": 404, "timestamp": ... }`

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Serialize, Debug)]
pub struct Envelope<T: Serialize> {
    pub ok: bool,
    pub result: Option<T>,
    pub error: Option<String>,
    pub status: u16,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> Envelope<T> {
    pub fn success(status: StatusCode, result: T) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
            status: status.as_u16(),
            timestamp: Utc::now(),
        }
    }
}

/// Wraps `result` in a success envelope with the given status
pub fn success<T: Serialize>(status: StatusCode, result: T) -> Response {
    (status, Json(Envelope::success(status, result))).into_response()
}

/// Builds a failure envelope; the `result` field is omitted entirely
pub fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({
        "ok": false,
        "error": message.into(),
        "status": status.as_u16(),
        "timestamp": Utc::now(),
    });
    (status, Json(body)).into_response()
}
