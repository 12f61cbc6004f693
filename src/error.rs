//! Error taxonomy and the failure envelope
//!
//! Every handler returns `Result<_, AppError>`. Conversion into an HTTP
//! response happens here, at the boundary, so internal details never reach
//! the client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::response::failure;

/// Reasons a presented credential is rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,

    #[error("malformed token")]
    Malformed,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("token revoked")]
    Revoked,

    #[error("insufficient scope")]
    InsufficientScope,
}

impl AuthError {
    /// Kebab-case reason used as a metric key segment
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::Missing => "missing",
            AuthError::Malformed => "malformed",
            AuthError::InvalidSignature => "invalid-signature",
            AuthError::Expired => "expired",
            AuthError::Revoked => "revoked",
            AuthError::InsufficientScope => "forbidden",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::InsufficientScope => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Failures surfaced by the key-value port
#[derive(Debug, Error)]
pub enum KvError {
    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("kv backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{0}")]
    Validation(String),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("image cannot be reduced below the size budget")]
    TargetUnreachable,

    #[error(transparent)]
    Storage(#[from] KvError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Auth(e) => e.status(),
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::TargetUnreachable => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Storage(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable kebab-case identifier, used in error metric keys
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Auth(_) => "auth",
            AppError::Validation(_) => "validation",
            AppError::PayloadTooLarge => "payload-too-large",
            AppError::NotFound(_) => "not-found",
            AppError::Conflict(_) => "conflict",
            AppError::Upstream(_) => "upstream",
            AppError::TargetUnreachable => "target-unreachable",
            AppError::Storage(_) => "storage",
            AppError::Internal(_) => "internal",
        }
    }

    /// Message safe to show to a client
    fn public_message(&self) -> String {
        match self {
            AppError::Auth(AuthError::InsufficientScope) => "Forbidden".to_string(),
            AppError::Auth(_) => "Unauthorized".to_string(),
            AppError::Upstream(detail) => {
                tracing::error!("Upstream error: {}", detail);
                "Upstream service unavailable".to_string()
            }
            AppError::Storage(e) => {
                tracing::error!("Storage error: {}", e);
                "Internal server error".to_string()
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.public_message();
        let mut response = failure(status, message);
        // Lets the request metrics layer attribute the failure by kind.
        response.extensions_mut().insert(ErrorKind(self.kind()));
        response
    }
}

/// Response extension carrying the kind of a rendered `AppError`
#[derive(Debug, Clone, Copy)]
pub struct ErrorKind(pub &'static str);
