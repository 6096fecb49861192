//! Shared error taxonomy for the orchestrator.
//!
//! Every fallible operation in the run lifecycle engine returns [`Error`]. The
//! variants double as the wire-level error kinds from the HTTP API: each one
//! carries its own status code via [`Error::status_code`] so handlers never
//! have to re-derive the mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("invalid graph ref: {0}")]
    InvalidGraphRef(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("input schema violation: {0}")]
    InputSchemaViolation(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("in use: {0}")]
    InUse(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("runner unreachable: {0}")]
    RunnerUnreachable(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// The error taxonomy kind used in logs and as the `error` field on the wire (§7).
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Unauthenticated => "unauthenticated",
            Error::Forbidden(_) => "forbidden",
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::Conflict(_) => "conflict",
            Error::InvalidImage(_) => "invalid_image",
            Error::InvalidGraphRef(_) => "invalid_graph_ref",
            Error::InvalidSchema(_) => "invalid_schema",
            Error::InputSchemaViolation(_) => "input_schema_violation",
            Error::InvalidRequest(_) => "invalid_request",
            Error::InUse(_) => "in_use",
            Error::Unavailable(_) => "unavailable",
            Error::RunnerUnreachable(_) => "runner_unreachable",
            Error::Kube(_) | Error::Database(_) => "unavailable",
            Error::Serialization(_) | Error::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) | Error::Conflict(_) | Error::InUse(_) => {
                StatusCode::CONFLICT
            }
            Error::InvalidImage(_)
            | Error::InvalidGraphRef(_)
            | Error::InvalidSchema(_)
            | Error::InputSchemaViolation(_)
            | Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unavailable(_) | Error::Kube(_) | Error::Database(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::RunnerUnreachable(_) => StatusCode::BAD_GATEWAY,
            Error::Serialization(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Renders an [`Error`] as the JSON body the HTTP API returns. Internal errors
/// never leak their message, per the propagation policy in §7.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let mut body = json!({
            "error": self.kind(),
            "message": message,
        });

        if status == StatusCode::SERVICE_UNAVAILABLE {
            body["retryAfterSeconds"] = json!(2);
        }

        (status, Json(body)).into_response()
    }
}
