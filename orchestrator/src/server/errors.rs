//! Error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use openapi_server::{ErrorBody, ErrorResponse};
use tracing::error;

use crate::errors::{ErrorKind, OrchestratorError};

/// HTTP status for an error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidArtifact
        | ErrorKind::UnsupportedFramework
        | ErrorKind::ManifestUnresolvable
        | ErrorKind::InvalidRequest => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ArtifactTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::InvalidTransition
        | ErrorKind::StaleTransition
        | ErrorKind::BuildInProgress
        | ErrorKind::IdempotencyConflict => StatusCode::CONFLICT,
        ErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Transient | ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = status_for(kind);
        let message = if kind == ErrorKind::Internal {
            // details stay in the log
            error!("Internal error: {}", self);
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorResponse {
            error: ErrorBody {
                kind: kind.as_str().to_string(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}
