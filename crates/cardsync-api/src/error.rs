//! Maps the shared [`cardsync_core::Error`] onto HTTP status codes and
//! JSON error bodies. This is the single place in the crate allowed to
//! know about transport-level representations of an error.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cardsync_core::error::Error as CoreError;
use serde_json::json;
use tracing::{debug, error, warn};

/// Thin wrapper so we can implement [`IntoResponse`] for an error type
/// defined in another crate.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, errcode) = match &self.0 {
            CoreError::Unauthorized(_) => (StatusCode::FORBIDDEN, "unauthorized"),
            CoreError::ExpectedAuth => (StatusCode::BAD_REQUEST, "expected_auth"),
            CoreError::SchemaLock(_) => (StatusCode::BAD_REQUEST, "schema_lock"),
            CoreError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            CoreError::Busy => (StatusCode::CONFLICT, "busy"),
            CoreError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            CoreError::InvalidCredentials => (StatusCode::FORBIDDEN, "invalid_credentials"),
            CoreError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            CoreError::Temporary(_) => (StatusCode::SERVICE_UNAVAILABLE, "temporary"),
        };

        match &self.0 {
            CoreError::Internal(msg) => error!(error = %msg, "internal error"),
            CoreError::Temporary(msg) => warn!(error = %msg, "temporary upstream failure"),
            CoreError::Busy => warn!("rejected concurrent sync attempt for user"),
            CoreError::SchemaLock(msg) => warn!(error = %msg, "schema lock"),
            other => debug!(error = %other, "client-caused error"),
        }

        let body = Json(json!({ "errcode": errcode, "error": self.0.to_string() }));
        (status, body).into_response()
    }
}
