// HTTP error handling

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tvrelay_livestream::StreamError;

/// Seconds an HLS player should wait before asking for the manifest again.
const MANIFEST_RETRY_AFTER_SECS: u64 = 1;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Sent as `Retry-After` when set
    pub retry_after: Option<u64>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    // Convenience alias
    pub fn internal(message: impl Into<String>) -> Self {
        Self::internal_server_error(message)
    }

    #[must_use]
    pub const fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });

        let mut response = (status, body).into_response();
        if let Some(seconds) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

/// Convert engine errors to HTTP errors
impl From<StreamError> for AppError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::ManifestNotReady { .. } => {
                AppError::not_found(err.to_string()).with_retry_after(MANIFEST_RETRY_AFTER_SECS)
            }
            StreamError::SourceUnreachable(_)
            | StreamError::StreamStalled(_)
            | StreamError::ProcessCrashed(_)
            | StreamError::FailoverExhausted(_) => {
                tracing::warn!(code = err.code(), "Stream unavailable: {}", err);
                AppError::service_unavailable(err.to_string())
            }
            StreamError::StreamNotFound(msg) => AppError::not_found(format!("Stream not found: {msg}")),
            StreamError::InvalidState(msg) => AppError::bad_request(msg),
            StreamError::ClientDisconnected => AppError::bad_request("Client disconnected"),
            StreamError::Store(msg) => {
                tracing::error!("State store error: {}", msg);
                AppError::service_unavailable("Service temporarily unavailable")
            }
            StreamError::Io(e) => {
                tracing::error!("IO error: {}", e);
                AppError::internal_server_error("Internal server error")
            }
            StreamError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                AppError::internal_server_error("Internal server error")
            }
        }
    }
}

/// Convert tvrelay_core errors to HTTP errors
impl From<tvrelay_core::Error> for AppError {
    fn from(err: tvrelay_core::Error) -> Self {
        StreamError::from(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_status_mapping() {
        let cases = [
            (StreamError::SourceUnreachable("a".into()), StatusCode::SERVICE_UNAVAILABLE),
            (StreamError::FailoverExhausted("a".into()), StatusCode::SERVICE_UNAVAILABLE),
            (StreamError::StreamNotFound("a".into()), StatusCode::NOT_FOUND),
            (StreamError::InvalidState("a".into()), StatusCode::BAD_REQUEST),
            (StreamError::Internal("a".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn test_manifest_not_ready_sets_retry_after() {
        let response = AppError::from(StreamError::ManifestNotReady { attempts: 3 }).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }

    #[test]
    fn test_internal_details_are_not_leaked() {
        let err = AppError::from(StreamError::Internal("redis://secret".into()));
        assert_eq!(err.message, "Internal server error");
    }
}
