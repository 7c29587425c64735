//! Error taxonomy for lifecycle operations and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors surfaced by lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The internal port pool has no free port
    #[error("no free ports available in the configured range")]
    AllocationExhausted,

    /// Dependency installation exited non-zero
    #[error("dependency installation failed: {0}")]
    ProvisionFailed(String),

    /// The app process died within the liveness window or could not spawn
    #[error("app failed to start: {0}")]
    StartFailed(String),

    /// Unknown app id
    #[error("app not found: {0}")]
    NotFound(String),

    /// Another operation is in progress and this request is not a supersession
    #[error("operation already in progress for app {0}")]
    Conflict(String),

    /// Missing or invalid upload
    #[error("{0}")]
    Validation(String),

    /// A newer edit/start/stop invalidated this in-flight operation.
    /// Internal abort marker, never shown to API callers.
    #[error("superseded by a newer operation")]
    Superseded,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence error: {0}")]
    Persist(String),
}

impl HostError {
    /// HTTP status the API layer maps this error to
    pub fn status_code(&self) -> StatusCode {
        match self {
            HostError::AllocationExhausted => StatusCode::SERVICE_UNAVAILABLE,
            HostError::ProvisionFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HostError::StartFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HostError::NotFound(_) => StatusCode::NOT_FOUND,
            HostError::Conflict(_) => StatusCode::CONFLICT,
            HostError::Validation(_) => StatusCode::BAD_REQUEST,
            HostError::Superseded => StatusCode::CONFLICT,
            HostError::Io(_) | HostError::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error codes for proxy-level failures
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No app with this id
    UnknownApp,
    /// App exists but is not in running state
    AppNotReady,
    /// No console upstream configured
    ConsoleUnavailable,
    /// Failed to connect to the backend
    ConnectionFailed,
    /// Request timed out waiting for the backend
    RequestTimeout,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownApp => StatusCode::NOT_FOUND,
            ProxyErrorCode::AppNotReady => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ConsoleUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownApp => "UNKNOWN_APP",
            ProxyErrorCode::AppNotReady => "APP_NOT_READY",
            ProxyErrorCode::ConsoleUnavailable => "CONSOLE_UNAVAILABLE",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
