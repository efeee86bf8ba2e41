//! Error types for the relay and the backend transports.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Machine-readable error codes sent to clients.
pub const BACKEND_UNAVAILABLE: &str = "BACKEND_UNAVAILABLE";
pub const LOGIN_FAILED: &str = "LOGIN_FAILED";
pub const NOT_LOGGED_IN: &str = "NOT_LOGGED_IN";
pub const TARGET_UNAVAILABLE: &str = "TARGET_UNAVAILABLE";
pub const NO_FILE: &str = "NO_FILE";
pub const UPLOAD_REJECTED: &str = "UPLOAD_REJECTED";
pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
pub const RELAY_FAILURE: &str = "RELAY_FAILURE";
pub const ALREADY_EXISTS: &str = "ALREADY_EXISTS";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Failures raised by a [`ChatBackend`](crate::backend::ChatBackend) transport.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The connection to the chat service is down or could not be opened.
    #[error("chat backend unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within the configured timeout.
    #[error("backend call `{action}` timed out after {millis}ms")]
    Timeout { action: &'static str, millis: u64 },

    /// The chat service answered with an error status.
    #[error("backend rejected `{action}`: {message}")]
    Rejected { action: &'static str, message: String },

    /// The chat service sent a frame we could not interpret.
    #[error("backend protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Relay-level error taxonomy surfaced to clients and HTTP callers.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("service unavailable: {0}")]
    BackendUnavailable(String),

    #[error("login failed: {0}")]
    LoginFailed(String),

    #[error("login required before `{0}`")]
    NotLoggedIn(&'static str),

    #[error("{0} is not connected")]
    TargetUnavailable(String),

    /// Upload carried no audio part, or an empty one.
    #[error("No file")]
    NoFile,

    #[error("upload rejected: {0}")]
    UploadRejected(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Any other backend failure during a best-effort action.
    #[error("{0}")]
    Relay(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::BackendUnavailable(_) => BACKEND_UNAVAILABLE,
            Self::LoginFailed(_) => LOGIN_FAILED,
            Self::NotLoggedIn(_) => NOT_LOGGED_IN,
            Self::TargetUnavailable(_) => TARGET_UNAVAILABLE,
            Self::NoFile => NO_FILE,
            Self::UploadRejected(_) => UPLOAD_REJECTED,
            Self::InvalidPayload(_) => INVALID_PAYLOAD,
            Self::AlreadyExists(_) => ALREADY_EXISTS,
            Self::Relay(_) => RELAY_FAILURE,
            Self::Io(_) => INTERNAL_ERROR,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::LoginFailed(_) | Self::NotLoggedIn(_) => StatusCode::UNAUTHORIZED,
            Self::TargetUnavailable(_) => StatusCode::NOT_FOUND,
            Self::NoFile | Self::UploadRejected(_) | Self::InvalidPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::Relay(_) => StatusCode::BAD_GATEWAY,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BackendError> for RelayError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(_) | BackendError::Timeout { .. } => {
                Self::BackendUnavailable(err.to_string())
            }
            other => Self::Relay(other.to_string()),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": "error",
            "error": self.to_string(),
            "code": self.code(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}
