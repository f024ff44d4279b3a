use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
        }
    }

    pub fn invalid_request_body(detail: impl std::fmt::Display) -> Self {
        tracing::error!("invalid request body: {detail}");
        Self::new(
            StatusCode::BAD_REQUEST,
            "invalid_request_body",
            "Invalid request body",
        )
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    param: Option<String>,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.message,
                error_type: self.error_type,
                param: self.param,
                code: self.code,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures observed after the response has switched to SSE. These travel on
/// the session's error channel and end up as an in-band error frame.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("failed to read session credential: {0}")]
    CredentialUnavailable(String),
    #[error("failed to request upstream: {0}")]
    UpstreamRequestFailed(String),
    #[error("failed to decode JSON response: {0}")]
    UpstreamDecodeFailed(String),
    #[error("malformed upstream event: {0}")]
    UpstreamLineMalformed(String),
    #[error("error reading upstream response: {0}")]
    UpstreamReadFailed(String),
    #[error("request cancelled")]
    Cancelled,
}

impl StreamError {
    /// Malformed lines are skipped; everything else ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StreamError::UpstreamLineMalformed(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamError::CredentialUnavailable(_) => "credential_unavailable",
            StreamError::UpstreamRequestFailed(_) => "upstream_request_failed",
            StreamError::UpstreamDecodeFailed(_) => "upstream_decode_failed",
            StreamError::UpstreamLineMalformed(_) => "upstream_line_malformed",
            StreamError::UpstreamReadFailed(_) => "upstream_read_failed",
            StreamError::Cancelled => "cancelled",
        }
    }
}
