//! Proxy error types and HTTP status mappings.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Error surfaced by the swap engine.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The requested model is not configured (directly or via alias).
    #[error("model '{0}' not found")]
    UnknownModel(String),

    /// The request body could not be understood.
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// The child could not launch or never became healthy.
    #[error("upstream failed to start: {0}")]
    StartFailed(String),

    /// The upstream is draining; retry shortly.
    #[error("upstream is stopping")]
    Stopping,

    /// The manager is closed; not retryable against this instance.
    #[error("proxy is shutting down")]
    Shutdown,

    /// The upstream connection failed before a response was produced.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The client went away; best-effort cleanup only.
    #[error("request cancelled")]
    Cancelled,

    /// A state that should be unreachable. The affected process is forced
    /// to failed.
    #[error("internal error: {0}")]
    Invariant(String),
}

/// JSON error body, OpenAI-flavoured.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
}

impl ProxyError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::UnknownModel(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::StartFailed(_) | Self::Stopping | Self::Shutdown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            // The client is gone; the code is only for logs.
            Self::Cancelled => StatusCode::BAD_REQUEST,
            Self::Invariant(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::UnknownModel(_) => "model_not_found",
            Self::BadRequest(_) => "invalid_request",
            Self::StartFailed(_) => "start_failed",
            Self::Stopping => "stopping",
            Self::Shutdown => "shutting_down",
            Self::Upstream(_) => "upstream_error",
            Self::Cancelled => "cancelled",
            Self::Invariant(_) => "internal_error",
        }
    }

    /// Whether a client is encouraged to retry against this instance.
    const fn retryable(&self) -> bool {
        matches!(self, Self::Stopping | Self::StartFailed(_))
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: ErrorDetail {
                message: self.to_string(),
                kind: self.kind(),
            },
        };
        let mut response = (status, axum::Json(body)).into_response();
        if self.retryable() {
            if let Ok(value) = "5".parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}
