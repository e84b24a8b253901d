use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Relay service error variants.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("outbox event not found")]
    NotFound,
    #[error("outbox event is not dead-lettered")]
    NotDeadLettered,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("stream transport error: {0}")]
    Transport(String),
    #[error("publish timed out after {0} ms")]
    Timeout(u64),
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::NotDeadLettered => "NOT_DEAD_LETTERED",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Transport(_) => "TRANSPORT",
            Self::Timeout(_) => "TIMEOUT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Diagnostic stored in `last_error` when a publish attempt fails.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Internal(e) => format!("{e:#}"),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NotDeadLettered => StatusCode::CONFLICT,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Transport(_) | Self::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Internal errors need the anyhow chain logged so the root cause is traceable.
        if let Self::Internal(ref e) = self {
            tracing::error!(error = %format!("{e:#}"), kind = "INTERNAL", "internal error");
        }
        let body = serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}
