use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use roadsync_core::Error as CoreError;
use serde::Serialize;

/// Set to `1`/`true` to return backend and upstream error details to clients.
pub const EXPOSE_INTERNAL_ERRORS_ENV: &str = "ROADSYNC_EXPOSE_INTERNAL_ERRORS";

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("missing x-workspace-id header")]
    MissingWorkspaceId,

    #[error("invalid x-workspace-id header: {0}")]
    InvalidWorkspaceId(String),

    #[error("missing x-user-id header")]
    MissingUserId,

    #[error("invalid x-user-id header: {0}")]
    InvalidUserId(String),

    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingWorkspaceId
            | ApiError::InvalidWorkspaceId(_)
            | ApiError::MissingUserId
            | ApiError::InvalidUserId(_)
            | ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(err) => match err {
                CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                CoreError::NotFound(_) => StatusCode::NOT_FOUND,
                CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                CoreError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
                CoreError::Remote { .. } | CoreError::MalformedSuggestion(_) => {
                    StatusCode::BAD_GATEWAY
                }
                CoreError::Config(_)
                | CoreError::Crypto(_)
                | CoreError::Backend { .. }
                | CoreError::BackendMessage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Message sent to the client. Internal details are hidden unless `expose` is set.
    pub fn public_message(&self, expose: bool) -> String {
        match self {
            ApiError::Core(err) if !expose && !err.is_user_facing() => match err {
                CoreError::Remote { .. } => "upstream CRM error".to_string(),
                _ => "internal error".to_string(),
            },
            other => other.to_string(),
        }
    }
}

fn expose_internal_errors() -> bool {
    std::env::var(EXPOSE_INTERNAL_ERRORS_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            tracing::error!(error = %self, status = code.as_u16(), "request failed");
        } else {
            tracing::debug!(error = %self, status = code.as_u16(), "request rejected");
        }
        let body = ErrorBody {
            error: self.public_message(expose_internal_errors()),
        };
        (code, Json(body)).into_response()
    }
}
