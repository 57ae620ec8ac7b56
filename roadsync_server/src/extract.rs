use crate::error::ApiError;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use roadsync_core::models::{UserId, WorkspaceId};
use std::future;
use std::str::FromStr;

#[derive(Debug, Copy, Clone)]
pub struct WorkspaceIdHeader(pub WorkspaceId);

impl<S> FromRequestParts<S> for WorkspaceIdHeader
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    #[tracing::instrument(level = "debug", name = "extract.workspace_id", skip_all)]
    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let res = (|| {
            let raw = parts
                .headers
                .get("x-workspace-id")
                .ok_or(ApiError::MissingWorkspaceId)?
                .to_str()
                .map_err(|e| ApiError::InvalidWorkspaceId(e.to_string()))?;
            let workspace_id = WorkspaceId::from_str(raw.trim())
                .map_err(|e| ApiError::InvalidWorkspaceId(e.to_string()))?;
            Ok(Self(workspace_id))
        })();
        future::ready(res)
    }
}

/// Acting user; required only where the user is recorded (connect flows).
#[derive(Debug, Copy, Clone)]
pub struct UserIdHeader(pub UserId);

impl<S> FromRequestParts<S> for UserIdHeader
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    #[tracing::instrument(level = "debug", name = "extract.user_id", skip_all)]
    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let res = (|| {
            let raw = parts
                .headers
                .get("x-user-id")
                .ok_or(ApiError::MissingUserId)?
                .to_str()
                .map_err(|e| ApiError::InvalidUserId(e.to_string()))?;
            let user_id =
                UserId::from_str(raw.trim()).map_err(|e| ApiError::InvalidUserId(e.to_string()))?;
            Ok(Self(user_id))
        })();
        future::ready(res)
    }
}
