use crate::error::ApiError;
use axum::Router;
use axum::routing::get;
use std::str::FromStr;

pub mod health;
pub mod integrations;
pub mod links;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> Router {
    Router::new().nest(
        "/api/v1",
        Router::new()
            .route("/health", get(health::get_health))
            .merge(integrations::router())
            .merge(links::router()),
    )
}

/// Parse a path segment into a typed id.
pub(crate) fn parse_id<T>(what: &str, raw: &str) -> Result<T, ApiError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    T::from_str(raw).map_err(|e| ApiError::InvalidInput(format!("{what}: {e}")))
}
