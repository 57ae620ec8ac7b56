use crate::routes;
use axum::{Extension, Router};
use roadsync_core::service::IntegrationService;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<IntegrationService>,
    /// Cancelled on shutdown; bulk enrichment runs derive child tokens from it.
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(service: Arc<IntegrationService>) -> Self {
        Self {
            service,
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .merge(routes::router())
        .layer(Extension(state))
        .layer(SetRequestIdLayer::new(
            axum::http::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "roadsync listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            tracing::info!("shutdown requested; cancelling in-flight enrichment");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use roadsync_core::config::SyncConfig;
    use roadsync_core::models::{IntegrationId, WorkspaceId};
    use roadsync_core::store::SqliteSyncStore;
    use tower::ServiceExt;

    async fn app() -> Router {
        let store = Arc::new(SqliteSyncStore::in_memory().await.unwrap());
        let service =
            IntegrationService::from_config(&SyncConfig::for_tests("https://crm.test"), store)
                .unwrap();
        router(AppState::new(Arc::new(service)))
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn health_reports_ok_with_request_id() {
        let resp = app()
            .await
            .oneshot(
                Request::get("/api/v1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn workspace_header_is_required() {
        let (status, body) = call(
            app().await,
            Request::get("/api/v1/integrations")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("x-workspace-id"));

        let (status, _) = call(
            app().await,
            Request::get("/api/v1/integrations")
                .header("x-workspace-id", "not-a-uuid")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_workspace_lists_nothing() {
        let (status, body) = call(
            app().await,
            Request::get("/api/v1/integrations")
                .header("x-workspace-id", WorkspaceId::new().to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn unknown_integration_is_not_found() {
        let uri = format!("/api/v1/integrations/{}/mappings", IntegrationId::new());
        let (status, _) = call(
            app().await,
            Request::get(uri)
                .header("x-workspace-id", WorkspaceId::new().to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            app().await,
            Request::get("/api/v1/integrations/nope/mappings")
                .header("x-workspace-id", WorkspaceId::new().to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("integration_id"));
    }

    #[tokio::test]
    async fn oauth_routes_report_missing_configuration() {
        let (status, body) = call(
            app().await,
            Request::get("/api/v1/integrations/hubspot/authorize")
                .header("x-workspace-id", WorkspaceId::new().to_string())
                .header("x-user-id", uuid::Uuid::new_v4().to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("not configured"));

        let (status, _) = call(
            app().await,
            Request::get("/api/v1/integrations/hubspot/callback?error=access_denied")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn private_app_requires_user_and_token() {
        let (status, body) = call(
            app().await,
            Request::post("/api/v1/integrations/hubspot/private-app")
                .header("x-workspace-id", WorkspaceId::new().to_string())
                .header("content-type", "application/json")
                .body(Body::from(r#"{"token":"pat-1"}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("x-user-id"));

        let (status, _) = call(
            app().await,
            Request::post("/api/v1/integrations/hubspot/private-app")
                .header("x-workspace-id", WorkspaceId::new().to_string())
                .header("x-user-id", uuid::Uuid::new_v4().to_string())
                .header("content-type", "application/json")
                .body(Body::from(r#"{"token":"   "}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
