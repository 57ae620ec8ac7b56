//! Integration lifecycle, schema, mapping and enrichment routes.

use crate::error::ApiError;
use crate::extract::{UserIdHeader, WorkspaceIdHeader};
use crate::routes::parse_id;
use crate::server::AppState;
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Extension, Json};
use roadsync_core::enrich::{BulkEnrichmentReport, CardEnrichment};
use roadsync_core::mapping::MappingConfig;
use roadsync_core::models::{CardId, IntegrationId, IntegrationSummary, RowId};
use roadsync_core::schema::SchemaCache;
use roadsync_core::search::CrmRecord;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/integrations", get(list_integrations))
        .route("/integrations/hubspot/authorize", get(authorize))
        .route("/integrations/hubspot/callback", get(oauth_callback))
        .route("/integrations/hubspot/private-app", post(connect_private_app))
        .route("/integrations/{integration_id}", delete(disconnect))
        .route("/integrations/{integration_id}/schema", get(get_schema))
        .route(
            "/integrations/{integration_id}/schema/discover",
            post(discover_schema),
        )
        .route(
            "/integrations/{integration_id}/mappings",
            get(get_mappings).put(put_mappings),
        )
        .route(
            "/integrations/{integration_id}/mappings/suggest",
            post(suggest_mappings),
        )
        .route("/integrations/{integration_id}/enrich", post(enrich_row))
        .route(
            "/integrations/{integration_id}/enrich/{card_id}",
            post(enrich_card),
        )
        .route(
            "/integrations/{integration_id}/search-deals",
            post(search_deals),
        )
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    /// Comma or space separated scopes; defaults apply when absent.
    #[serde(default)]
    pub scopes: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthorizeResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PrivateAppRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct EnrichRowRequest {
    pub row_id: RowId,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
}

fn split_scopes(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// GET /api/v1/integrations
#[tracing::instrument(level = "debug", skip_all)]
async fn list_integrations(
    WorkspaceIdHeader(workspace_id): WorkspaceIdHeader,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<IntegrationSummary>>, ApiError> {
    Ok(Json(state.service.list_integrations(workspace_id).await?))
}

/// GET /api/v1/integrations/hubspot/authorize: start the OAuth flow.
#[tracing::instrument(level = "info", skip_all)]
async fn authorize(
    WorkspaceIdHeader(workspace_id): WorkspaceIdHeader,
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Query(q): Query<AuthorizeQuery>,
) -> Result<Json<AuthorizeResponse>, ApiError> {
    let scopes = split_scopes(q.scopes.as_deref());
    let url = state.service.begin_oauth(workspace_id, user_id, &scopes)?;
    Ok(Json(AuthorizeResponse { url }))
}

/// GET /api/v1/integrations/hubspot/callback
///
/// The workspace and user come from the signed `state`, not from headers.
#[tracing::instrument(level = "info", skip_all)]
async fn oauth_callback(
    Extension(state): Extension<Arc<AppState>>,
    Query(q): Query<CallbackQuery>,
) -> Result<Json<IntegrationSummary>, ApiError> {
    if let Some(err) = q.error.filter(|e| !e.is_empty()) {
        return Err(roadsync_core::Error::Unauthorized(format!(
            "authorization denied: {err}"
        ))
        .into());
    }
    let code = q
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::InvalidInput("code is required".to_string()))?;
    let oauth_state = q
        .state
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::InvalidInput("state is required".to_string()))?;
    let summary = state.service.complete_oauth(&code, &oauth_state).await?;
    Ok(Json(summary))
}

/// POST /api/v1/integrations/hubspot/private-app
#[tracing::instrument(level = "info", skip_all)]
async fn connect_private_app(
    WorkspaceIdHeader(workspace_id): WorkspaceIdHeader,
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<PrivateAppRequest>,
) -> Result<(StatusCode, Json<IntegrationSummary>), ApiError> {
    let summary = state
        .service
        .connect_private_app(workspace_id, user_id, &body.token)
        .await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

/// DELETE /api/v1/integrations/{integration_id}
#[tracing::instrument(level = "info", skip_all)]
async fn disconnect(
    WorkspaceIdHeader(workspace_id): WorkspaceIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(integration_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let integration_id: IntegrationId = parse_id("integration_id", &integration_id)?;
    state
        .service
        .disconnect(workspace_id, integration_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/integrations/{integration_id}/schema/discover
#[tracing::instrument(level = "info", skip_all)]
async fn discover_schema(
    WorkspaceIdHeader(workspace_id): WorkspaceIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(integration_id): Path<String>,
) -> Result<Json<SchemaCache>, ApiError> {
    let integration_id: IntegrationId = parse_id("integration_id", &integration_id)?;
    let cache = state
        .service
        .discover_schema(workspace_id, integration_id)
        .await?;
    Ok(Json(cache))
}

/// GET /api/v1/integrations/{integration_id}/schema
#[tracing::instrument(level = "debug", skip_all)]
async fn get_schema(
    WorkspaceIdHeader(workspace_id): WorkspaceIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(integration_id): Path<String>,
) -> Result<Json<SchemaCache>, ApiError> {
    let integration_id: IntegrationId = parse_id("integration_id", &integration_id)?;
    let cache = state
        .service
        .get_schema(workspace_id, integration_id)
        .await?
        .ok_or_else(|| {
            roadsync_core::Error::NotFound(format!(
                "schema for integration '{integration_id}' has not been discovered"
            ))
        })?;
    Ok(Json(cache))
}

/// POST /api/v1/integrations/{integration_id}/mappings/suggest
///
/// Returns a validated proposal; nothing is saved.
#[tracing::instrument(level = "info", skip_all)]
async fn suggest_mappings(
    WorkspaceIdHeader(workspace_id): WorkspaceIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(integration_id): Path<String>,
) -> Result<Json<MappingConfig>, ApiError> {
    let integration_id: IntegrationId = parse_id("integration_id", &integration_id)?;
    let mapping = state
        .service
        .suggest_mappings(workspace_id, integration_id)
        .await?;
    Ok(Json(mapping))
}

/// GET /api/v1/integrations/{integration_id}/mappings
#[tracing::instrument(level = "debug", skip_all)]
async fn get_mappings(
    WorkspaceIdHeader(workspace_id): WorkspaceIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(integration_id): Path<String>,
) -> Result<Json<Option<MappingConfig>>, ApiError> {
    let integration_id: IntegrationId = parse_id("integration_id", &integration_id)?;
    let mapping = state
        .service
        .get_mappings(workspace_id, integration_id)
        .await?;
    Ok(Json(mapping))
}

/// PUT /api/v1/integrations/{integration_id}/mappings
#[tracing::instrument(level = "info", skip_all)]
async fn put_mappings(
    WorkspaceIdHeader(workspace_id): WorkspaceIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(integration_id): Path<String>,
    Json(mapping): Json<MappingConfig>,
) -> Result<Json<MappingConfig>, ApiError> {
    let integration_id: IntegrationId = parse_id("integration_id", &integration_id)?;
    let saved = state
        .service
        .save_mappings(workspace_id, integration_id, mapping)
        .await?;
    Ok(Json(saved))
}

/// POST /api/v1/integrations/{integration_id}/enrich: enrich every card in a row.
///
/// Stops early if the server begins shutting down; the report marks the rest cancelled.
#[tracing::instrument(level = "info", skip_all)]
async fn enrich_row(
    WorkspaceIdHeader(workspace_id): WorkspaceIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(integration_id): Path<String>,
    Json(body): Json<EnrichRowRequest>,
) -> Result<Json<BulkEnrichmentReport>, ApiError> {
    let integration_id: IntegrationId = parse_id("integration_id", &integration_id)?;
    let cancel = state.shutdown.child_token();
    let report = state
        .service
        .enrich_row(workspace_id, integration_id, body.row_id, &cancel)
        .await?;
    Ok(Json(report))
}

/// POST /api/v1/integrations/{integration_id}/enrich/{card_id}
#[tracing::instrument(level = "info", skip_all)]
async fn enrich_card(
    WorkspaceIdHeader(workspace_id): WorkspaceIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path((integration_id, card_id)): Path<(String, String)>,
) -> Result<Json<CardEnrichment>, ApiError> {
    let integration_id: IntegrationId = parse_id("integration_id", &integration_id)?;
    let card_id: CardId = parse_id("card_id", &card_id)?;
    let enrichment = state
        .service
        .enrich_card(workspace_id, integration_id, card_id)
        .await?;
    Ok(Json(enrichment))
}

/// POST /api/v1/integrations/{integration_id}/search-deals: free-text deal search for manual linking.
#[tracing::instrument(level = "debug", skip_all)]
async fn search_deals(
    WorkspaceIdHeader(workspace_id): WorkspaceIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(integration_id): Path<String>,
    Json(body): Json<SearchRequest>,
) -> Result<Json<Vec<CrmRecord>>, ApiError> {
    let integration_id: IntegrationId = parse_id("integration_id", &integration_id)?;
    let records = state
        .service
        .search_deals(workspace_id, integration_id, &body.query)
        .await?;
    Ok(Json(records))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_split_on_commas_and_spaces() {
        assert_eq!(
            split_scopes(Some("crm.objects.deals.read, crm.schemas.deals.read oauth")),
            vec![
                "crm.objects.deals.read",
                "crm.schemas.deals.read",
                "oauth"
            ]
        );
        assert!(split_scopes(None).is_empty());
        assert!(split_scopes(Some(" , ")).is_empty());
    }
}
