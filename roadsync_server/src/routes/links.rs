use crate::error::ApiError;
use crate::extract::WorkspaceIdHeader;
use crate::routes::parse_id;
use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Extension, Json};
use roadsync_core::links::CardLink;
use roadsync_core::models::{CardId, LinkId};
use roadsync_core::service::ManualLink;
use std::sync::Arc;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route(
            "/cards/{card_id}/links",
            get(list_card_links).post(create_card_link),
        )
        .route("/cards/{card_id}/links/{link_id}", delete(delete_card_link))
}

/// GET /api/v1/cards/{card_id}/links
#[tracing::instrument(level = "debug", skip_all)]
async fn list_card_links(
    WorkspaceIdHeader(workspace_id): WorkspaceIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(card_id): Path<String>,
) -> Result<Json<Vec<CardLink>>, ApiError> {
    let card_id: CardId = parse_id("card_id", &card_id)?;
    Ok(Json(
        state.service.list_card_links(workspace_id, card_id).await?,
    ))
}

/// POST /api/v1/cards/{card_id}/links: link a card to a CRM object by hand.
#[tracing::instrument(level = "info", skip_all)]
async fn create_card_link(
    WorkspaceIdHeader(workspace_id): WorkspaceIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(card_id): Path<String>,
    Json(body): Json<ManualLink>,
) -> Result<(StatusCode, Json<CardLink>), ApiError> {
    let card_id: CardId = parse_id("card_id", &card_id)?;
    let link = state
        .service
        .link_manually(workspace_id, card_id, body)
        .await?;
    Ok((StatusCode::CREATED, Json(link)))
}

/// DELETE /api/v1/cards/{card_id}/links/{link_id}
#[tracing::instrument(level = "info", skip_all)]
async fn delete_card_link(
    WorkspaceIdHeader(workspace_id): WorkspaceIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path((card_id, link_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let card_id: CardId = parse_id("card_id", &card_id)?;
    let link_id: LinkId = parse_id("link_id", &link_id)?;
    state.service.unlink(workspace_id, card_id, link_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
