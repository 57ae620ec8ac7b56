pub mod sqlite;

use crate::links::{CardLink, NewCardLink};
use crate::models::{
    Card, CardId, CustomField, CustomFieldId, CustomFieldValue, Integration, IntegrationId,
    IntegrationPatch, IntegrationType, LinkId, NewIntegration, RowId, WorkspaceId,
};
use crate::schema::SchemaCache;
use crate::Result;
use async_trait::async_trait;

pub use sqlite::SqliteSyncStore;

/// Persistence for integrations, schema snapshots, card links and the
/// custom-field sink written by enrichment.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Insert or replace credentials for (workspace, type). An existing row
    /// keeps its id and mappings and goes back to `active`.
    async fn upsert_integration(&self, new: &NewIntegration) -> Result<Integration>;
    async fn get_integration(&self, id: IntegrationId) -> Result<Option<Integration>>;
    async fn find_integration(
        &self,
        workspace_id: WorkspaceId,
        integration_type: IntegrationType,
    ) -> Result<Option<Integration>>;
    async fn list_integrations(&self, workspace_id: WorkspaceId) -> Result<Vec<Integration>>;
    /// Apply a patch and return the updated row. Errors with `NotFound`.
    async fn update_integration(
        &self,
        id: IntegrationId,
        patch: &IntegrationPatch,
    ) -> Result<Integration>;
    /// Delete the integration with its schema cache and links. Returns false if absent.
    async fn delete_integration(&self, id: IntegrationId) -> Result<bool>;

    async fn upsert_schema_cache(&self, cache: &SchemaCache) -> Result<()>;
    async fn get_schema_cache(&self, integration_id: IntegrationId)
    -> Result<Option<SchemaCache>>;

    // Links.
    async fn upsert_card_link(&self, link: &NewCardLink) -> Result<CardLink>;
    async fn list_card_links(&self, card_id: CardId) -> Result<Vec<CardLink>>;
    async fn list_integration_links(&self, integration_id: IntegrationId)
    -> Result<Vec<CardLink>>;
    async fn delete_card_link(&self, card_id: CardId, link_id: LinkId) -> Result<bool>;

    // Host entities.
    async fn upsert_card(&self, card: &Card) -> Result<()>;
    async fn get_card(&self, card_id: CardId) -> Result<Option<Card>>;
    async fn list_cards_in_row(&self, workspace_id: WorkspaceId, row_id: RowId)
    -> Result<Vec<Card>>;

    /// Resolve a custom field by (workspace, name), creating it if missing.
    async fn ensure_custom_field(
        &self,
        workspace_id: WorkspaceId,
        name: &str,
        field_type: &str,
    ) -> Result<CustomField>;
    async fn get_custom_field(&self, id: CustomFieldId) -> Result<Option<CustomField>>;
    async fn upsert_custom_field_value(&self, value: &CustomFieldValue) -> Result<()>;
    async fn list_custom_field_values(&self, card_id: CardId) -> Result<Vec<CustomFieldValue>>;
}
