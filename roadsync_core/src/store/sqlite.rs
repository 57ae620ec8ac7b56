//! SQLite-backed `SyncStore`.
//!
//! Single WAL-mode file with foreign keys on. The schema is applied on open
//! and is idempotent.
//!
//! Usage:
//! ```ignore
//! let store = SqliteSyncStore::new("/var/lib/roadsync/sync.db").await?;
//! ```

use crate::links::{CardLink, MatchedBy, NewCardLink};
use crate::mapping::MappingConfig;
use crate::models::{
    AuthConfig, Card, CardId, CustomField, CustomFieldId, CustomFieldValue, Integration,
    IntegrationId, IntegrationPatch, IntegrationStatus, IntegrationType, LinkId, NewIntegration,
    PatchValue, RowId, WorkspaceId,
};
use crate::schema::{CrmSchema, SchemaCache};
use crate::store::SyncStore;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

#[derive(Clone)]
pub struct SqliteSyncStore {
    pool: SqlitePool,
}

impl SqliteSyncStore {
    /// Open (or create) the store at `path` and apply the schema.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::backend("sqlite_sync_store", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(db_err)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(db_err)?;

        Self::migrate(pool).await
    }

    /// Private in-memory database. Lives as long as the store.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(db_err)?
            .foreign_keys(true);

        // Every connection to `:memory:` is a separate database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(db_err)?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| Error::backend("sqlite_sync_store_migration", e))?;
        Ok(Self { pool })
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS integrations (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    integration_type TEXT NOT NULL,
    status TEXT NOT NULL,
    access_token TEXT NOT NULL,
    refresh_token TEXT,
    token_expires_at TEXT,
    auth_config TEXT NOT NULL,
    field_mapping TEXT,
    last_synced TEXT,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (workspace_id, integration_type)
);

CREATE TABLE IF NOT EXISTS schema_cache (
    integration_id TEXT PRIMARY KEY REFERENCES integrations(id),
    schema_json TEXT NOT NULL,
    discovered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS card_links (
    id TEXT PRIMARY KEY,
    card_id TEXT NOT NULL,
    integration_id TEXT NOT NULL REFERENCES integrations(id),
    external_object_type TEXT NOT NULL,
    external_object_id TEXT NOT NULL,
    external_name TEXT,
    matched_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (card_id, integration_id, external_object_type, external_object_id)
);

CREATE INDEX IF NOT EXISTS card_links_integration_idx ON card_links(integration_id);

CREATE TABLE IF NOT EXISTS cards (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    row_id TEXT NOT NULL,
    title TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS cards_row_idx ON cards(workspace_id, row_id);

CREATE TABLE IF NOT EXISTS custom_fields (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    name TEXT NOT NULL,
    field_type TEXT NOT NULL,
    UNIQUE (workspace_id, name)
);

CREATE TABLE IF NOT EXISTS custom_field_values (
    card_id TEXT NOT NULL,
    custom_field_id TEXT NOT NULL REFERENCES custom_fields(id),
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (card_id, custom_field_id)
);
"#;

const INTEGRATION_COLUMNS: &str = "id, workspace_id, integration_type, status, access_token, \
     refresh_token, token_expires_at, auth_config, field_mapping, last_synced, created_by, \
     created_at, updated_at";

const LINK_COLUMNS: &str = "id, card_id, integration_id, external_object_type, \
     external_object_id, external_name, matched_by, created_at";

fn db_err(e: sqlx::Error) -> Error {
    Error::backend("sqlite_sync_store", e)
}

fn corrupt(column: &str, detail: impl std::fmt::Display) -> Error {
    Error::BackendMessage(format!("sqlite_sync_store: bad value in {column}: {detail}"))
}

fn parse_dt(column: &str, s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(column, e))
}

fn parse_opt_dt(column: &str, s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(|s| parse_dt(column, s)).transpose()
}

fn text(r: &SqliteRow, column: &str) -> Result<String> {
    r.try_get::<String, _>(column).map_err(db_err)
}

fn opt_text(r: &SqliteRow, column: &str) -> Result<Option<String>> {
    r.try_get::<Option<String>, _>(column).map_err(db_err)
}

fn parse_col<T>(r: &SqliteRow, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = text(r, column)?;
    raw.parse::<T>().map_err(|e| corrupt(column, e))
}

fn row_to_integration(r: &SqliteRow) -> Result<Integration> {
    let auth_config: AuthConfig =
        serde_json::from_str(&text(r, "auth_config")?).map_err(|e| corrupt("auth_config", e))?;
    let field_mapping = opt_text(r, "field_mapping")?
        .map(|s| MappingConfig::from_json(&s))
        .transpose()?;

    Ok(Integration {
        id: parse_col(r, "id")?,
        workspace_id: parse_col(r, "workspace_id")?,
        integration_type: parse_col::<IntegrationType>(r, "integration_type")?,
        status: parse_col::<IntegrationStatus>(r, "status")?,
        access_token: text(r, "access_token")?,
        refresh_token: opt_text(r, "refresh_token")?,
        token_expires_at: parse_opt_dt("token_expires_at", opt_text(r, "token_expires_at")?)?,
        auth_config,
        field_mapping,
        last_synced: parse_opt_dt("last_synced", opt_text(r, "last_synced")?)?,
        created_by: parse_col(r, "created_by")?,
        created_at: parse_dt("created_at", &text(r, "created_at")?)?,
        updated_at: parse_dt("updated_at", &text(r, "updated_at")?)?,
    })
}

fn row_to_link(r: &SqliteRow) -> Result<CardLink> {
    Ok(CardLink {
        id: parse_col(r, "id")?,
        card_id: parse_col(r, "card_id")?,
        integration_id: parse_col(r, "integration_id")?,
        external_object_type: text(r, "external_object_type")?,
        external_object_id: text(r, "external_object_id")?,
        external_name: opt_text(r, "external_name")?,
        matched_by: parse_col::<MatchedBy>(r, "matched_by")?,
        created_at: parse_dt("created_at", &text(r, "created_at")?)?,
    })
}

fn row_to_card(r: &SqliteRow) -> Result<Card> {
    Ok(Card {
        id: parse_col(r, "id")?,
        workspace_id: parse_col(r, "workspace_id")?,
        row_id: parse_col(r, "row_id")?,
        title: text(r, "title")?,
    })
}

fn row_to_custom_field(r: &SqliteRow) -> Result<CustomField> {
    Ok(CustomField {
        id: parse_col(r, "id")?,
        workspace_id: parse_col(r, "workspace_id")?,
        name: text(r, "name")?,
        field_type: text(r, "field_type")?,
    })
}

// ── SyncStore impl ─────────────────────────────────────────────

#[async_trait]
impl SyncStore for SqliteSyncStore {
    #[tracing::instrument(level = "debug", skip(self, new), fields(workspace_id = %new.workspace_id))]
    async fn upsert_integration(&self, new: &NewIntegration) -> Result<Integration> {
        let now = Utc::now().to_rfc3339();
        let auth_config = serde_json::to_string(&new.auth_config)
            .map_err(|e| Error::backend("serialize auth_config", e))?;

        sqlx::query(
            "INSERT INTO integrations (id, workspace_id, integration_type, status, access_token,
                refresh_token, token_expires_at, auth_config, field_mapping, last_synced,
                created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?7, NULL, NULL, ?8, ?9, ?9)
             ON CONFLICT(workspace_id, integration_type) DO UPDATE SET
               status = 'active',
               access_token = excluded.access_token,
               refresh_token = excluded.refresh_token,
               token_expires_at = excluded.token_expires_at,
               auth_config = excluded.auth_config,
               updated_at = excluded.updated_at",
        )
        .bind(IntegrationId::new().to_string())
        .bind(new.workspace_id.to_string())
        .bind(new.integration_type.as_str())
        .bind(&new.access_token)
        .bind(&new.refresh_token)
        .bind(new.token_expires_at.map(|dt| dt.to_rfc3339()))
        .bind(auth_config)
        .bind(new.created_by.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.find_integration(new.workspace_id, new.integration_type)
            .await?
            .ok_or_else(|| Error::BackendMessage("integration vanished after upsert".to_string()))
    }

    async fn get_integration(&self, id: IntegrationId) -> Result<Option<Integration>> {
        let row = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_integration).transpose()
    }

    async fn find_integration(
        &self,
        workspace_id: WorkspaceId,
        integration_type: IntegrationType,
    ) -> Result<Option<Integration>> {
        let row = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations
             WHERE workspace_id = ?1 AND integration_type = ?2"
        ))
        .bind(workspace_id.to_string())
        .bind(integration_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_integration).transpose()
    }

    async fn list_integrations(&self, workspace_id: WorkspaceId) -> Result<Vec<Integration>> {
        let rows = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations
             WHERE workspace_id = ?1
             ORDER BY created_at, id"
        ))
        .bind(workspace_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_integration).collect()
    }

    #[tracing::instrument(level = "debug", skip(self, patch))]
    async fn update_integration(
        &self,
        id: IntegrationId,
        patch: &IntegrationPatch,
    ) -> Result<Integration> {
        let assignments = patch.assignments()?;
        if !assignments.is_empty() {
            // Column names come from the PatchColumn allow-list, never from input.
            let mut sets: Vec<String> = assignments
                .iter()
                .enumerate()
                .map(|(i, (col, _))| format!("{} = ?{}", col.as_str(), i + 1))
                .collect();
            let n = assignments.len();
            sets.push(format!("updated_at = ?{}", n + 1));
            let sql = format!(
                "UPDATE integrations SET {} WHERE id = ?{}",
                sets.join(", "),
                n + 2
            );

            let mut query = sqlx::query(&sql);
            for (_, value) in assignments {
                query = match value {
                    PatchValue::Text(v) => query.bind(v),
                    PatchValue::NullableText(v) => query.bind(v),
                };
            }
            let res = query
                .bind(Utc::now().to_rfc3339())
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
            if res.rows_affected() == 0 {
                return Err(Error::NotFound(format!("integration '{id}' not found")));
            }
        }

        self.get_integration(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("integration '{id}' not found")))
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn delete_integration(&self, id: IntegrationId) -> Result<bool> {
        let id = id.to_string();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("DELETE FROM schema_cache WHERE integration_id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let links = sqlx::query("DELETE FROM card_links WHERE integration_id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let res = sqlx::query("DELETE FROM integrations WHERE id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        tracing::debug!(links = links.rows_affected(), "integration deleted");
        Ok(res.rows_affected() > 0)
    }

    async fn upsert_schema_cache(&self, cache: &SchemaCache) -> Result<()> {
        let json = serde_json::to_string(&cache.schema)
            .map_err(|e| Error::backend("serialize crm schema", e))?;
        sqlx::query(
            "INSERT INTO schema_cache (integration_id, schema_json, discovered_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(integration_id) DO UPDATE SET
               schema_json = excluded.schema_json,
               discovered_at = excluded.discovered_at",
        )
        .bind(cache.integration_id.to_string())
        .bind(json)
        .bind(cache.discovered_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_schema_cache(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<SchemaCache>> {
        let row = sqlx::query(
            "SELECT integration_id, schema_json, discovered_at
             FROM schema_cache WHERE integration_id = ?1",
        )
        .bind(integration_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(r) = row else {
            return Ok(None);
        };
        let schema: CrmSchema =
            serde_json::from_str(&text(&r, "schema_json")?).map_err(|e| corrupt("schema_json", e))?;
        Ok(Some(SchemaCache {
            integration_id: parse_col(&r, "integration_id")?,
            schema,
            discovered_at: parse_dt("discovered_at", &text(&r, "discovered_at")?)?,
        }))
    }

    #[tracing::instrument(level = "debug", skip(self, link), fields(card_id = %link.card_id))]
    async fn upsert_card_link(&self, link: &NewCardLink) -> Result<CardLink> {
        // An existing link wins untouched, so manual provenance survives re-enrichment.
        sqlx::query(
            "INSERT INTO card_links (id, card_id, integration_id, external_object_type,
                external_object_id, external_name, matched_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(card_id, integration_id, external_object_type, external_object_id)
             DO NOTHING",
        )
        .bind(LinkId::new().to_string())
        .bind(link.card_id.to_string())
        .bind(link.integration_id.to_string())
        .bind(&link.external_object_type)
        .bind(&link.external_object_id)
        .bind(&link.external_name)
        .bind(link.matched_by.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM card_links
             WHERE card_id = ?1 AND integration_id = ?2
               AND external_object_type = ?3 AND external_object_id = ?4"
        ))
        .bind(link.card_id.to_string())
        .bind(link.integration_id.to_string())
        .bind(&link.external_object_type)
        .bind(&link.external_object_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row_to_link(&row)
    }

    async fn list_card_links(&self, card_id: CardId) -> Result<Vec<CardLink>> {
        let rows = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM card_links
             WHERE card_id = ?1
             ORDER BY created_at, rowid"
        ))
        .bind(card_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_link).collect()
    }

    async fn list_integration_links(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Vec<CardLink>> {
        let rows = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM card_links
             WHERE integration_id = ?1
             ORDER BY created_at, rowid"
        ))
        .bind(integration_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_link).collect()
    }

    async fn delete_card_link(&self, card_id: CardId, link_id: LinkId) -> Result<bool> {
        let res = sqlx::query("DELETE FROM card_links WHERE id = ?1 AND card_id = ?2")
            .bind(link_id.to_string())
            .bind(card_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn upsert_card(&self, card: &Card) -> Result<()> {
        sqlx::query(
            "INSERT INTO cards (id, workspace_id, row_id, title)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
               workspace_id = excluded.workspace_id,
               row_id = excluded.row_id,
               title = excluded.title",
        )
        .bind(card.id.to_string())
        .bind(card.workspace_id.to_string())
        .bind(card.row_id.to_string())
        .bind(&card.title)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_card(&self, card_id: CardId) -> Result<Option<Card>> {
        let row = sqlx::query("SELECT id, workspace_id, row_id, title FROM cards WHERE id = ?1")
            .bind(card_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_card).transpose()
    }

    async fn list_cards_in_row(
        &self,
        workspace_id: WorkspaceId,
        row_id: RowId,
    ) -> Result<Vec<Card>> {
        // Insertion order is the row's display order.
        let rows = sqlx::query(
            "SELECT id, workspace_id, row_id, title FROM cards
             WHERE workspace_id = ?1 AND row_id = ?2
             ORDER BY rowid",
        )
        .bind(workspace_id.to_string())
        .bind(row_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_card).collect()
    }

    async fn ensure_custom_field(
        &self,
        workspace_id: WorkspaceId,
        name: &str,
        field_type: &str,
    ) -> Result<CustomField> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("custom field name is empty".to_string()));
        }
        sqlx::query(
            "INSERT INTO custom_fields (id, workspace_id, name, field_type)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(workspace_id, name) DO NOTHING",
        )
        .bind(CustomFieldId::new().to_string())
        .bind(workspace_id.to_string())
        .bind(name)
        .bind(field_type)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(
            "SELECT id, workspace_id, name, field_type FROM custom_fields
             WHERE workspace_id = ?1 AND name = ?2",
        )
        .bind(workspace_id.to_string())
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row_to_custom_field(&row)
    }

    async fn get_custom_field(&self, id: CustomFieldId) -> Result<Option<CustomField>> {
        let row = sqlx::query(
            "SELECT id, workspace_id, name, field_type FROM custom_fields WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_custom_field).transpose()
    }

    async fn upsert_custom_field_value(&self, value: &CustomFieldValue) -> Result<()> {
        sqlx::query(
            "INSERT INTO custom_field_values (card_id, custom_field_id, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(card_id, custom_field_id) DO UPDATE SET
               value = excluded.value,
               updated_at = excluded.updated_at",
        )
        .bind(value.card_id.to_string())
        .bind(value.custom_field_id.to_string())
        .bind(&value.value)
        .bind(value.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_custom_field_values(&self, card_id: CardId) -> Result<Vec<CustomFieldValue>> {
        let rows = sqlx::query(
            "SELECT card_id, custom_field_id, value, updated_at FROM custom_field_values
             WHERE card_id = ?1
             ORDER BY rowid",
        )
        .bind(card_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|r| {
                Ok(CustomFieldValue {
                    card_id: parse_col(r, "card_id")?,
                    custom_field_id: parse_col(r, "custom_field_id")?,
                    value: text(r, "value")?,
                    updated_at: parse_dt("updated_at", &text(r, "updated_at")?)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Aggregation, FieldMapping, ObjectType};
    use crate::models::{AuthMode, UserId};

    fn new_integration(workspace_id: WorkspaceId, token: &str) -> NewIntegration {
        NewIntegration {
            workspace_id,
            integration_type: IntegrationType::Hubspot,
            access_token: token.to_string(),
            refresh_token: Some("refresh-blob".to_string()),
            token_expires_at: Some(Utc::now()),
            auth_config: AuthConfig {
                auth_mode: AuthMode::Oauth,
                scopes: vec!["crm.objects.deals.read".to_string()],
            },
            created_by: UserId::new(),
        }
    }

    fn link(card_id: CardId, integration_id: IntegrationId, matched_by: MatchedBy) -> NewCardLink {
        NewCardLink {
            card_id,
            integration_id,
            external_object_type: "deal".to_string(),
            external_object_id: "42".to_string(),
            external_name: Some(format!("{} name", matched_by.as_str())),
            matched_by,
        }
    }

    #[tokio::test]
    async fn upsert_integration_replaces_credentials_for_same_pair() {
        let store = SqliteSyncStore::in_memory().await.unwrap();
        let ws = WorkspaceId::new();

        let first = store.upsert_integration(&new_integration(ws, "a")).await.unwrap();
        let mapping = MappingConfig::new(vec!["dealname".into()], vec![]);
        store
            .update_integration(
                first.id,
                &IntegrationPatch {
                    status: Some(IntegrationStatus::Error),
                    field_mapping: Some(mapping.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let second = store.upsert_integration(&new_integration(ws, "b")).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.access_token, "b");
        assert_eq!(second.status, IntegrationStatus::Active);
        assert_eq!(second.field_mapping, Some(mapping));
        assert_eq!(store.list_integrations(ws).await.unwrap().len(), 1);

        let other = store
            .upsert_integration(&new_integration(WorkspaceId::new(), "c"))
            .await
            .unwrap();
        assert_ne!(other.id, first.id);
    }

    #[tokio::test]
    async fn patch_writes_only_provided_columns() {
        let store = SqliteSyncStore::in_memory().await.unwrap();
        let created = store
            .upsert_integration(&new_integration(WorkspaceId::new(), "tok"))
            .await
            .unwrap();

        let mapping = MappingConfig::new(
            vec!["dealname".into()],
            vec![FieldMapping {
                crm_property: "amount".into(),
                object_type: ObjectType::Deal,
                aggregation: Aggregation::Sum,
                custom_field_id: None,
                custom_field_name: "Revenue".into(),
                rationale: String::new(),
            }],
        );
        let updated = store
            .update_integration(
                created.id,
                &IntegrationPatch {
                    refresh_token: Some(None),
                    token_expires_at: Some(None),
                    field_mapping: Some(mapping.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.access_token, "tok");
        assert_eq!(updated.status, IntegrationStatus::Active);
        assert_eq!(updated.refresh_token, None);
        assert_eq!(updated.token_expires_at, None);
        assert_eq!(updated.field_mapping, Some(mapping));
        assert!(updated.updated_at >= created.updated_at);

        let missing = store
            .update_integration(
                IntegrationId::new(),
                &IntegrationPatch {
                    status: Some(IntegrationStatus::Error),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(missing, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn card_link_upsert_is_idempotent_and_keeps_manual_provenance() {
        let store = SqliteSyncStore::in_memory().await.unwrap();
        let integration = store
            .upsert_integration(&new_integration(WorkspaceId::new(), "tok"))
            .await
            .unwrap();
        let card = CardId::new();

        let manual = store
            .upsert_card_link(&link(card, integration.id, MatchedBy::Manual))
            .await
            .unwrap();
        let again = store
            .upsert_card_link(&link(card, integration.id, MatchedBy::Auto))
            .await
            .unwrap();

        assert_eq!(again.id, manual.id);
        assert_eq!(again.matched_by, MatchedBy::Manual);
        assert_eq!(again.external_name.as_deref(), Some("manual name"));
        assert_eq!(store.list_card_links(card).await.unwrap().len(), 1);

        assert!(!store.delete_card_link(CardId::new(), manual.id).await.unwrap());
        assert!(store.delete_card_link(card, manual.id).await.unwrap());
        assert!(store.list_card_links(card).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_integration_cascades() {
        let store = SqliteSyncStore::in_memory().await.unwrap();
        let integration = store
            .upsert_integration(&new_integration(WorkspaceId::new(), "tok"))
            .await
            .unwrap();
        store
            .upsert_schema_cache(&SchemaCache {
                integration_id: integration.id,
                schema: CrmSchema::default(),
                discovered_at: Utc::now(),
            })
            .await
            .unwrap();
        let card = CardId::new();
        store
            .upsert_card_link(&link(card, integration.id, MatchedBy::Auto))
            .await
            .unwrap();

        assert!(store.delete_integration(integration.id).await.unwrap());
        assert!(store.get_integration(integration.id).await.unwrap().is_none());
        assert!(store.get_schema_cache(integration.id).await.unwrap().is_none());
        assert!(store.list_integration_links(integration.id).await.unwrap().is_empty());
        assert!(store.list_card_links(card).await.unwrap().is_empty());

        assert!(!store.delete_integration(integration.id).await.unwrap());
    }

    #[tokio::test]
    async fn custom_fields_resolve_by_name_and_values_upsert() {
        let store = SqliteSyncStore::in_memory().await.unwrap();
        let ws = WorkspaceId::new();

        let a = store.ensure_custom_field(ws, "Revenue", "number").await.unwrap();
        let b = store.ensure_custom_field(ws, " Revenue ", "number").await.unwrap();
        assert_eq!(a.id, b.id);
        let other_ws = store
            .ensure_custom_field(WorkspaceId::new(), "Revenue", "number")
            .await
            .unwrap();
        assert_ne!(other_ws.id, a.id);

        let card = CardId::new();
        for value in ["10", "30"] {
            store
                .upsert_custom_field_value(&CustomFieldValue {
                    card_id: card,
                    custom_field_id: a.id,
                    value: value.to_string(),
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let values = store.list_custom_field_values(card).await.unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, "30");
    }

    #[tokio::test]
    async fn cards_in_row_keep_insertion_order() {
        let store = SqliteSyncStore::in_memory().await.unwrap();
        let ws = WorkspaceId::new();
        let row = RowId::new();
        let titles = ["Zeta", "Alpha", "Mid"];
        for title in titles {
            store
                .upsert_card(&Card {
                    id: CardId::new(),
                    workspace_id: ws,
                    row_id: row,
                    title: title.to_string(),
                })
                .await
                .unwrap();
        }
        let listed: Vec<String> = store
            .list_cards_in_row(ws, row)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.title)
            .collect();
        assert_eq!(listed, titles);
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let path = std::env::temp_dir()
            .join(format!("roadsync-{}", uuid::Uuid::new_v4()))
            .join("sync.db");
        let ws = WorkspaceId::new();
        let id = {
            let store = SqliteSyncStore::new(&path).await.unwrap();
            store.upsert_integration(&new_integration(ws, "tok")).await.unwrap().id
        };
        let reopened = SqliteSyncStore::new(&path).await.unwrap();
        let found = reopened.find_integration(ws, IntegrationType::Hubspot).await.unwrap();
        assert_eq!(found.map(|i| i.id), Some(id));
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
