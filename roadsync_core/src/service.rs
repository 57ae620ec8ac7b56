//! Application-facing operations over the sync engine.
//!
//! Every call is scoped to the caller's workspace. An integration, link or
//! card owned by another workspace is reported as not found.

use crate::config::SyncConfig;
use crate::crm::{CrmClient, HttpTransport, ReqwestTransport};
use crate::enrich::{BulkEnrichmentReport, CardEnrichment, EnrichmentEngine};
use crate::links::{CardLink, MatchedBy, NewCardLink};
use crate::mapping::suggest::{
    MappingSuggester, OpenAiCompatibleSuggester, build_suggestion_prompt, parse_suggestion,
};
use crate::mapping::{MAPPING_VERSION, MappingConfig};
use crate::models::{
    AuthConfig, AuthMode, CardId, Integration, IntegrationId, IntegrationPatch,
    IntegrationSummary, IntegrationType, LinkId, NewIntegration, RowId, UserId, WorkspaceId,
};
use crate::oauth::{DEFAULT_SCOPES, OAuthManager, StateSigner};
use crate::rate_limit::WorkspaceRateLimiter;
use crate::schema::{SchemaCache, SchemaDiscovery};
use crate::search::{CrmRecord, SearchEngine};
use crate::store::SyncStore;
use crate::vault::CredentialVault;
use crate::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Cheapest authenticated call; used to validate private-app tokens.
const TOKEN_PROBE_PATH: &str = "/crm/v3/objects/deals?limit=1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualLink {
    pub integration_id: IntegrationId,
    #[serde(default = "default_object_type")]
    pub object_type: String,
    pub object_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_object_type() -> String {
    "deal".to_string()
}

pub struct IntegrationService {
    store: Arc<dyn SyncStore>,
    vault: Arc<CredentialVault>,
    oauth: Arc<OAuthManager>,
    state: StateSigner,
    client: CrmClient,
    discovery: SchemaDiscovery,
    search: SearchEngine,
    enrichment: EnrichmentEngine,
    suggester: Option<Arc<dyn MappingSuggester>>,
    rate_limiter: WorkspaceRateLimiter,
}

impl IntegrationService {
    /// Wire the engine over `store` and `transport`.
    ///
    /// The AI suggester is enabled when `config.llm` is set.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        config: &SyncConfig,
        store: Arc<dyn SyncStore>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let vault = Arc::new(CredentialVault::new(config.encryption_key.as_deref())?);
        let state = StateSigner::new(config.state_signing_secret()?)?;
        let oauth = Arc::new(OAuthManager::new(
            config.oauth.clone(),
            transport.clone(),
            vault.clone(),
            store.clone(),
        ));
        let client = CrmClient::new(transport.clone(), config.crm.api_base.clone());
        let search = SearchEngine::new(client.clone(), oauth.clone());
        let suggester = config.llm.clone().map(|llm| {
            Arc::new(OpenAiCompatibleSuggester::new(transport.clone(), llm))
                as Arc<dyn MappingSuggester>
        });

        Ok(Self {
            discovery: SchemaDiscovery::new(client.clone(), oauth.clone()),
            enrichment: EnrichmentEngine::new(store.clone(), search.clone()),
            rate_limiter: WorkspaceRateLimiter::new(config.enrich_rate_limit.clone()),
            store,
            vault,
            oauth,
            state,
            client,
            search,
            suggester,
        })
    }

    /// Production wiring: reqwest transport with the configured timeout.
    pub fn from_config(config: &SyncConfig, store: Arc<dyn SyncStore>) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(config.crm.timeout)?);
        Self::new(config, store, transport)
    }

    pub fn with_suggester(mut self, suggester: Arc<dyn MappingSuggester>) -> Self {
        self.suggester = Some(suggester);
        self
    }

    async fn owned_integration(
        &self,
        workspace_id: WorkspaceId,
        integration_id: IntegrationId,
    ) -> Result<Integration> {
        self.store
            .get_integration(integration_id)
            .await?
            .filter(|i| i.workspace_id == workspace_id)
            .ok_or_else(|| Error::NotFound(format!("integration '{integration_id}' not found")))
    }

    // ── Connect ────────────────────────────────────────────────

    /// Authorization URL with a signed `state` carrying the caller and PKCE verifier.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn begin_oauth(
        &self,
        workspace_id: WorkspaceId,
        user_id: UserId,
        scopes: &[String],
    ) -> Result<String> {
        let request = self.oauth.authorize_url(scopes)?;
        let state = self
            .state
            .sign(workspace_id, user_id, &request.pkce_verifier)?;
        Ok(request.with_state(&state))
    }

    /// Finish the authorization-code flow. Nothing is stored unless both the
    /// state and the code check out.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn complete_oauth(&self, code: &str, state: &str) -> Result<IntegrationSummary> {
        let claims = self.state.verify(state)?;
        let pair = self.oauth.exchange_code(code, &claims.pkce_verifier).await?;

        let new = NewIntegration {
            workspace_id: claims.workspace_id,
            integration_type: IntegrationType::Hubspot,
            access_token: self.vault.encrypt(&pair.access_token)?,
            refresh_token: pair
                .refresh_token
                .as_deref()
                .map(|t| self.vault.encrypt(t))
                .transpose()?,
            token_expires_at: pair.expires_at(Utc::now()),
            auth_config: AuthConfig {
                auth_mode: AuthMode::Oauth,
                scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            },
            created_by: claims.user_id,
        };
        let integration = self.store.upsert_integration(&new).await?;
        tracing::info!(integration_id = %integration.id, workspace_id = %integration.workspace_id, "hubspot connected via oauth");
        Ok(integration.summary())
    }

    /// Store a static private-app token after a live probe succeeds.
    #[tracing::instrument(level = "info", skip(self, token))]
    pub async fn connect_private_app(
        &self,
        workspace_id: WorkspaceId,
        user_id: UserId,
        token: &str,
    ) -> Result<IntegrationSummary> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::InvalidInput("token is required".to_string()));
        }
        if let Err(e) = self.client.get(token, TOKEN_PROBE_PATH).await {
            tracing::warn!(error = %e, "private app token probe failed");
            return Err(Error::Unauthorized(format!(
                "hubspot rejected the private app token: {e}"
            )));
        }

        let new = NewIntegration {
            workspace_id,
            integration_type: IntegrationType::Hubspot,
            access_token: self.vault.encrypt(token)?,
            refresh_token: None,
            token_expires_at: None,
            auth_config: AuthConfig {
                auth_mode: AuthMode::PrivateApp,
                scopes: Vec::new(),
            },
            created_by: user_id,
        };
        let integration = self.store.upsert_integration(&new).await?;
        tracing::info!(integration_id = %integration.id, "hubspot connected via private app");
        Ok(integration.summary())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn list_integrations(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Vec<IntegrationSummary>> {
        Ok(self
            .store
            .list_integrations(workspace_id)
            .await?
            .iter()
            .map(Integration::summary)
            .collect())
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn disconnect(
        &self,
        workspace_id: WorkspaceId,
        integration_id: IntegrationId,
    ) -> Result<()> {
        self.owned_integration(workspace_id, integration_id).await?;
        self.store.delete_integration(integration_id).await?;
        Ok(())
    }

    // ── Schema & mappings ──────────────────────────────────────

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn discover_schema(
        &self,
        workspace_id: WorkspaceId,
        integration_id: IntegrationId,
    ) -> Result<SchemaCache> {
        let integration = self.owned_integration(workspace_id, integration_id).await?;
        let schema = self.discovery.discover(&integration).await?;
        let cache = SchemaCache {
            integration_id,
            schema,
            discovered_at: Utc::now(),
        };
        self.store.upsert_schema_cache(&cache).await?;
        Ok(cache)
    }

    pub async fn get_schema(
        &self,
        workspace_id: WorkspaceId,
        integration_id: IntegrationId,
    ) -> Result<Option<SchemaCache>> {
        self.owned_integration(workspace_id, integration_id).await?;
        self.store.get_schema_cache(integration_id).await
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn suggest_mappings(
        &self,
        workspace_id: WorkspaceId,
        integration_id: IntegrationId,
    ) -> Result<MappingConfig> {
        self.owned_integration(workspace_id, integration_id).await?;
        let suggester = self
            .suggester
            .as_ref()
            .ok_or_else(|| Error::Config("ai mapping suggestions are not configured".to_string()))?;
        let cache = self
            .store
            .get_schema_cache(integration_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound("no schema discovered for this integration yet".to_string())
            })?;

        let prompt = build_suggestion_prompt(&cache.schema);
        let reply = suggester.suggest(&prompt).await?;
        parse_suggestion(&reply, &cache.schema)
    }

    #[tracing::instrument(level = "info", skip(self, mapping))]
    pub async fn save_mappings(
        &self,
        workspace_id: WorkspaceId,
        integration_id: IntegrationId,
        mut mapping: MappingConfig,
    ) -> Result<MappingConfig> {
        self.owned_integration(workspace_id, integration_id).await?;
        mapping.validate()?;
        mapping.version = MAPPING_VERSION;

        let patch = IntegrationPatch {
            field_mapping: Some(mapping),
            ..Default::default()
        };
        let updated = self.store.update_integration(integration_id, &patch).await?;
        updated
            .field_mapping
            .ok_or_else(|| Error::BackendMessage("mapping missing after save".to_string()))
    }

    pub async fn get_mappings(
        &self,
        workspace_id: WorkspaceId,
        integration_id: IntegrationId,
    ) -> Result<Option<MappingConfig>> {
        Ok(self
            .owned_integration(workspace_id, integration_id)
            .await?
            .field_mapping)
    }

    // ── Enrichment ─────────────────────────────────────────────

    pub async fn enrich_card(
        &self,
        workspace_id: WorkspaceId,
        integration_id: IntegrationId,
        card_id: CardId,
    ) -> Result<CardEnrichment> {
        self.owned_integration(workspace_id, integration_id).await?;
        self.rate_limiter.check(workspace_id)?;
        self.enrichment.enrich_card(integration_id, card_id).await
    }

    pub async fn enrich_row(
        &self,
        workspace_id: WorkspaceId,
        integration_id: IntegrationId,
        row_id: RowId,
        cancel: &CancellationToken,
    ) -> Result<BulkEnrichmentReport> {
        self.owned_integration(workspace_id, integration_id).await?;
        self.rate_limiter.check(workspace_id)?;
        self.enrichment.enrich_row(integration_id, row_id, cancel).await
    }

    /// Ad hoc deal search with the integration's search properties.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn search_deals(
        &self,
        workspace_id: WorkspaceId,
        integration_id: IntegrationId,
        query: &str,
    ) -> Result<Vec<CrmRecord>> {
        let integration = self.owned_integration(workspace_id, integration_id).await?;
        let (search_properties, extra) = match &integration.field_mapping {
            Some(m) => (m.search_properties(), m.required_properties()),
            None => (Vec::new(), Vec::new()),
        };
        self.search
            .search(&integration, &[query.to_string()], &search_properties, &extra)
            .await
    }

    // ── Links ──────────────────────────────────────────────────

    async fn workspace_integration_ids(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<HashSet<IntegrationId>> {
        Ok(self
            .store
            .list_integrations(workspace_id)
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect())
    }

    pub async fn list_card_links(
        &self,
        workspace_id: WorkspaceId,
        card_id: CardId,
    ) -> Result<Vec<CardLink>> {
        let owned = self.workspace_integration_ids(workspace_id).await?;
        Ok(self
            .store
            .list_card_links(card_id)
            .await?
            .into_iter()
            .filter(|l| owned.contains(&l.integration_id))
            .collect())
    }

    #[tracing::instrument(level = "info", skip(self, link))]
    pub async fn link_manually(
        &self,
        workspace_id: WorkspaceId,
        card_id: CardId,
        link: ManualLink,
    ) -> Result<CardLink> {
        self.owned_integration(workspace_id, link.integration_id).await?;
        self.store
            .get_card(card_id)
            .await?
            .filter(|c| c.workspace_id == workspace_id)
            .ok_or_else(|| Error::NotFound(format!("card '{card_id}' not found")))?;
        if link.object_id.trim().is_empty() || link.object_type.trim().is_empty() {
            return Err(Error::InvalidInput(
                "object_type and object_id are required".to_string(),
            ));
        }
        self.store
            .upsert_card_link(&NewCardLink {
                card_id,
                integration_id: link.integration_id,
                external_object_type: link.object_type.trim().to_string(),
                external_object_id: link.object_id.trim().to_string(),
                external_name: link.name,
                matched_by: MatchedBy::Manual,
            })
            .await
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn unlink(
        &self,
        workspace_id: WorkspaceId,
        card_id: CardId,
        link_id: LinkId,
    ) -> Result<()> {
        let visible = self.list_card_links(workspace_id, card_id).await?;
        if !visible.iter().any(|l| l.id == link_id) {
            return Err(Error::NotFound(format!("link '{link_id}' not found")));
        }
        self.store.delete_card_link(card_id, link_id).await?;
        Ok(())
    }
}
