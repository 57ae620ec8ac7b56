#![cfg(test)]

use crate::config::{OAuthConfig, SyncConfig};
use crate::crm::{CrmClient, HttpRequest, HttpResponse, HttpTransport};
use crate::enrich::EnrichmentEngine;
use crate::mapping::suggest::MappingSuggester;
use crate::mapping::MappingConfig;
use crate::models::{
    AuthConfig, AuthMode, Card, CardId, Integration, IntegrationId, IntegrationPatch,
    IntegrationType, NewIntegration, RowId, UserId, WorkspaceId,
};
use crate::oauth::OAuthManager;
use crate::schema::SchemaDiscovery;
use crate::search::SearchEngine;
use crate::service::IntegrationService;
use crate::store::{SqliteSyncStore, SyncStore};
use crate::vault::CredentialVault;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub(crate) const API_BASE: &str = "https://crm.test";

/// `HttpTransport` that answers from a script and records every request.
///
/// Routes (URL substring -> response) answer repeatedly and are checked
/// first; queued responses are consumed in order otherwise.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    routes: Mutex<Vec<(String, HttpResponse)>>,
    queue: Mutex<VecDeque<HttpResponse>>,
    sent: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push(&self, status: u16, body: &str) {
        self.queue.lock().unwrap().push_back(HttpResponse {
            status,
            body: body.to_string(),
        });
    }

    pub(crate) fn route(&self, url_contains: &str, status: u16, body: &str) {
        self.routes.lock().unwrap().push((
            url_contains.to_string(),
            HttpResponse {
                status,
                body: body.to_string(),
            },
        ));
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn count_matching(&self, url_contains: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.contains(url_contains))
            .count()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = request.url.clone();
        self.sent.lock().unwrap().push(request);

        let routed = self
            .routes
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| url.contains(needle.as_str()))
            .map(|(_, resp)| resp.clone());
        if let Some(resp) = routed {
            return Ok(resp);
        }
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::BackendMessage(format!("no scripted response for {url}")))
    }
}

/// Suggester returning a canned reply.
pub(crate) struct FakeSuggester {
    reply: String,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeSuggester {
    pub(crate) fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl MappingSuggester for FakeSuggester {
    async fn suggest(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.reply.clone())
    }
}

/// In-memory store, scripted transport and the components wired over them.
pub(crate) struct TestHarness {
    pub config: SyncConfig,
    pub store: Arc<SqliteSyncStore>,
    pub vault: Arc<CredentialVault>,
    pub transport: Arc<ScriptedTransport>,
    pub oauth: Arc<OAuthManager>,
    pub workspace_id: WorkspaceId,
    pub user_id: UserId,
}

impl TestHarness {
    pub(crate) async fn new() -> Self {
        Self::build(SyncConfig::for_tests(API_BASE)).await
    }

    pub(crate) async fn with_oauth() -> Self {
        let mut config = SyncConfig::for_tests(API_BASE);
        config.oauth = Some(OAuthConfig {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            redirect_uri: "https://app.test/callback".to_string(),
            authorize_url: "https://auth.test/oauth/authorize".to_string(),
            token_url: format!("{API_BASE}/oauth/v1/token"),
        });
        Self::build(config).await
    }

    pub(crate) async fn build(config: SyncConfig) -> Self {
        let store = Arc::new(SqliteSyncStore::in_memory().await.unwrap());
        let vault = Arc::new(CredentialVault::new(config.encryption_key.as_deref()).unwrap());
        let transport = ScriptedTransport::new();
        let oauth = Arc::new(OAuthManager::new(
            config.oauth.clone(),
            transport.clone(),
            vault.clone(),
            store.clone(),
        ));
        Self {
            config,
            store,
            vault,
            transport,
            oauth,
            workspace_id: WorkspaceId::new(),
            user_id: UserId::new(),
        }
    }

    pub(crate) fn client(&self) -> CrmClient {
        CrmClient::new(self.transport.clone(), API_BASE)
    }

    pub(crate) fn discovery(&self) -> SchemaDiscovery {
        SchemaDiscovery::new(self.client(), self.oauth.clone())
    }

    pub(crate) fn search(&self) -> SearchEngine {
        SearchEngine::new(self.client(), self.oauth.clone())
    }

    pub(crate) fn enrichment(&self) -> EnrichmentEngine {
        EnrichmentEngine::new(self.store.clone(), self.search())
    }

    pub(crate) fn service(&self) -> IntegrationService {
        IntegrationService::new(&self.config, self.store.clone(), self.transport.clone()).unwrap()
    }

    async fn insert(
        &self,
        access: &str,
        refresh: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
        auth_mode: AuthMode,
    ) -> Integration {
        self.store
            .upsert_integration(&NewIntegration {
                workspace_id: self.workspace_id,
                integration_type: IntegrationType::Hubspot,
                access_token: self.vault.encrypt(access).unwrap(),
                refresh_token: refresh.map(|r| self.vault.encrypt(r).unwrap()),
                token_expires_at: expires_at,
                auth_config: AuthConfig {
                    auth_mode,
                    scopes: vec![],
                },
                created_by: self.user_id,
            })
            .await
            .unwrap()
    }

    /// OAuth integration whose refresh token is `refresh-plain`.
    pub(crate) async fn oauth_integration(
        &self,
        access: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Integration {
        self.insert(access, Some("refresh-plain"), expires_at, AuthMode::Oauth)
            .await
    }

    pub(crate) async fn private_app_integration(&self, token: &str) -> Integration {
        self.insert(token, None, None, AuthMode::PrivateApp).await
    }

    pub(crate) async fn set_mapping(&self, id: IntegrationId, mapping: MappingConfig) {
        let patch = IntegrationPatch {
            field_mapping: Some(mapping),
            ..Default::default()
        };
        self.store.update_integration(id, &patch).await.unwrap();
    }

    pub(crate) async fn seed_cards(&self, row_id: RowId, titles: &[&str]) -> Vec<Card> {
        let mut cards = Vec::new();
        for title in titles {
            let card = Card {
                id: CardId::new(),
                workspace_id: self.workspace_id,
                row_id,
                title: title.to_string(),
            };
            self.store.upsert_card(&card).await.unwrap();
            cards.push(card);
        }
        cards
    }
}
