//! OAuth authorization-code flow (with PKCE) and access-token lifecycle.
//!
//! `OAuthManager::get_access_token` is the single choke point every CRM call
//! goes through. It returns the cached token while it is comfortably valid
//! and refreshes otherwise. Refreshes are single-flighted per integration.

pub mod state;

use crate::config::OAuthConfig;
use crate::crm::transport::{HttpMethod, HttpRequest, HttpTransport, RequestBody};
use crate::models::{Integration, IntegrationId, IntegrationPatch, IntegrationStatus};
use crate::store::SyncStore;
use crate::vault::CredentialVault;
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;

pub use state::{StateClaims, StateSigner};

/// Tokens are refreshed this long before their recorded expiry.
pub const REFRESH_MARGIN_SECS: i64 = 5 * 60;

pub const DEFAULT_SCOPES: &[&str] = &[
    "crm.objects.deals.read",
    "crm.objects.companies.read",
    "crm.objects.contacts.read",
    "crm.schemas.deals.read",
];

/// Authorization URL plus the PKCE verifier the caller must keep (in `state`).
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub url: reqwest::Url,
    pub pkce_verifier: String,
}

impl AuthorizeRequest {
    pub fn with_state(&self, state: &str) -> String {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("state", state);
        url.to_string()
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

impl TokenPair {
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in.map(|secs| now + Duration::seconds(secs))
    }
}

/// Random verifier and its S256 challenge.
pub fn pkce_pair() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = pkce_challenge(&verifier);
    (verifier, challenge)
}

pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// True when the stored token is missing an expiry or still outside the margin.
pub fn token_is_fresh(integration: &Integration, now: DateTime<Utc>) -> bool {
    match integration.token_expires_at {
        None => true,
        Some(expires_at) => expires_at - Duration::seconds(REFRESH_MARGIN_SECS) > now,
    }
}

pub struct OAuthManager {
    config: Option<OAuthConfig>,
    transport: Arc<dyn HttpTransport>,
    vault: Arc<CredentialVault>,
    store: Arc<dyn SyncStore>,
    refresh_locks: DashMap<IntegrationId, Arc<Mutex<()>>>,
}

impl OAuthManager {
    pub fn new(
        config: Option<OAuthConfig>,
        transport: Arc<dyn HttpTransport>,
        vault: Arc<CredentialVault>,
        store: Arc<dyn SyncStore>,
    ) -> Self {
        Self {
            config,
            transport,
            vault,
            store,
            refresh_locks: DashMap::new(),
        }
    }

    fn config(&self) -> Result<&OAuthConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| Error::Config("hubspot oauth is not configured".to_string()))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn authorize_url(&self, requested_scopes: &[String]) -> Result<AuthorizeRequest> {
        let cfg = self.config()?;
        let scopes = if requested_scopes.is_empty() {
            DEFAULT_SCOPES.join(" ")
        } else {
            requested_scopes.join(" ")
        };
        let (verifier, challenge) = pkce_pair();
        let url = reqwest::Url::parse_with_params(
            &cfg.authorize_url,
            &[
                ("client_id", cfg.client_id.as_str()),
                ("redirect_uri", cfg.redirect_uri.as_str()),
                ("scope", scopes.as_str()),
                ("code_challenge", challenge.as_str()),
                ("code_challenge_method", "S256"),
            ],
        )
        .map_err(|e| Error::Config(format!("invalid authorize url: {e}")))?;
        Ok(AuthorizeRequest {
            url,
            pkce_verifier: verifier,
        })
    }

    async fn token_request(&self, fields: Vec<(String, String)>) -> Result<TokenPair> {
        let cfg = self.config()?;
        let resp = self
            .transport
            .send(HttpRequest {
                method: HttpMethod::Post,
                url: cfg.token_url.clone(),
                bearer: None,
                body: Some(RequestBody::Form(fields)),
            })
            .await?;
        if !resp.is_success() {
            return Err(Error::Unauthorized(format!(
                "token endpoint returned {}: {}",
                resp.status, resp.body
            )));
        }
        serde_json::from_str(&resp.body)
            .map_err(|e| Error::Unauthorized(format!("unreadable token response: {e}")))
    }

    /// One-shot code exchange. Errors if the code is expired, reused, or the verifier mismatches.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn exchange_code(&self, code: &str, pkce_verifier: &str) -> Result<TokenPair> {
        let cfg = self.config()?;
        if code.trim().is_empty() {
            return Err(Error::Unauthorized("authorization code is empty".to_string()));
        }
        let fields = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("client_id".to_string(), cfg.client_id.clone()),
            ("client_secret".to_string(), cfg.client_secret.clone()),
            ("redirect_uri".to_string(), cfg.redirect_uri.clone()),
            ("code".to_string(), code.to_string()),
            ("code_verifier".to_string(), pkce_verifier.to_string()),
        ];
        self.token_request(fields).await
    }

    /// Exchange the stored refresh token and persist the new pair.
    ///
    /// On failure the integration is marked `error` and the caller must
    /// reconnect; there is no automatic retry.
    #[tracing::instrument(level = "info", skip(self, integration), fields(integration_id = %integration.id))]
    pub async fn refresh(&self, integration: &Integration) -> Result<String> {
        let cfg = self.config()?;
        let outcome = match &integration.refresh_token {
            None => Err(Error::Unauthorized(
                "integration has no refresh token".to_string(),
            )),
            Some(blob) => match self.vault.decrypt(blob) {
                Ok(refresh_token) => {
                    let fields = vec![
                        ("grant_type".to_string(), "refresh_token".to_string()),
                        ("client_id".to_string(), cfg.client_id.clone()),
                        ("client_secret".to_string(), cfg.client_secret.clone()),
                        ("redirect_uri".to_string(), cfg.redirect_uri.clone()),
                        ("refresh_token".to_string(), refresh_token),
                    ];
                    self.token_request(fields).await
                }
                Err(e) => Err(e),
            },
        };

        let pair = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "token refresh failed; marking integration as error");
                let patch = IntegrationPatch {
                    status: Some(IntegrationStatus::Error),
                    ..Default::default()
                };
                if let Err(store_err) = self.store.update_integration(integration.id, &patch).await
                {
                    tracing::warn!(error = %store_err, "failed to record refresh failure");
                }
                return Err(match e {
                    Error::Unauthorized(msg) => Error::Unauthorized(msg),
                    other => Error::Unauthorized(format!("token refresh failed: {other}")),
                });
            }
        };

        let now = Utc::now();
        let refresh_blob = match &pair.refresh_token {
            Some(token) => Some(self.vault.encrypt(token)?),
            None => integration.refresh_token.clone(),
        };
        let patch = IntegrationPatch {
            status: Some(IntegrationStatus::Active),
            access_token: Some(self.vault.encrypt(&pair.access_token)?),
            refresh_token: Some(refresh_blob),
            token_expires_at: Some(pair.expires_at(now)),
            ..Default::default()
        };
        self.store.update_integration(integration.id, &patch).await?;
        tracing::info!("access token refreshed");
        Ok(pair.access_token)
    }

    /// Plaintext access token for a CRM call, refreshing first if needed.
    #[tracing::instrument(level = "debug", skip(self, integration), fields(integration_id = %integration.id))]
    pub async fn get_access_token(&self, integration: &Integration) -> Result<String> {
        if integration.status == IntegrationStatus::Error {
            return Err(Error::Unauthorized(
                "integration is in error state; reconnect required".to_string(),
            ));
        }
        if integration.is_private_app() || token_is_fresh(integration, Utc::now()) {
            return self.vault.decrypt(&integration.access_token);
        }

        let lock = self
            .refresh_locks
            .entry(integration.id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = self.refresh_single_flight(&lock, integration.id).await;
        // Only the map and this caller hold the lock: nobody is waiting on it.
        self.refresh_locks
            .remove_if(&integration.id, |_, l| Arc::strong_count(l) <= 2);
        result
    }

    async fn refresh_single_flight(&self, lock: &Mutex<()>, id: IntegrationId) -> Result<String> {
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited.
        let current = self
            .store
            .get_integration(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("integration '{id}' not found")))?;
        if current.status == IntegrationStatus::Error {
            return Err(Error::Unauthorized(
                "integration is in error state; reconnect required".to_string(),
            ));
        }
        if token_is_fresh(&current, Utc::now()) {
            return self.vault.decrypt(&current.access_token);
        }
        self.refresh(&current).await
    }
}

#[cfg(test)]
impl OAuthManager {
    pub(crate) fn refresh_lock_count(&self) -> usize {
        self.refresh_locks.len()
    }
}
