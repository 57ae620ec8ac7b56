use crate::{Error, Result};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.hubapi.com";
pub const DEFAULT_AUTHORIZE_URL: &str = "https://app.hubspot.com/oauth/authorize";

/// OAuth client registration. Absent when only private-app tokens are used.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
}

#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub api_base: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// Runtime configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Vault secret. Checked lazily by `CredentialVault::new`.
    pub encryption_key: Option<String>,
    /// Secret used to sign OAuth `state`. Falls back to the encryption key.
    pub state_secret: Option<String>,
    pub oauth: Option<OAuthConfig>,
    pub crm: CrmConfig,
    pub llm: Option<LlmConfig>,
    pub enrich_rate_limit: RateLimitConfig,
}

impl SyncConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let env = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());

        let api_base = env("HUBSPOT_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let timeout_ms = env("ROADSYNC_HTTP_TIMEOUT_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(20_000);

        let oauth = match (
            env("HUBSPOT_CLIENT_ID"),
            env("HUBSPOT_CLIENT_SECRET"),
            env("HUBSPOT_REDIRECT_URI"),
        ) {
            (Some(client_id), Some(client_secret), Some(redirect_uri)) => Some(OAuthConfig {
                client_id,
                client_secret,
                redirect_uri,
                authorize_url: env("HUBSPOT_AUTHORIZE_URL")
                    .unwrap_or_else(|| DEFAULT_AUTHORIZE_URL.to_string()),
                token_url: env("HUBSPOT_TOKEN_URL").unwrap_or_else(|| {
                    format!("{}/oauth/v1/token", api_base.trim_end_matches('/'))
                }),
            }),
            (None, None, None) => None,
            _ => {
                return Err(Error::Config(
                    "HUBSPOT_CLIENT_ID, HUBSPOT_CLIENT_SECRET and HUBSPOT_REDIRECT_URI must be set together"
                        .to_string(),
                ));
            }
        };

        let llm = match (env("LLM_API_BASE"), env("LLM_API_KEY")) {
            (Some(api_base), Some(api_key)) => Some(LlmConfig {
                api_base,
                api_key,
                model: env("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            }),
            _ => None,
        };

        let defaults = RateLimitConfig::default();
        let enrich_rate_limit = RateLimitConfig {
            max_requests: env("ROADSYNC_ENRICH_RATE_LIMIT")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(defaults.max_requests),
            window: env("ROADSYNC_ENRICH_RATE_WINDOW_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.window),
        };

        let cfg = Self {
            encryption_key: env("ROADSYNC_ENCRYPTION_KEY"),
            state_secret: env("ROADSYNC_STATE_SECRET"),
            oauth,
            crm: CrmConfig {
                api_base,
                timeout: Duration::from_millis(timeout_ms),
            },
            llm,
            enrich_rate_limit,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn validate(&self) -> Result<()> {
        if self.crm.api_base.trim().is_empty() {
            return Err(Error::Config("crm.api_base is empty".to_string()));
        }
        if self.crm.timeout.is_zero() {
            return Err(Error::Config("crm.timeout must be > 0".to_string()));
        }
        if self.enrich_rate_limit.max_requests == 0 {
            return Err(Error::Config(
                "enrich_rate_limit.max_requests must be > 0".to_string(),
            ));
        }
        if self.enrich_rate_limit.window.is_zero() {
            return Err(Error::Config(
                "enrich_rate_limit.window must be > 0".to_string(),
            ));
        }
        if let Some(oauth) = &self.oauth {
            if oauth.token_url.trim().is_empty() || oauth.authorize_url.trim().is_empty() {
                return Err(Error::Config("oauth urls must not be empty".to_string()));
            }
        }
        Ok(())
    }

    /// Secret for signing OAuth state tokens.
    pub fn state_signing_secret(&self) -> Result<&str> {
        self.state_secret
            .as_deref()
            .or(self.encryption_key.as_deref())
            .ok_or_else(|| {
                Error::Config(
                    "ROADSYNC_STATE_SECRET or ROADSYNC_ENCRYPTION_KEY must be set".to_string(),
                )
            })
    }

    /// Configuration suitable for tests: no OAuth app, no LLM.
    pub fn for_tests(api_base: impl Into<String>) -> Self {
        Self {
            encryption_key: Some("roadsync-test-key".to_string()),
            state_secret: None,
            oauth: None,
            crm: CrmConfig {
                api_base: api_base.into(),
                timeout: Duration::from_secs(5),
            },
            llm: None,
            enrich_rate_limit: RateLimitConfig::default(),
        }
    }
}
