//! Signed, time-boxed OAuth `state` tokens (CSRF protection).
//!
//! Format: `base64url(json claims) "." base64url(hmac_sha256(payload))`.

use crate::models::{UserId, WorkspaceId};
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const STATE_TTL_SECS: i64 = 600;
const CLOCK_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateClaims {
    pub workspace_id: WorkspaceId,
    pub user_id: UserId,
    pub pkce_verifier: String,
    pub issued_at: i64,
}

#[derive(Clone)]
pub struct StateSigner {
    secret: Vec<u8>,
    ttl: Duration,
}

impl StateSigner {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Config("state signing secret is empty".to_string()));
        }
        Ok(Self {
            secret: secret.as_bytes().to_vec(),
            ttl: Duration::seconds(STATE_TTL_SECS),
        })
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| Error::Config(format!("invalid state secret: {e}")))
    }

    pub fn sign(
        &self,
        workspace_id: WorkspaceId,
        user_id: UserId,
        pkce_verifier: &str,
    ) -> Result<String> {
        self.sign_at(workspace_id, user_id, pkce_verifier, Utc::now())
    }

    pub fn sign_at(
        &self,
        workspace_id: WorkspaceId,
        user_id: UserId,
        pkce_verifier: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let claims = StateClaims {
            workspace_id,
            user_id,
            pkce_verifier: pkce_verifier.to_string(),
            issued_at: now.timestamp(),
        };
        let json =
            serde_json::to_vec(&claims).map_err(|e| Error::backend("serialize state", e))?;
        let payload = URL_SAFE_NO_PAD.encode(json);

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{payload}.{sig}"))
    }

    pub fn verify(&self, token: &str) -> Result<StateClaims> {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<StateClaims> {
        let invalid = || Error::Unauthorized("invalid oauth state".to_string());

        let (payload, sig) = token.trim().split_once('.').ok_or_else(invalid)?;
        let sig = URL_SAFE_NO_PAD.decode(sig).map_err(|_| invalid())?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&sig).map_err(|_| invalid())?;

        let json = URL_SAFE_NO_PAD.decode(payload).map_err(|_| invalid())?;
        let claims: StateClaims = serde_json::from_slice(&json).map_err(|_| invalid())?;

        let age = now.timestamp() - claims.issued_at;
        if age > self.ttl.num_seconds() || age < -CLOCK_SKEW_SECS {
            return Err(Error::Unauthorized("oauth state expired".to_string()));
        }
        Ok(claims)
    }
}
