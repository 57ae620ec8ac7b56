use crate::mapping::MappingConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let id = Uuid::parse_str(s.trim())
                    .map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
                Ok(Self(id))
            }
        }
    };
}

uuid_id!(
    /// Tenant scope. Opaque to this crate; supplied by the host application.
    WorkspaceId
);
uuid_id!(
    /// Host application user. Only recorded, never authenticated here.
    UserId
);
uuid_id!(IntegrationId);
uuid_id!(
    /// A local work item on the roadmap.
    CardId
);
uuid_id!(
    /// A collection of cards (a roadmap row); the unit of bulk enrichment.
    RowId
);
uuid_id!(CustomFieldId);
uuid_id!(LinkId);

/// External system kind. One integration per (workspace, type).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationType {
    Hubspot,
}

impl IntegrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hubspot => "hubspot",
        }
    }
}

impl FromStr for IntegrationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hubspot" => Ok(Self::Hubspot),
            other => Err(format!("unknown integration type '{other}'")),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Active,
    /// Refresh failed; the operator must reconnect.
    Error,
}

impl IntegrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Error => "error",
        }
    }
}

impl FromStr for IntegrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown integration status '{other}'")),
        }
    }
}

/// How the stored credential was obtained.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Authorization-code flow; expiring access token plus refresh token.
    Oauth,
    /// Static, non-expiring private-app token.
    PrivateApp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub auth_mode: AuthMode,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A connection between a workspace and the external CRM.
///
/// Token fields hold vault blobs, never plaintext.
#[derive(Debug, Clone, PartialEq)]
pub struct Integration {
    pub id: IntegrationId,
    pub workspace_id: WorkspaceId,
    pub integration_type: IntegrationType,
    pub status: IntegrationStatus,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub auth_config: AuthConfig,
    pub field_mapping: Option<MappingConfig>,
    pub last_synced: Option<DateTime<Utc>>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Integration {
    pub fn is_private_app(&self) -> bool {
        self.auth_config.auth_mode == AuthMode::PrivateApp
    }

    pub fn summary(&self) -> IntegrationSummary {
        IntegrationSummary {
            id: self.id,
            workspace_id: self.workspace_id,
            integration_type: self.integration_type,
            status: self.status,
            auth_mode: self.auth_config.auth_mode,
            token_expires_at: self.token_expires_at,
            has_mappings: self.field_mapping.is_some(),
            last_synced: self.last_synced,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Integration as exposed to API callers: no token material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationSummary {
    pub id: IntegrationId,
    pub workspace_id: WorkspaceId,
    pub integration_type: IntegrationType,
    pub status: IntegrationStatus,
    pub auth_mode: AuthMode,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub has_mappings: bool,
    pub last_synced: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for the (workspace, type) upsert performed on connect.
#[derive(Debug, Clone)]
pub struct NewIntegration {
    pub workspace_id: WorkspaceId,
    pub integration_type: IntegrationType,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub auth_config: AuthConfig,
    pub created_by: UserId,
}

/// Typed partial update for an integration row.
///
/// Only fields set to `Some` are written. Nullable columns use a nested
/// `Option` so "leave alone" and "set to NULL" stay distinct.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntegrationPatch {
    pub status: Option<IntegrationStatus>,
    pub access_token: Option<String>,
    pub refresh_token: Option<Option<String>>,
    pub token_expires_at: Option<Option<DateTime<Utc>>>,
    pub field_mapping: Option<MappingConfig>,
    pub last_synced: Option<DateTime<Utc>>,
}

/// The only columns a patch may touch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PatchColumn {
    Status,
    AccessToken,
    RefreshToken,
    TokenExpiresAt,
    FieldMapping,
    LastSynced,
}

impl PatchColumn {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
            Self::TokenExpiresAt => "token_expires_at",
            Self::FieldMapping => "field_mapping",
            Self::LastSynced => "last_synced",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatchValue {
    Text(String),
    NullableText(Option<String>),
}

impl IntegrationPatch {
    pub fn is_empty(&self) -> bool {
        self.assignments().map(|a| a.is_empty()).unwrap_or(false)
    }

    /// Lower the patch to (column, value) pairs in a fixed column order.
    pub fn assignments(&self) -> crate::Result<Vec<(PatchColumn, PatchValue)>> {
        let mut out = Vec::new();
        if let Some(status) = self.status {
            out.push((PatchColumn::Status, PatchValue::Text(status.as_str().into())));
        }
        if let Some(token) = &self.access_token {
            out.push((PatchColumn::AccessToken, PatchValue::Text(token.clone())));
        }
        if let Some(token) = &self.refresh_token {
            out.push((PatchColumn::RefreshToken, PatchValue::NullableText(token.clone())));
        }
        if let Some(expires) = &self.token_expires_at {
            out.push((
                PatchColumn::TokenExpiresAt,
                PatchValue::NullableText(expires.map(|dt| dt.to_rfc3339())),
            ));
        }
        if let Some(mapping) = &self.field_mapping {
            out.push((PatchColumn::FieldMapping, PatchValue::Text(mapping.to_json()?)));
        }
        if let Some(at) = self.last_synced {
            out.push((PatchColumn::LastSynced, PatchValue::Text(at.to_rfc3339())));
        }
        Ok(out)
    }
}

/// Roadmap card as seen by the enrichment engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub workspace_id: WorkspaceId,
    pub row_id: RowId,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomField {
    pub id: CustomFieldId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub field_type: String,
}

/// Aggregation sink: one text value per (card, custom field).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFieldValue {
    pub card_id: CardId,
    pub custom_field_id: CustomFieldId,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}
