use crate::models::{CardId, IntegrationId, LinkId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How a link came to exist.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    /// Created by a user; never overwritten by enrichment.
    Manual,
    Auto,
}

impl MatchedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
        }
    }
}

impl FromStr for MatchedBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown matched_by '{other}'")),
        }
    }
}

/// Association between a local card and one external CRM record.
///
/// Unique on (card, integration, object type, object id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardLink {
    pub id: LinkId,
    pub card_id: CardId,
    pub integration_id: IntegrationId,
    pub external_object_type: String,
    pub external_object_id: String,
    pub external_name: Option<String>,
    pub matched_by: MatchedBy,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCardLink {
    pub card_id: CardId,
    pub integration_id: IntegrationId,
    pub external_object_type: String,
    pub external_object_id: String,
    pub external_name: Option<String>,
    pub matched_by: MatchedBy,
}

impl NewCardLink {
    /// Link to a deal found by enrichment.
    pub fn auto_deal(
        card_id: CardId,
        integration_id: IntegrationId,
        deal_id: impl Into<String>,
        name: Option<String>,
    ) -> Self {
        Self {
            card_id,
            integration_id,
            external_object_type: "deal".to_string(),
            external_object_id: deal_id.into(),
            external_name: name,
            matched_by: MatchedBy::Auto,
        }
    }
}
