//! CRM schema discovery: property definitions and deal pipelines.
//!
//! Discovery is best-effort per object type. A failed fetch contributes an
//! empty section instead of failing the whole run.

use crate::crm::CrmClient;
use crate::models::{Integration, IntegrationId};
use crate::oauth::OAuthManager;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyOption {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmProperty {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub property_type: String,
    pub field_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub options: Vec<PropertyOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub id: String,
    pub label: String,
    pub display_order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub stages: Vec<PipelineStage>,
}

/// Snapshot of the CRM schema, stored as one JSON document per integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmSchema {
    #[serde(default = "schema_version")]
    pub version: u32,
    #[serde(default)]
    pub deal_properties: BTreeMap<String, CrmProperty>,
    #[serde(default)]
    pub company_properties: BTreeMap<String, CrmProperty>,
    #[serde(default)]
    pub contact_properties: BTreeMap<String, CrmProperty>,
    #[serde(default)]
    pub pipelines: Vec<Pipeline>,
}

fn schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Default for CrmSchema {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            deal_properties: BTreeMap::new(),
            company_properties: BTreeMap::new(),
            contact_properties: BTreeMap::new(),
            pipelines: Vec::new(),
        }
    }
}

/// Persisted discovery result. At most one per integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaCache {
    pub integration_id: IntegrationId,
    pub schema: CrmSchema,
    pub discovered_at: DateTime<Utc>,
}

// Wire shapes (HubSpot CRM v3).

#[derive(Debug, Deserialize)]
struct ResultsEnvelope<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireProperty {
    name: String,
    #[serde(default)]
    label: String,
    #[serde(default, rename = "type")]
    property_type: String,
    #[serde(default)]
    field_type: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    options: Vec<WireOption>,
}

#[derive(Debug, Deserialize)]
struct WireOption {
    #[serde(default)]
    label: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePipeline {
    id: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    stages: Vec<WireStage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireStage {
    id: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    display_order: i64,
}

fn normalize_properties(value: serde_json::Value) -> Result<BTreeMap<String, CrmProperty>> {
    let env: ResultsEnvelope<WireProperty> = serde_json::from_value(value)
        .map_err(|e| crate::Error::backend("parse crm properties", e))?;
    Ok(env
        .results
        .into_iter()
        .map(|p| {
            let prop = CrmProperty {
                label: if p.label.is_empty() {
                    p.name.clone()
                } else {
                    p.label
                },
                name: p.name.clone(),
                property_type: p.property_type,
                field_type: p.field_type,
                description: p.description.unwrap_or_default(),
                options: p
                    .options
                    .into_iter()
                    .map(|o| PropertyOption {
                        label: o.label,
                        value: o.value,
                    })
                    .collect(),
            };
            (p.name, prop)
        })
        .collect())
}

fn normalize_pipelines(value: serde_json::Value) -> Result<Vec<Pipeline>> {
    let env: ResultsEnvelope<WirePipeline> = serde_json::from_value(value)
        .map_err(|e| crate::Error::backend("parse crm pipelines", e))?;
    Ok(env
        .results
        .into_iter()
        .map(|p| {
            let mut stages: Vec<PipelineStage> = p
                .stages
                .into_iter()
                .map(|s| PipelineStage {
                    id: s.id,
                    label: s.label,
                    display_order: s.display_order,
                })
                .collect();
            stages.sort_by_key(|s| s.display_order);
            Pipeline {
                id: p.id,
                label: p.label,
                stages,
            }
        })
        .collect())
}

fn or_empty<T: Default>(section: &str, res: Result<T>) -> T {
    match res {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(section, error = %e, "schema discovery section failed; using empty");
            T::default()
        }
    }
}

#[derive(Clone)]
pub struct SchemaDiscovery {
    client: CrmClient,
    oauth: Arc<OAuthManager>,
}

impl SchemaDiscovery {
    pub fn new(client: CrmClient, oauth: Arc<OAuthManager>) -> Self {
        Self { client, oauth }
    }

    /// Discover the schema for an integration. The caller persists it.
    #[tracing::instrument(level = "info", skip(self, integration), fields(integration_id = %integration.id))]
    pub async fn discover(&self, integration: &Integration) -> Result<CrmSchema> {
        let token = self.oauth.get_access_token(integration).await?;
        Ok(self.fetch_schema(&token).await)
    }

    /// Fetch all schema sections concurrently with an already-resolved token.
    pub async fn fetch_schema(&self, token: &str) -> CrmSchema {
        let (deals, companies, contacts, pipelines) = tokio::join!(
            self.fetch_properties(token, "deals"),
            self.fetch_properties(token, "companies"),
            self.fetch_properties(token, "contacts"),
            self.fetch_pipelines(token),
        );

        let schema = CrmSchema {
            version: SCHEMA_VERSION,
            deal_properties: or_empty("deal_properties", deals),
            company_properties: or_empty("company_properties", companies),
            contact_properties: or_empty("contact_properties", contacts),
            pipelines: or_empty("pipelines", pipelines),
        };
        tracing::info!(
            deal_properties = schema.deal_properties.len(),
            company_properties = schema.company_properties.len(),
            contact_properties = schema.contact_properties.len(),
            pipelines = schema.pipelines.len(),
            "schema discovered"
        );
        schema
    }

    async fn fetch_properties(
        &self,
        token: &str,
        object: &str,
    ) -> Result<BTreeMap<String, CrmProperty>> {
        let value = self
            .client
            .get(token, &format!("/crm/v3/properties/{object}"))
            .await?;
        normalize_properties(value)
    }

    async fn fetch_pipelines(&self, token: &str) -> Result<Vec<Pipeline>> {
        let value = self.client.get(token, "/crm/v3/pipelines/deals").await?;
        normalize_pipelines(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestHarness;

    const DEAL_PROPS: &str = r#"{"results":[
        {"name":"amount","label":"Amount","type":"number","fieldType":"number","description":"Deal value"},
        {"name":"dealstage","label":"Deal Stage","type":"enumeration","fieldType":"select",
         "options":[{"label":"Won","value":"closedwon","hidden":false}]}
    ]}"#;

    const PIPELINES: &str = r#"{"results":[
        {"id":"default","label":"Sales","stages":[
            {"id":"b","label":"Won","displayOrder":2},
            {"id":"a","label":"New","displayOrder":0}
        ]}
    ]}"#;

    #[tokio::test]
    async fn normalizes_properties_and_pipelines() {
        let h = TestHarness::new().await;
        h.transport.route("/properties/deals", 200, DEAL_PROPS);
        h.transport.route("/properties/companies", 200, r#"{"results":[]}"#);
        h.transport.route("/properties/contacts", 200, r#"{"results":[]}"#);
        h.transport.route("/pipelines/deals", 200, PIPELINES);

        let schema = h.discovery().fetch_schema("tok").await;
        let stage = &schema.deal_properties["dealstage"];
        assert_eq!(stage.property_type, "enumeration");
        assert_eq!(stage.field_type, "select");
        assert_eq!(stage.options[0].value, "closedwon");
        assert_eq!(schema.deal_properties["amount"].description, "Deal value");

        let stages: Vec<_> = schema.pipelines[0].stages.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(stages, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn failed_section_becomes_empty() {
        let h = TestHarness::new().await;
        h.transport.route("/properties/deals", 200, DEAL_PROPS);
        h.transport.route("/properties/companies", 403, "missing scope");
        h.transport.route("/properties/contacts", 500, "boom");
        h.transport.route("/pipelines/deals", 200, "not json");

        let schema = h.discovery().fetch_schema("tok").await;
        assert_eq!(schema.deal_properties.len(), 2);
        assert!(schema.company_properties.is_empty());
        assert!(schema.contact_properties.is_empty());
        assert!(schema.pipelines.is_empty());
    }

    #[test]
    fn schema_document_roundtrips_with_version() {
        let doc: CrmSchema = serde_json::from_str("{}").unwrap();
        assert_eq!(doc.version, SCHEMA_VERSION);
    }
}
