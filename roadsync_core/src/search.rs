//! Token search for CRM deals.
//!
//! Every (term, property) pair becomes one `CONTAINS_TOKEN` filter group.
//! HubSpot ORs filter groups but caps them per request, so clauses are sent
//! in batches and the results merged by record id.

use crate::crm::CrmClient;
use crate::mapping::DEFAULT_SEARCH_PROPERTY;
use crate::models::Integration;
use crate::oauth::OAuthManager;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

pub const MAX_FILTER_GROUPS: usize = 3;
pub const SEARCH_LIMIT: u32 = 100;
pub const DEFAULT_DEAL_PROPERTIES: &[&str] =
    &["dealname", "amount", "dealstage", "closedate", "pipeline"];

const DEALS_SEARCH_PATH: &str = "/crm/v3/objects/deals/search";

/// A CRM object as returned by search: an id and a bag of properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmRecord {
    pub id: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl CrmRecord {
    /// Property rendered as text. Null and missing are `None`.
    pub fn property(&self, name: &str) -> Option<String> {
        match self.properties.get(name)? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn display_name(&self) -> Option<String> {
        self.property("dealname").filter(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<CrmRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct SearchRequest {
    #[serde(rename = "filterGroups")]
    filter_groups: Vec<FilterGroup>,
    properties: Vec<String>,
    limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct FilterGroup {
    filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Filter {
    #[serde(rename = "propertyName")]
    property_name: String,
    operator: &'static str,
    value: String,
}

fn build_clauses(terms: &[String], search_properties: &[String]) -> Vec<FilterGroup> {
    let props: Vec<&str> = {
        let p: Vec<&str> = search_properties
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();
        if p.is_empty() {
            vec![DEFAULT_SEARCH_PROPERTY]
        } else {
            p
        }
    };

    let mut groups = Vec::new();
    for term in terms.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        for prop in &props {
            groups.push(FilterGroup {
                filters: vec![Filter {
                    property_name: (*prop).to_string(),
                    operator: "CONTAINS_TOKEN",
                    value: term.to_string(),
                }],
            });
        }
    }
    groups
}

fn requested_properties(extra: &[String]) -> Vec<String> {
    let mut out: Vec<String> = DEFAULT_DEAL_PROPERTIES.iter().map(|s| s.to_string()).collect();
    for p in extra {
        let p = p.trim();
        if !p.is_empty() && !out.iter().any(|o| o == p) {
            out.push(p.to_string());
        }
    }
    out
}

#[derive(Clone)]
pub struct SearchEngine {
    client: CrmClient,
    oauth: Arc<OAuthManager>,
}

impl SearchEngine {
    pub fn new(client: CrmClient, oauth: Arc<OAuthManager>) -> Self {
        Self { client, oauth }
    }

    #[tracing::instrument(level = "info", skip_all, fields(integration_id = %integration.id, terms = terms.len()))]
    pub async fn search(
        &self,
        integration: &Integration,
        terms: &[String],
        search_properties: &[String],
        extra_properties: &[String],
    ) -> Result<Vec<CrmRecord>> {
        if terms.iter().all(|t| t.trim().is_empty()) {
            return Ok(Vec::new());
        }
        let token = self.oauth.get_access_token(integration).await?;
        self.search_with_token(&token, terms, search_properties, extra_properties)
            .await
    }

    /// Search with an already-resolved access token.
    pub async fn search_with_token(
        &self,
        token: &str,
        terms: &[String],
        search_properties: &[String],
        extra_properties: &[String],
    ) -> Result<Vec<CrmRecord>> {
        let clauses = build_clauses(terms, search_properties);
        if clauses.is_empty() {
            return Ok(Vec::new());
        }
        let properties = requested_properties(extra_properties);

        let mut seen: HashSet<String> = HashSet::new();
        let mut merged = Vec::new();
        for batch in clauses.chunks(MAX_FILTER_GROUPS) {
            let body = SearchRequest {
                filter_groups: batch.to_vec(),
                properties: properties.clone(),
                limit: SEARCH_LIMIT,
            };
            let body = serde_json::to_value(&body)
                .map_err(|e| Error::backend("serialize crm search", e))?;
            let value = self.client.post(token, DEALS_SEARCH_PATH, body).await?;
            let resp: SearchResponse = serde_json::from_value(value)
                .map_err(|e| Error::backend("parse crm search response", e))?;

            for record in resp.results {
                if seen.insert(record.id.clone()) {
                    merged.push(record);
                }
            }
        }

        tracing::debug!(
            clauses = clauses.len(),
            records = merged.len(),
            "crm search complete"
        );
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::RequestBody;
    use crate::test_support::TestHarness;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn filter_group_count(body: &Option<RequestBody>) -> usize {
        match body {
            Some(RequestBody::Json(v)) => v["filterGroups"].as_array().map_or(0, |a| a.len()),
            _ => 0,
        }
    }

    #[tokio::test]
    async fn batches_clauses_and_dedupes_by_id() {
        let h = TestHarness::new().await;
        h.transport.push(
            200,
            r#"{"results":[
                {"id":"1","properties":{"dealname":"Acme renewal","amount":"10"}},
                {"id":"2","properties":{"dealname":"Acme upsell","amount":"20"}}
            ]}"#,
        );
        h.transport.push(
            200,
            r#"{"results":[
                {"id":"2","properties":{"dealname":"changed","amount":"99"}},
                {"id":"3","properties":{"dealname":"Globex","amount":null}}
            ]}"#,
        );

        let records = h
            .search()
            .search_with_token(
                "tok",
                &strings(&["acme", "globex"]),
                &strings(&["dealname", "description"]),
                &strings(&["amount", "hs_arr"]),
            )
            .await
            .unwrap();

        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(records[1].property("dealname").as_deref(), Some("Acme upsell"));
        assert_eq!(records[2].property("amount"), None);

        let sent = h.transport.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(filter_group_count(&sent[0].body), 3);
        assert_eq!(filter_group_count(&sent[1].body), 1);
        assert!(sent[0].url.ends_with("/crm/v3/objects/deals/search"));

        let Some(RequestBody::Json(first)) = &sent[0].body else {
            panic!("expected json body");
        };
        assert_eq!(first["limit"], 100);
        assert_eq!(first["filterGroups"][0]["filters"][0]["operator"], "CONTAINS_TOKEN");
        let props: Vec<&str> = first["properties"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(
            props,
            vec!["dealname", "amount", "dealstage", "closedate", "pipeline", "hs_arr"]
        );
    }

    #[tokio::test]
    async fn blank_terms_make_no_requests() {
        let h = TestHarness::new().await;
        let records = h
            .search()
            .search_with_token("tok", &strings(&["", "  "]), &strings(&["dealname"]), &[])
            .await
            .unwrap();
        assert!(records.is_empty());
        assert!(h.transport.requests().is_empty());
    }

    #[test]
    fn empty_search_properties_fall_back_to_dealname() {
        let groups = build_clauses(&strings(&["acme"]), &strings(&[" "]));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].filters[0].property_name, "dealname");
    }

    #[test]
    fn clause_count_is_terms_times_properties() {
        let groups = build_clauses(&strings(&["a", "b", "c"]), &strings(&["x", "y"]));
        assert_eq!(groups.len(), 6);
        assert_eq!(groups.chunks(MAX_FILTER_GROUPS).count(), 2);
    }
}
