//! Card enrichment: search the CRM for a card's title, link every match,
//! and write aggregated deal properties into the card's custom fields.

use crate::aggregate::aggregate;
use crate::links::{CardLink, NewCardLink};
use crate::mapping::MappingConfig;
use crate::models::{
    Card, CardId, CustomFieldId, CustomFieldValue, Integration, IntegrationId, IntegrationPatch,
    RowId,
};
use crate::search::SearchEngine;
use crate::store::SyncStore;
use crate::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Type given to custom fields created on first use. Every aggregation yields a number.
pub const AGGREGATED_FIELD_TYPE: &str = "number";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardEnrichment {
    pub card_id: CardId,
    pub match_count: usize,
    pub links: Vec<CardLink>,
    pub values: BTreeMap<CustomFieldId, String>,
}

/// Result of one card within a bulk run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Enriched(CardEnrichment),
    Failed { card_id: CardId, error: String },
}

impl ItemOutcome {
    pub fn card_id(&self) -> CardId {
        match self {
            Self::Enriched(e) => e.card_id,
            Self::Failed { card_id, .. } => *card_id,
        }
    }

    pub fn is_enriched(&self) -> bool {
        matches!(self, Self::Enriched(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkEnrichmentReport {
    pub integration_id: IntegrationId,
    pub row_id: RowId,
    pub total: usize,
    pub enriched: usize,
    pub failed: usize,
    pub cancelled: bool,
    /// One entry per card, in row order.
    pub results: Vec<ItemOutcome>,
}

pub struct EnrichmentEngine {
    store: Arc<dyn SyncStore>,
    search: SearchEngine,
}

impl EnrichmentEngine {
    pub fn new(store: Arc<dyn SyncStore>, search: SearchEngine) -> Self {
        Self { store, search }
    }

    async fn load_integration(&self, id: IntegrationId) -> Result<Integration> {
        self.store
            .get_integration(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("integration '{id}' not found")))
    }

    /// Mapping with every custom field resolved to an id, creating missing fields.
    ///
    /// Newly resolved ids are written back so later runs skip the lookup.
    #[tracing::instrument(level = "debug", skip_all, fields(integration_id = %integration.id))]
    async fn prepare_mapping(&self, integration: &Integration) -> Result<MappingConfig> {
        let mut mapping = integration
            .field_mapping
            .clone()
            .filter(|m| {
                !m.field_mappings.is_empty()
                    || m.matching_config
                        .search_properties
                        .iter()
                        .any(|p| !p.trim().is_empty())
            })
            .ok_or_else(|| Error::Config("field mappings not configured".to_string()))?;

        let mut changed = false;
        for fm in mapping.field_mappings.iter_mut() {
            if let Some(id) = fm.custom_field_id {
                if self.store.get_custom_field(id).await?.is_some() {
                    continue;
                }
                tracing::warn!(custom_field_id = %id, "mapped custom field is gone; resolving by name");
            }
            let field = self
                .store
                .ensure_custom_field(
                    integration.workspace_id,
                    &fm.custom_field_name,
                    AGGREGATED_FIELD_TYPE,
                )
                .await?;
            fm.custom_field_id = Some(field.id);
            changed = true;
        }

        if changed {
            let patch = IntegrationPatch {
                field_mapping: Some(mapping.clone()),
                ..Default::default()
            };
            self.store.update_integration(integration.id, &patch).await?;
        }
        Ok(mapping)
    }

    async fn enrich_loaded(
        &self,
        integration: &Integration,
        mapping: &MappingConfig,
        card: &Card,
    ) -> Result<CardEnrichment> {
        let records = self
            .search
            .search(
                integration,
                std::slice::from_ref(&card.title),
                &mapping.search_properties(),
                &mapping.required_properties(),
            )
            .await?;

        let mut links = Vec::with_capacity(records.len());
        for record in &records {
            let link = NewCardLink::auto_deal(
                card.id,
                integration.id,
                record.id.clone(),
                record.display_name(),
            );
            links.push(self.store.upsert_card_link(&link).await?);
        }

        let values = aggregate(&records, &mapping.field_mappings);
        let now = Utc::now();
        for (field_id, value) in &values {
            self.store
                .upsert_custom_field_value(&CustomFieldValue {
                    card_id: card.id,
                    custom_field_id: *field_id,
                    value: value.clone(),
                    updated_at: now,
                })
                .await?;
        }

        tracing::debug!(card_id = %card.id, matches = records.len(), "card enriched");
        Ok(CardEnrichment {
            card_id: card.id,
            match_count: records.len(),
            links,
            values,
        })
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn enrich_card(
        &self,
        integration_id: IntegrationId,
        card_id: CardId,
    ) -> Result<CardEnrichment> {
        let integration = self.load_integration(integration_id).await?;
        let card = self
            .store
            .get_card(card_id)
            .await?
            .filter(|c| c.workspace_id == integration.workspace_id)
            .ok_or_else(|| Error::NotFound(format!("card '{card_id}' not found")))?;
        let mapping = self.prepare_mapping(&integration).await?;
        self.enrich_loaded(&integration, &mapping, &card).await
    }

    /// Enrich every card in a row, one at a time, in row order.
    ///
    /// A failing card is recorded and the run continues. Cards left when
    /// `cancel` fires are recorded as cancelled. `last_synced` is stamped
    /// once at the end either way.
    #[tracing::instrument(level = "info", skip(self, cancel))]
    pub async fn enrich_row(
        &self,
        integration_id: IntegrationId,
        row_id: RowId,
        cancel: &CancellationToken,
    ) -> Result<BulkEnrichmentReport> {
        let integration = self.load_integration(integration_id).await?;
        let mapping = self.prepare_mapping(&integration).await?;
        let cards = self
            .store
            .list_cards_in_row(integration.workspace_id, row_id)
            .await?;

        let mut results = Vec::with_capacity(cards.len());
        for card in &cards {
            if cancel.is_cancelled() {
                results.push(ItemOutcome::Failed {
                    card_id: card.id,
                    error: "cancelled".to_string(),
                });
                continue;
            }
            match self.enrich_loaded(&integration, &mapping, card).await {
                Ok(done) => results.push(ItemOutcome::Enriched(done)),
                Err(e) => {
                    tracing::warn!(card_id = %card.id, error = %e, "card enrichment failed");
                    results.push(ItemOutcome::Failed {
                        card_id: card.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        let patch = IntegrationPatch {
            last_synced: Some(Utc::now()),
            ..Default::default()
        };
        self.store.update_integration(integration.id, &patch).await?;

        let enriched = results.iter().filter(|r| r.is_enriched()).count();
        let report = BulkEnrichmentReport {
            integration_id,
            row_id,
            total: cards.len(),
            enriched,
            failed: results.len() - enriched,
            cancelled: cancel.is_cancelled(),
            results,
        };
        tracing::info!(
            total = report.total,
            enriched = report.enriched,
            failed = report.failed,
            cancelled = report.cancelled,
            "row enrichment finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::MatchedBy;
    use crate::mapping::{Aggregation, FieldMapping, ObjectType};
    use crate::models::WorkspaceId;
    use crate::test_support::TestHarness;

    fn revenue_mapping() -> MappingConfig {
        MappingConfig::new(
            vec!["dealname".into()],
            vec![
                FieldMapping {
                    crm_property: "amount".into(),
                    object_type: ObjectType::Deal,
                    aggregation: Aggregation::Sum,
                    custom_field_id: None,
                    custom_field_name: "Revenue".into(),
                    rationale: "total pipeline value".into(),
                },
                FieldMapping {
                    crm_property: "dealstage".into(),
                    object_type: ObjectType::Deal,
                    aggregation: Aggregation::CountUnique,
                    custom_field_id: None,
                    custom_field_name: "Stages".into(),
                    rationale: String::new(),
                },
            ],
        )
    }

    const TWO_DEALS: &str = r#"{"results":[
        {"id":"d1","properties":{"dealname":"Acme renewal","amount":"10","dealstage":"won"}},
        {"id":"d2","properties":{"dealname":"Acme upsell","amount":"20","dealstage":"open"}}
    ]}"#;

    #[tokio::test]
    async fn enrich_card_links_matches_and_writes_values() {
        let h = TestHarness::new().await;
        let integration = h.private_app_integration("pat").await;
        h.set_mapping(integration.id, revenue_mapping()).await;
        let row = RowId::new();
        let cards = h.seed_cards(row, &["Acme"]).await;
        h.transport.push(200, TWO_DEALS);

        let out = h
            .enrichment()
            .enrich_card(integration.id, cards[0].id)
            .await
            .unwrap();
        assert_eq!(out.match_count, 2);
        assert_eq!(out.links.len(), 2);
        assert!(out.links.iter().all(|l| l.matched_by == MatchedBy::Auto));
        assert_eq!(out.links[0].external_name.as_deref(), Some("Acme renewal"));

        let mut values: Vec<String> = out.values.values().cloned().collect();
        values.sort();
        assert_eq!(values, vec!["2", "30"]);
        assert_eq!(h.store.list_custom_field_values(cards[0].id).await.unwrap().len(), 2);

        // Resolved custom field ids are persisted on the mapping.
        let stored = h.store.get_integration(integration.id).await.unwrap().unwrap();
        let mapping = stored.field_mapping.unwrap();
        assert!(mapping.field_mappings.iter().all(|m| m.custom_field_id.is_some()));
    }

    #[tokio::test]
    async fn re_enrichment_keeps_manual_links() {
        let h = TestHarness::new().await;
        let integration = h.private_app_integration("pat").await;
        h.set_mapping(integration.id, revenue_mapping()).await;
        let cards = h.seed_cards(RowId::new(), &["Acme"]).await;

        let manual = h
            .store
            .upsert_card_link(&NewCardLink {
                card_id: cards[0].id,
                integration_id: integration.id,
                external_object_type: "deal".into(),
                external_object_id: "d1".into(),
                external_name: Some("picked by hand".into()),
                matched_by: MatchedBy::Manual,
            })
            .await
            .unwrap();

        h.transport.push(200, TWO_DEALS);
        h.transport.push(200, TWO_DEALS);
        let engine = h.enrichment();
        engine.enrich_card(integration.id, cards[0].id).await.unwrap();
        engine.enrich_card(integration.id, cards[0].id).await.unwrap();

        let links = h.store.list_card_links(cards[0].id).await.unwrap();
        assert_eq!(links.len(), 2);
        let kept = links.iter().find(|l| l.id == manual.id).unwrap();
        assert_eq!(kept.matched_by, MatchedBy::Manual);
        assert_eq!(kept.external_name.as_deref(), Some("picked by hand"));
    }

    #[tokio::test]
    async fn missing_mapping_is_config_error() {
        let h = TestHarness::new().await;
        let integration = h.private_app_integration("pat").await;
        let cards = h.seed_cards(RowId::new(), &["Acme"]).await;

        let err = h
            .enrichment()
            .enrich_card(integration.id, cards[0].id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn card_from_another_workspace_is_not_found() {
        let h = TestHarness::new().await;
        let integration = h.private_app_integration("pat").await;
        h.set_mapping(integration.id, revenue_mapping()).await;
        let foreign = Card {
            id: CardId::new(),
            workspace_id: WorkspaceId::new(),
            row_id: RowId::new(),
            title: "Acme".into(),
        };
        h.store.upsert_card(&foreign).await.unwrap();

        let err = h
            .enrichment()
            .enrich_card(integration.id, foreign.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn bulk_records_every_item_and_stamps_last_synced() {
        let h = TestHarness::new().await;
        let integration = h.private_app_integration("pat").await;
        h.set_mapping(integration.id, revenue_mapping()).await;
        let row = RowId::new();
        let cards = h.seed_cards(row, &["Acme", "Broken", "Globex"]).await;

        h.transport.push(200, TWO_DEALS);
        h.transport.push(500, "internal");
        h.transport.push(
            200,
            r#"{"results":[{"id":"g1","properties":{"dealname":"Globex","amount":"5"}}]}"#,
        );

        let before = Utc::now();
        let report = h
            .enrichment()
            .enrich_row(integration.id, row, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.enriched, 2);
        assert_eq!(report.failed, 1);
        assert!(!report.cancelled);

        let order: Vec<CardId> = report.results.iter().map(|r| r.card_id()).collect();
        assert_eq!(order, cards.iter().map(|c| c.id).collect::<Vec<_>>());
        assert!(report.results[0].is_enriched());
        assert!(matches!(&report.results[1], ItemOutcome::Failed { error, .. } if error.contains("500")));
        assert!(report.results[2].is_enriched());

        let stored = h.store.get_integration(integration.id).await.unwrap().unwrap();
        assert!(stored.last_synced.unwrap() >= before);
        assert_eq!(h.store.list_card_links(cards[2].id).await.unwrap().len(), 1);
        assert!(h.store.list_card_links(cards[1].id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_run_reports_remaining_items() {
        let h = TestHarness::new().await;
        let integration = h.private_app_integration("pat").await;
        h.set_mapping(integration.id, revenue_mapping()).await;
        let row = RowId::new();
        h.seed_cards(row, &["A", "B", "C"]).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = h
            .enrichment()
            .enrich_row(integration.id, row, &cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.total, 3);
        assert_eq!(report.failed, 3);
        assert!(h.transport.requests().is_empty());
        let stored = h.store.get_integration(integration.id).await.unwrap().unwrap();
        assert!(stored.last_synced.is_some());
    }
}
