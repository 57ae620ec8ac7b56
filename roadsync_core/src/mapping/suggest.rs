//! AI-assisted mapping suggestions.
//!
//! The model is an opaque collaborator: a prompt describing the discovered
//! schema goes in, a JSON document comes back. The document is parsed
//! strictly; anything malformed rejects the whole suggestion.

use crate::config::LlmConfig;
use crate::crm::transport::{HttpMethod, HttpRequest, HttpTransport, RequestBody};
use crate::mapping::{
    Aggregation, FieldMapping, MAPPING_VERSION, MappingConfig, MatchingConfig, MatchingStrategy,
    ObjectType,
};
use crate::schema::CrmSchema;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Write as _;
use std::sync::Arc;

const MAX_OPTIONS_IN_PROMPT: usize = 5;

#[async_trait]
pub trait MappingSuggester: Send + Sync {
    /// Return the raw model output for `prompt`.
    async fn suggest(&self, prompt: &str) -> Result<String>;
}

pub fn build_suggestion_prompt(schema: &CrmSchema) -> String {
    let mut out = String::new();
    out.push_str(
        "You configure how roadmap cards are matched to HubSpot deals and which deal \
         properties are aggregated into card custom fields.\n\nDeal properties:\n",
    );
    for prop in schema.deal_properties.values() {
        let _ = write!(out, "- {} ({}, {})", prop.name, prop.label, prop.property_type);
        if !prop.options.is_empty() {
            let opts: Vec<&str> = prop
                .options
                .iter()
                .take(MAX_OPTIONS_IN_PROMPT)
                .map(|o| o.label.as_str())
                .collect();
            let _ = write!(out, " options: {}", opts.join(", "));
        }
        out.push('\n');
    }
    if !schema.pipelines.is_empty() {
        out.push_str("\nDeal pipelines:\n");
        for p in &schema.pipelines {
            let stages: Vec<&str> = p.stages.iter().map(|s| s.label.as_str()).collect();
            let _ = writeln!(out, "- {}: {}", p.label, stages.join(" -> "));
        }
    }
    out.push_str(
        "\nRespond with only a JSON object of this shape:\n\
         {\"matching_strategy\": \"token_search\",\n \
          \"matching_config\": {\"search_properties\": [\"<deal property>\", ...], \"min_confidence\": <0..1>},\n \
          \"field_mappings\": [{\"crm_property\": \"<deal property>\", \"object_type\": \"deal\",\n   \
          \"aggregation\": \"sum|count|avg|max|min|count_unique\", \"custom_field_name\": \"<label>\", \"rationale\": \"<why>\"}]}\n",
    );
    out
}

#[derive(Debug, Deserialize)]
struct SuggestionDoc {
    matching_strategy: String,
    matching_config: SuggestedMatching,
    field_mappings: Vec<SuggestedMapping>,
}

#[derive(Debug, Deserialize)]
struct SuggestedMatching {
    search_properties: Vec<String>,
    #[serde(default)]
    min_confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SuggestedMapping {
    crm_property: String,
    #[serde(default)]
    object_type: ObjectType,
    aggregation: String,
    custom_field_name: String,
    #[serde(default)]
    rationale: String,
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Only deal properties are aggregated, so only they are accepted.
fn known_deal_property(schema: &CrmSchema, name: &str) -> bool {
    schema.deal_properties.is_empty() || schema.deal_properties.contains_key(name)
}

/// Parse model output into a mapping config, validating it against `schema`.
pub fn parse_suggestion(text: &str, schema: &CrmSchema) -> Result<MappingConfig> {
    let malformed = |msg: String| Error::MalformedSuggestion(msg);

    let doc: SuggestionDoc = serde_json::from_str(strip_code_fence(text))
        .map_err(|e| malformed(format!("not a valid suggestion document: {e}")))?;

    let matching_strategy: MatchingStrategy = doc
        .matching_strategy
        .parse()
        .map_err(|_| malformed(format!("unknown matching_strategy '{}'", doc.matching_strategy)))?;

    if doc.matching_config.search_properties.is_empty() {
        return Err(malformed("search_properties is empty".to_string()));
    }
    for prop in &doc.matching_config.search_properties {
        if !known_deal_property(schema, prop) {
            return Err(malformed(format!("unknown search property '{prop}'")));
        }
    }

    let mut field_mappings = Vec::with_capacity(doc.field_mappings.len());
    for (idx, m) in doc.field_mappings.into_iter().enumerate() {
        if m.crm_property.trim().is_empty() || m.custom_field_name.trim().is_empty() {
            return Err(malformed(format!(
                "field_mappings[{idx}] is missing crm_property or custom_field_name"
            )));
        }
        if m.object_type != ObjectType::Deal {
            return Err(malformed(format!(
                "field_mappings[{idx}] targets {} properties; only deals are supported",
                m.object_type.as_str()
            )));
        }
        if !known_deal_property(schema, &m.crm_property) {
            return Err(malformed(format!(
                "field_mappings[{idx}] references unknown property '{}'",
                m.crm_property
            )));
        }
        let aggregation = Aggregation::from(m.aggregation);
        if let Aggregation::Other(name) = &aggregation {
            return Err(malformed(format!(
                "field_mappings[{idx}] uses unsupported aggregation '{name}'"
            )));
        }
        field_mappings.push(FieldMapping {
            crm_property: m.crm_property,
            object_type: m.object_type,
            aggregation,
            custom_field_id: None,
            custom_field_name: m.custom_field_name,
            rationale: m.rationale,
        });
    }

    let cfg = MappingConfig {
        version: MAPPING_VERSION,
        matching_strategy,
        matching_config: MatchingConfig {
            search_properties: doc.matching_config.search_properties,
            min_confidence: doc
                .matching_config
                .min_confidence
                .unwrap_or(crate::mapping::DEFAULT_MIN_CONFIDENCE),
        },
        field_mappings,
    };
    cfg.validate()
        .map_err(|e| malformed(format!("suggestion failed validation: {e}")))?;
    Ok(cfg)
}

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAiCompatibleSuggester {
    transport: Arc<dyn HttpTransport>,
    config: LlmConfig,
}

impl OpenAiCompatibleSuggester {
    pub fn new(transport: Arc<dyn HttpTransport>, config: LlmConfig) -> Self {
        Self { transport, config }
    }
}

#[async_trait]
impl MappingSuggester for OpenAiCompatibleSuggester {
    #[tracing::instrument(level = "info", skip_all, fields(model = %self.config.model))]
    async fn suggest(&self, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/chat/completions",
            self.config.api_base.trim_end_matches('/')
        );
        let payload = serde_json::json!({
            "model": self.config.model,
            "temperature": 0,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": "You are a CRM data-mapping assistant. Reply with JSON only."},
                {"role": "user", "content": prompt},
            ],
        });
        let resp = self
            .transport
            .send(HttpRequest {
                method: HttpMethod::Post,
                url,
                bearer: Some(self.config.api_key.clone()),
                body: Some(RequestBody::Json(payload)),
            })
            .await?;
        if !resp.is_success() {
            return Err(Error::BackendMessage(format!(
                "llm returned {}: {}",
                resp.status, resp.body
            )));
        }
        let value: serde_json::Value = serde_json::from_str(&resp.body)
            .map_err(|e| Error::backend("parse llm response", e))?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::MalformedSuggestion("llm response has no content".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CrmProperty, Pipeline, PipelineStage, PropertyOption};
    use crate::test_support::ScriptedTransport;

    fn schema() -> CrmSchema {
        let prop = |name: &str, ty: &str| CrmProperty {
            name: name.into(),
            label: name.to_uppercase(),
            property_type: ty.into(),
            field_type: ty.into(),
            description: String::new(),
            options: vec![],
        };
        let mut s = CrmSchema::default();
        s.deal_properties.insert("dealname".into(), prop("dealname", "string"));
        s.deal_properties.insert("amount".into(), prop("amount", "number"));
        let mut stage = prop("dealstage", "enumeration");
        stage.options = vec![PropertyOption {
            label: "Closed won".into(),
            value: "closedwon".into(),
        }];
        s.deal_properties.insert("dealstage".into(), stage);
        s.pipelines.push(Pipeline {
            id: "default".into(),
            label: "Sales".into(),
            stages: vec![PipelineStage {
                id: "a".into(),
                label: "New".into(),
                display_order: 0,
            }],
        });
        s
    }

    const GOOD: &str = r#"{
        "matching_strategy": "token_search",
        "matching_config": {"search_properties": ["dealname"], "min_confidence": 0.8},
        "field_mappings": [
            {"crm_property": "amount", "aggregation": "sum", "custom_field_name": "Revenue", "rationale": "total value"},
            {"crm_property": "dealstage", "aggregation": "count_unique", "custom_field_name": "Stages"}
        ]
    }"#;

    #[test]
    fn prompt_mentions_properties_options_and_pipelines() {
        let prompt = build_suggestion_prompt(&schema());
        assert!(prompt.contains("- amount (AMOUNT, number)"));
        assert!(prompt.contains("options: Closed won"));
        assert!(prompt.contains("- Sales: New"));
        assert!(prompt.contains("\"field_mappings\""));
    }

    #[test]
    fn parses_fenced_and_plain_documents() {
        let cfg = parse_suggestion(GOOD, &schema()).unwrap();
        assert_eq!(cfg.field_mappings.len(), 2);
        assert_eq!(cfg.field_mappings[1].aggregation, Aggregation::CountUnique);
        assert_eq!(cfg.matching_config.min_confidence, 0.8);

        let fenced = format!("```json\n{GOOD}\n```");
        assert_eq!(parse_suggestion(&fenced, &schema()).unwrap(), cfg);
    }

    #[test]
    fn malformed_output_is_rejected_whole() {
        let s = schema();
        for bad in [
            "sure! here you go",
            r#"{"matching_strategy":"token_search","field_mappings":[]}"#,
            r#"{"matching_strategy":"vibes","matching_config":{"search_properties":["dealname"]},"field_mappings":[]}"#,
            r#"{"matching_strategy":"token_search","matching_config":{"search_properties":[]},"field_mappings":[]}"#,
            r#"{"matching_strategy":"token_search","matching_config":{"search_properties":["dealname"]},
               "field_mappings":[{"crm_property":"nope","aggregation":"sum","custom_field_name":"X"}]}"#,
            r#"{"matching_strategy":"token_search","matching_config":{"search_properties":["dealname"]},
               "field_mappings":[{"crm_property":"amount","aggregation":"median","custom_field_name":"X"}]}"#,
            r#"{"matching_strategy":"token_search","matching_config":{"search_properties":["dealname"]},
               "field_mappings":[{"crm_property":"amount","object_type":"company","aggregation":"sum","custom_field_name":"X"}]}"#,
        ] {
            let err = parse_suggestion(bad, &s).unwrap_err();
            assert!(matches!(err, Error::MalformedSuggestion(_)), "accepted: {bad}");
        }
    }

    #[tokio::test]
    async fn openai_compatible_suggester_reads_message_content() {
        let transport = ScriptedTransport::new();
        transport.route(
            "/chat/completions",
            200,
            r#"{"choices":[{"message":{"role":"assistant","content":"{\"ok\":1}"}}]}"#,
        );
        let suggester = OpenAiCompatibleSuggester::new(
            transport.clone(),
            LlmConfig {
                api_base: "https://llm.test/v1/".into(),
                api_key: "k".into(),
                model: "m".into(),
            },
        );
        assert_eq!(suggester.suggest("prompt").await.unwrap(), r#"{"ok":1}"#);
        let sent = &transport.requests()[0];
        assert_eq!(sent.url, "https://llm.test/v1/chat/completions");
    }
}
