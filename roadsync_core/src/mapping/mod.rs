//! Mapping configuration: how cards are matched to CRM records and how the
//! matched records are reduced into custom-field values.
//!
//! Stored as a versioned JSON document on the integration row.

pub mod suggest;

use crate::models::CustomFieldId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const MAPPING_VERSION: u32 = 1;
pub const DEFAULT_SEARCH_PROPERTY: &str = "dealname";
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchingStrategy {
    /// Substring/token search of the card title across several properties.
    #[serde(alias = "multi_property_search", alias = "name_match")]
    TokenSearch,
}

impl FromStr for MatchingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_string()))
            .map_err(|_| Error::InvalidInput(format!("unknown matching strategy '{s}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    pub search_properties: Vec<String>,
    /// Advisory only; the search engine does not score matches.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

fn default_min_confidence() -> f64 {
    DEFAULT_MIN_CONFIDENCE
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            search_properties: vec![DEFAULT_SEARCH_PROPERTY.to_string()],
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    #[default]
    Deal,
    Company,
    Contact,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deal => "deal",
            Self::Company => "company",
            Self::Contact => "contact",
        }
    }
}

/// Reduction applied to a property across all matched records.
///
/// Unrecognized names are kept verbatim and reduce like `Count`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Aggregation {
    Sum,
    Count,
    Avg,
    Max,
    Min,
    CountUnique,
    Other(String),
}

impl Aggregation {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Avg => "avg",
            Self::Max => "max",
            Self::Min => "min",
            Self::CountUnique => "count_unique",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for Aggregation {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "sum" => Self::Sum,
            "count" => Self::Count,
            "avg" | "average" => Self::Avg,
            "max" => Self::Max,
            "min" => Self::Min,
            "count_unique" => Self::CountUnique,
            _ => Self::Other(value),
        }
    }
}

impl From<Aggregation> for String {
    fn from(value: Aggregation) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binds one CRM property to one local custom field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub crm_property: String,
    /// Only `Deal` passes `validate`: enrichment searches deals and nothing else.
    #[serde(default)]
    pub object_type: ObjectType,
    pub aggregation: Aggregation,
    /// Filled in once the custom field exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_field_id: Option<CustomFieldId>,
    pub custom_field_name: String,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingConfig {
    #[serde(default = "mapping_version")]
    pub version: u32,
    pub matching_strategy: MatchingStrategy,
    #[serde(default)]
    pub matching_config: MatchingConfig,
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,
}

fn mapping_version() -> u32 {
    MAPPING_VERSION
}

impl MappingConfig {
    pub fn new(search_properties: Vec<String>, field_mappings: Vec<FieldMapping>) -> Self {
        Self {
            version: MAPPING_VERSION,
            matching_strategy: MatchingStrategy::TokenSearch,
            matching_config: MatchingConfig {
                search_properties,
                min_confidence: DEFAULT_MIN_CONFIDENCE,
            },
            field_mappings,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::backend("serialize mapping config", e))
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let cfg: Self =
            serde_json::from_str(s).map_err(|e| Error::backend("parse mapping config", e))?;
        if cfg.version > MAPPING_VERSION {
            return Err(Error::InvalidInput(format!(
                "mapping config version {} is newer than supported {MAPPING_VERSION}",
                cfg.version
            )));
        }
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn validate(&self) -> Result<()> {
        if self
            .matching_config
            .search_properties
            .iter()
            .all(|p| p.trim().is_empty())
        {
            return Err(Error::InvalidInput(
                "matching_config.search_properties must name at least one property".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.matching_config.min_confidence) {
            return Err(Error::InvalidInput(
                "matching_config.min_confidence must be within [0, 1]".to_string(),
            ));
        }
        for (idx, m) in self.field_mappings.iter().enumerate() {
            if m.crm_property.trim().is_empty() {
                return Err(Error::InvalidInput(format!(
                    "field_mappings[{idx}].crm_property is empty"
                )));
            }
            if m.object_type != ObjectType::Deal {
                return Err(Error::InvalidInput(format!(
                    "field_mappings[{idx}].object_type '{}' is not supported; only deal properties are aggregated",
                    m.object_type.as_str()
                )));
            }
            if m.custom_field_name.trim().is_empty() && m.custom_field_id.is_none() {
                return Err(Error::InvalidInput(format!(
                    "field_mappings[{idx}] names no custom field"
                )));
            }
        }
        Ok(())
    }

    /// Non-blank search properties, or the default when none are set.
    pub fn search_properties(&self) -> Vec<String> {
        let props: Vec<String> = self
            .matching_config
            .search_properties
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if props.is_empty() {
            vec![DEFAULT_SEARCH_PROPERTY.to_string()]
        } else {
            props
        }
    }

    /// Properties the aggregation step needs on every matched record.
    pub fn required_properties(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for m in &self.field_mappings {
            if !out.contains(&m.crm_property) {
                out.push(m.crm_property.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregation_names_roundtrip_and_unknown_is_kept() {
        let parsed: Vec<Aggregation> =
            serde_json::from_str(r#"["sum","COUNT","average","count_unique","median"]"#).unwrap();
        assert_eq!(
            parsed,
            vec![
                Aggregation::Sum,
                Aggregation::Count,
                Aggregation::Avg,
                Aggregation::CountUnique,
                Aggregation::Other("median".to_string()),
            ]
        );
        assert_eq!(serde_json::to_string(&parsed[4]).unwrap(), r#""median""#);
    }

    #[test]
    fn mapping_document_defaults() {
        let cfg = MappingConfig::from_json(
            r#"{"matching_strategy":"token_search",
                "field_mappings":[{"crm_property":"amount","aggregation":"sum","custom_field_name":"Pipeline $"}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.version, MAPPING_VERSION);
        assert_eq!(cfg.search_properties(), vec!["dealname".to_string()]);
        assert_eq!(cfg.field_mappings[0].object_type, ObjectType::Deal);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn newer_versions_are_rejected() {
        let err = MappingConfig::from_json(r#"{"version":99,"matching_strategy":"token_search"}"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn validate_rejects_incomplete_mappings() {
        let mut cfg = MappingConfig::new(vec!["  ".into()], vec![]);
        assert!(cfg.validate().is_err());

        cfg.matching_config.search_properties = vec!["dealname".into()];
        cfg.field_mappings.push(FieldMapping {
            crm_property: "amount".into(),
            object_type: ObjectType::Deal,
            aggregation: Aggregation::Sum,
            custom_field_id: None,
            custom_field_name: "".into(),
            rationale: String::new(),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_deal_object_types() {
        let mut cfg = MappingConfig::new(
            vec!["dealname".into()],
            vec![FieldMapping {
                crm_property: "numberofemployees".into(),
                object_type: ObjectType::Company,
                aggregation: Aggregation::Sum,
                custom_field_id: None,
                custom_field_name: "Headcount".into(),
                rationale: String::new(),
            }],
        );
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("company"));

        cfg.field_mappings[0].object_type = ObjectType::Contact;
        assert!(matches!(cfg.validate(), Err(Error::InvalidInput(_))));

        cfg.field_mappings[0].object_type = ObjectType::Deal;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn required_properties_are_unique_in_order() {
        let m = |p: &str| FieldMapping {
            crm_property: p.into(),
            object_type: ObjectType::Deal,
            aggregation: Aggregation::Count,
            custom_field_id: None,
            custom_field_name: p.into(),
            rationale: String::new(),
        };
        let cfg = MappingConfig::new(vec!["dealname".into()], vec![m("amount"), m("hs_arr"), m("amount")]);
        assert_eq!(cfg.required_properties(), vec!["amount", "hs_arr"]);
    }
}
