//! Reduce matched CRM records into one text value per mapped custom field.

use crate::mapping::{Aggregation, FieldMapping};
use crate::models::CustomFieldId;
use crate::search::CrmRecord;
use std::collections::{BTreeMap, BTreeSet};

/// Aggregate every mapping that has a resolved custom field.
///
/// Mappings without `custom_field_id` are skipped; resolve them first.
pub fn aggregate(records: &[CrmRecord], mappings: &[FieldMapping]) -> BTreeMap<CustomFieldId, String> {
    let mut out = BTreeMap::new();
    for mapping in mappings {
        let Some(field_id) = mapping.custom_field_id else {
            tracing::debug!(property = %mapping.crm_property, "mapping has no custom field; skipped");
            continue;
        };
        let values: Vec<String> = records
            .iter()
            .filter_map(|r| r.property(&mapping.crm_property))
            .filter(|v| !v.trim().is_empty())
            .collect();
        out.insert(field_id, reduce(&values, &mapping.aggregation));
    }
    out
}

/// Reduce non-empty raw values with `aggregation`.
pub fn reduce(values: &[String], aggregation: &Aggregation) -> String {
    let numeric = || values.iter().filter_map(|v| parse_number(v));
    match aggregation {
        Aggregation::Sum => format_number(values.iter().map(|v| parse_number(v).unwrap_or(0.0)).sum()),
        Aggregation::Count => values.len().to_string(),
        Aggregation::Avg => {
            let nums: Vec<f64> = numeric().collect();
            if nums.is_empty() {
                return "0".to_string();
            }
            let mean = nums.iter().sum::<f64>() / nums.len() as f64;
            format_number((mean * 100.0).round() / 100.0)
        }
        Aggregation::Max => format_number(numeric().reduce(f64::max).unwrap_or(0.0)),
        Aggregation::Min => format_number(numeric().reduce(f64::min).unwrap_or(0.0)),
        Aggregation::CountUnique => values
            .iter()
            .map(String::as_str)
            .collect::<BTreeSet<&str>>()
            .len()
            .to_string(),
        Aggregation::Other(name) => {
            tracing::debug!(aggregation = %name, "unknown aggregation; counting values");
            values.len().to_string()
        }
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Whole numbers print without a fraction.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}
