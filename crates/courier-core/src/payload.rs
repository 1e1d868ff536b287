//! Payload builder: flattens a scraped product and its variants into the
//! JSON array the downstream automation sink consumes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attribute key holding the variant colour.
const COLOR_ATTRIBUTE: &str = "color";

/// Timestamp format shown to the sink's human consumers.
const SCRAPED_AT_FORMAT: &str = "%Y-%m-%d @ %H:%M";

/// Snapshot of a scraped product, the builder's only input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceProduct {
    pub id: u64,
    pub name: String,
    pub permalink: String,
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub variants: Vec<SourceVariant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceVariant {
    pub id: u64,
    pub sku: String,
    pub price: f64,
    pub stock_status: String,
    /// Attribute slug -> value, e.g. `"color" -> "black"`.
    pub attributes: BTreeMap<String, String>,
}

impl SourceVariant {
    fn attribute(&self, slug: &str) -> &str {
        self.attributes.get(slug).map(String::as_str).unwrap_or("")
    }
}

/// Operator-tunable shaping rules for the outgoing records.
#[derive(Debug, Clone)]
pub struct BuildRules {
    /// Attribute slugs probed in order for the `model` field; the first
    /// non-empty value wins.
    pub model_attributes: Vec<String>,
    /// Link label forwarded verbatim as `purchase_link_text`.
    pub link_label: String,
}

impl BuildRules {
    /// Parse a comma-separated slug list as operators type it: entries are
    /// trimmed and empty ones dropped, so `"model, ,variant-model"` works.
    pub fn parse(model_attributes: &str, link_label: &str) -> Self {
        Self {
            model_attributes: model_attributes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            link_label: link_label.to_string(),
        }
    }
}

impl Default for BuildRules {
    fn default() -> Self {
        Self {
            model_attributes: Vec::new(),
            link_label: "Buy Now".to_string(),
        }
    }
}

/// One element of the outgoing JSON array: a single variant, denormalized
/// with its parent's identity so the sink needs no joins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariationRecord {
    pub product_name: String,
    pub parent_product_id: u64,
    pub variation_id: u64,
    pub sku: String,
    pub color: String,
    pub model: String,
    pub price: f64,
    pub stock_status: String,
    pub purchase_link_url: String,
    pub purchase_link_text: String,
    pub last_scraped_at: Option<String>,
}

/// Builder port: turn a source snapshot into payload bytes, or decline.
///
/// `None` means "nothing worth sending" (no variants, say) and must not be
/// treated as an error; the caller simply skips the enqueue.
pub trait PayloadBuilder: Send + Sync {
    fn build(&self, source: &SourceProduct, rules: &BuildRules) -> Option<Vec<u8>>;
}

/// Default builder producing the flat per-variant record array.
#[derive(Debug, Default)]
pub struct VariationPayloadBuilder;

impl VariationPayloadBuilder {
    fn record(source: &SourceProduct, variant: &SourceVariant, rules: &BuildRules) -> VariationRecord {
        let model = rules
            .model_attributes
            .iter()
            .map(|slug| variant.attribute(slug))
            .find(|value| !value.is_empty())
            .unwrap_or("")
            .to_string();

        VariationRecord {
            product_name: source.name.clone(),
            parent_product_id: source.id,
            variation_id: variant.id,
            sku: variant.sku.clone(),
            color: variant.attribute(COLOR_ATTRIBUTE).to_string(),
            model,
            price: variant.price,
            stock_status: variant.stock_status.clone(),
            purchase_link_url: source.permalink.clone(),
            purchase_link_text: rules.link_label.clone(),
            last_scraped_at: source
                .last_scraped_at
                .map(|t| t.format(SCRAPED_AT_FORMAT).to_string()),
        }
    }
}

impl PayloadBuilder for VariationPayloadBuilder {
    fn build(&self, source: &SourceProduct, rules: &BuildRules) -> Option<Vec<u8>> {
        if source.variants.is_empty() {
            return None;
        }

        let records: Vec<VariationRecord> = source
            .variants
            .iter()
            .map(|variant| Self::record(source, variant, rules))
            .collect();

        // serde_json only fails here on non-string map keys or fallible
        // Serialize impls; VariationRecord has neither.
        serde_json::to_vec(&records).ok()
    }
}
