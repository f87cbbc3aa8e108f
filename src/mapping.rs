//! Export mappings: how a product becomes a channel payload.
//!
//! An account's mapping is a declarative list of `{source, target}` entries.
//! Rendering walks the list and builds a JSON object the way the remote
//! expects it; a source that is unset on the product simply omits its key.
//! The payload doubles as the change-detection baseline stored on the
//! binding, so rendering must be deterministic.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::Product;

/// Payload key the remote uses to correlate bulk results. Fragile by
/// protocol design; see `sync::match_result`.
pub const NAME_KEY: &str = "Name";
/// External key of a product on the channel platform.
pub const MERCHANT_KEY: &str = "MerchantProductNo";
/// Grouping key tying sibling variants to their synthesized parent entry.
pub const PARENT_KEY: &str = "ParentMerchantProductNo";

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("mapping has no entry targeting `{0}`")]
    MissingTarget(&'static str),
    #[error("mapping targets `{0}` more than once")]
    DuplicateTarget(String),
}

/// Product fields a mapping may read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Name,
    Sku,
    CategoryTrail,
    FamilyKey,
    FamilyDisplayName,
}

impl Source {
    fn as_str(&self) -> &'static str {
        match self {
            Source::Name => "name",
            Source::Sku => "sku",
            Source::CategoryTrail => "category_trail",
            Source::FamilyKey => "family_key",
            Source::FamilyDisplayName => "family_display_name",
        }
    }

    fn read<'a>(&self, product: &'a Product) -> Option<&'a str> {
        match self {
            Source::Name => Some(product.name.as_str()),
            Source::Sku => product.sku.as_deref(),
            Source::CategoryTrail => product.category_trail.as_deref(),
            Source::FamilyKey => product.family_key.as_deref(),
            Source::FamilyDisplayName => product.family_display_name.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldMap {
    pub source: Source,
    pub target: String,
}

/// Ordered list of field mappings for one account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ExportMapping {
    pub entries: Vec<FieldMap>,
}

impl ExportMapping {
    /// Every mapping must produce the correlation name and the external key;
    /// duplicate targets would make the payload ambiguous. Checked when an
    /// account is saved.
    pub fn validate(&self) -> Result<(), MappingError> {
        let mut seen = std::collections::HashSet::new();
        for entry in &self.entries {
            if !seen.insert(entry.target.as_str()) {
                return Err(MappingError::DuplicateTarget(entry.target.clone()));
            }
        }
        for required in [NAME_KEY, MERCHANT_KEY] {
            if !seen.contains(required) {
                return Err(MappingError::MissingTarget(required));
            }
        }
        Ok(())
    }

    /// Canonical dependency list of this mapping. Stored on the account as
    /// `depends`; bindings are only flagged stale when the fingerprint
    /// changes, not on every mapping edit.
    pub fn fingerprint(&self) -> String {
        let mut deps: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("{}:{}", e.source.as_str(), e.target))
            .collect();
        deps.sort();
        deps.join(",")
    }

    /// Render the export payload for one product. Unset sources omit their
    /// key entirely, so e.g. an unbranded product carries no `Brand` key
    /// rather than an empty one. The parent grouping key is emitted iff the
    /// product belongs to a family.
    pub fn render(&self, product: &Product) -> Map<String, Value> {
        let mut payload = Map::new();
        for entry in &self.entries {
            if let Some(value) = entry.source.read(product) {
                payload.insert(entry.target.clone(), Value::String(value.to_string()));
            }
        }
        if let Some(family_key) = product.family_key.as_deref() {
            payload.insert(
                PARENT_KEY.to_string(),
                Value::String(family_key.to_string()),
            );
        }
        payload
    }
}

/// Dry-run a mapping over a sample of products and report configuration
/// problems an operator should fix before enabling the account: external
/// keys must exist and be unique across the assortment.
pub fn check_configuration(mapping: &ExportMapping, products: &[Product]) -> Vec<String> {
    let mut findings = Vec::new();
    let mut keys = std::collections::HashSet::new();
    let mut missing = 0usize;
    let mut duplicated = 0usize;
    for product in products {
        let payload = mapping.render(product);
        match payload.get(MERCHANT_KEY).and_then(Value::as_str) {
            None | Some("") => missing += 1,
            Some(key) => {
                if !keys.insert(key.to_string()) {
                    duplicated += 1;
                }
            }
        }
    }
    if missing > 0 {
        findings.push(format!(
            "{missing} product(s) do not render a {MERCHANT_KEY}"
        ));
    }
    if duplicated > 0 {
        findings.push(format!(
            "{duplicated} product(s) render a duplicate {MERCHANT_KEY}"
        ));
    }
    findings
}
