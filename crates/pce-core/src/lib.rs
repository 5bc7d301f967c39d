//! Core domain model and identifier normalization for PCE.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "pce-core";

/// Column name the store reserves for the deduplication key.
pub const IDENTIFIER_FIELD: &str = "identifier";

/// Field names populated by enrichment.
pub const IMAGE_FIELD: &str = "image";
pub const SHORT_DESCRIPTION_FIELD: &str = "short_description";
pub const LONG_DESCRIPTION_FIELD: &str = "long_description";

/// Canonical identifier normalization: trim + lowercase.
///
/// Must be applied identically at every lookup, insert, and comparison site;
/// an unnormalized comparison anywhere leaks duplicates.
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// One catalog item: a free-text identifier plus an open field map.
///
/// The field set is not fixed at creation. Column operations on the store
/// mutate it retroactively, and enrichment adds fields after the fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub identifier: String,
    #[serde(default)]
    pub fields: BTreeMap<String, JsonValue>,
}

impl ProductRecord {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Normalized form of the identifier, the store's uniqueness key.
    pub fn normalized_identifier(&self) -> String {
        normalize(&self.identifier)
    }

    pub fn text_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }
}
