//! # Ontology Module
//!
//! Matching rules per entity kind: which fields are strong identifiers, and
//! which identifier values are blank sentinels that must never act as a key.

use crate::config::MatchingConfig;
use crate::error::{BlueskyError, Result};
use crate::model::{EntityKind, Field, FieldValue, Record};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A strong identifier: exact equality of its value denotes the same entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrongIdentifier {
    /// The field that serves as a strong identifier
    pub field: Field,
    /// Human-readable name for this strong identifier
    pub name: String,
}

impl StrongIdentifier {
    pub fn new(field: Field) -> Self {
        Self {
            field,
            name: format!("identity_key_{}", field.name()),
        }
    }
}

/// One populated identifier of a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub kind: EntityKind,
    pub field: Field,
    pub value: String,
}

/// The complete set of matching rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ontology {
    /// Strong identifiers per entity kind, in priority order
    pub strong_identifiers: BTreeMap<EntityKind, Vec<StrongIdentifier>>,
    /// Lower-cased identifier texts that count as absent
    pub blank_identifiers: Vec<String>,
}

impl Ontology {
    /// Create an ontology with no identifiers
    pub fn new() -> Self {
        Self {
            strong_identifiers: BTreeMap::new(),
            blank_identifiers: Vec::new(),
        }
    }

    /// Build the ontology described by the matching configuration.
    pub fn from_config(config: &MatchingConfig) -> Result<Self> {
        let mut ontology = Self::new();
        for (kind, names) in [
            (EntityKind::Property, &config.property_identifiers),
            (EntityKind::TaxLot, &config.tax_lot_identifiers),
        ] {
            for name in names {
                let field: Field = name.parse().map_err(BlueskyError::Config)?;
                if !field.applies_to(kind) {
                    return Err(BlueskyError::Config(format!(
                        "identifier `{}` is not a {} field",
                        field, kind
                    )));
                }
                ontology.add_strong_identifier(kind, StrongIdentifier::new(field));
            }
        }
        for sentinel in &config.blank_identifiers {
            ontology.add_blank_identifier(sentinel);
        }
        Ok(ontology)
    }

    /// Add a strong identifier for an entity kind
    pub fn add_strong_identifier(&mut self, kind: EntityKind, identifier: StrongIdentifier) {
        let identifiers = self.strong_identifiers.entry(kind).or_default();
        if !identifiers.iter().any(|existing| existing.field == identifier.field) {
            identifiers.push(identifier);
        }
    }

    /// Treat `sentinel` (case-insensitive, trimmed) as a missing identifier
    pub fn add_blank_identifier(&mut self, sentinel: &str) {
        let sentinel = sentinel.trim().to_lowercase();
        if !self.blank_identifiers.contains(&sentinel) {
            self.blank_identifiers.push(sentinel);
        }
    }

    /// Get strong identifiers for a specific entity kind
    pub fn strong_identifiers_for(&self, kind: EntityKind) -> &[StrongIdentifier] {
        self.strong_identifiers
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Check if a field is a strong identifier for a given kind
    pub fn is_strong_identifier(&self, kind: EntityKind, field: Field) -> bool {
        self.strong_identifiers_for(kind)
            .iter()
            .any(|identifier| identifier.field == field)
    }

    /// Normalised identifier text, or `None` when the value is blank.
    ///
    /// Empty and whitespace text, numeric zero and configured sentinels all
    /// count as absent so they can never collapse unrelated entities.
    pub fn identifier_value(&self, value: &FieldValue) -> Option<String> {
        let text = value.identity_text()?;
        if text.is_empty() || is_zero(&text) {
            return None;
        }
        let lowered = text.to_lowercase();
        if self.blank_identifiers.iter().any(|blank| *blank == lowered) {
            return None;
        }
        Some(text)
    }

    /// Every populated, non-blank identity key of a record.
    pub fn identity_keys(&self, record: &Record) -> Vec<IdentityKey> {
        self.strong_identifiers_for(record.kind)
            .iter()
            .filter_map(|identifier| {
                let value = record.field(identifier.field)?;
                self.identifier_value(value).map(|value| IdentityKey {
                    kind: record.kind,
                    field: identifier.field,
                    value,
                })
            })
            .collect()
    }
}

fn is_zero(text: &str) -> bool {
    text.parse::<f64>().map(|n| n == 0.0).unwrap_or(false)
}

impl Default for Ontology {
    fn default() -> Self {
        Self::from_config(&MatchingConfig::default()).unwrap_or_else(|_| Self::new())
    }
}
