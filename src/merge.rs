//! # Merge Resolver
//!
//! Combines two records judged to be the same entity into new content under
//! deterministic precedence. Neither input is touched; the caller seals the
//! result as a fresh record linked to both parents.

use crate::config::MergeConfig;
use crate::error::{BlueskyError, Result};
use crate::model::{FieldResolution, FieldValue, MergeKey, MergeState, Record, RecordContent, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Which side wins when both hold different non-empty values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Precedence {
    /// The incoming (newer batch) value wins
    #[default]
    FavorNew,
    FavorExisting,
}

impl Precedence {
    fn outcome(self) -> MergeState {
        match self {
            Precedence::FavorNew => MergeState::FavorNew,
            Precedence::FavorExisting => MergeState::FavorExisting,
        }
    }
}

/// Precedence rules applied by [`merge`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePolicy {
    pub default: Precedence,
    pub overrides: BTreeMap<MergeKey, Precedence>,
}

impl MergePolicy {
    pub fn new(default: Precedence) -> Self {
        Self {
            default,
            overrides: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &MergeConfig) -> Result<Self> {
        let mut policy = Self::new(config.precedence);
        for (name, precedence) in &config.field_precedence {
            let key: MergeKey = name.parse().map_err(BlueskyError::Config)?;
            policy.overrides.insert(key, *precedence);
        }
        Ok(policy)
    }

    pub fn with_override(mut self, key: MergeKey, precedence: Precedence) -> Self {
        self.overrides.insert(key, precedence);
        self
    }

    pub fn precedence_for(&self, key: &MergeKey) -> Precedence {
        self.overrides.get(key).copied().unwrap_or(self.default)
    }
}

/// Merged content plus the audit trail of resolved disagreements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedContent {
    pub content: RecordContent,
    pub resolutions: Vec<FieldResolution>,
}

/// Merge `incoming` onto `existing`.
///
/// Per key: a value present or non-empty on only one side is taken; equal
/// values are kept; differing non-empty values follow the policy and leave a
/// `FavorNew`/`FavorExisting` resolution. No key is ever dropped.
pub fn merge(existing: &Record, incoming: &Record, policy: &MergePolicy) -> MergedContent {
    debug_assert_eq!(existing.kind, incoming.kind);
    let mut resolutions = Vec::new();

    let fields = merge_maps(
        &existing.content().fields,
        &incoming.content().fields,
        |field| MergeKey::Field(*field),
        policy,
        &mut resolutions,
    );
    let extra_data = merge_maps(
        &existing.content().extra_data,
        &incoming.content().extra_data,
        |key| MergeKey::Extra(key.clone()),
        policy,
        &mut resolutions,
    );

    MergedContent {
        content: RecordContent { fields, extra_data },
        resolutions,
    }
}

/// Merge and seal the child record under `id` in one step.
pub fn merge_records(
    id: RecordId,
    existing: &Record,
    incoming: &Record,
    policy: &MergePolicy,
) -> Record {
    let merged = merge(existing, incoming, policy);
    Record::merged(id, existing, incoming, merged.content, merged.resolutions)
}

fn merge_maps<K, F>(
    existing: &BTreeMap<K, FieldValue>,
    incoming: &BTreeMap<K, FieldValue>,
    key_of: F,
    policy: &MergePolicy,
    resolutions: &mut Vec<FieldResolution>,
) -> BTreeMap<K, FieldValue>
where
    K: Ord + Clone,
    F: Fn(&K) -> MergeKey,
{
    let keys: BTreeSet<&K> = existing.keys().chain(incoming.keys()).collect();
    let mut merged = BTreeMap::new();

    for key in keys {
        let value = match (existing.get(key), incoming.get(key)) {
            (Some(old), None) => old.clone(),
            (None, Some(new)) => new.clone(),
            (Some(old), Some(new)) => resolve(old, new, || key_of(key), policy, resolutions),
            (None, None) => continue,
        };
        merged.insert(key.clone(), value);
    }

    merged
}

fn resolve<F>(
    old: &FieldValue,
    new: &FieldValue,
    key: F,
    policy: &MergePolicy,
    resolutions: &mut Vec<FieldResolution>,
) -> FieldValue
where
    F: FnOnce() -> MergeKey,
{
    if new.is_empty() {
        return old.clone();
    }
    if old.is_empty() {
        return new.clone();
    }
    // Equality on the canonical form, so instants differing only below a
    // second are not reported as conflicts.
    if old.canonical() == new.canonical() {
        return old.clone();
    }

    let key = key();
    let precedence = policy.precedence_for(&key);
    resolutions.push(FieldResolution {
        key,
        outcome: precedence.outcome(),
    });
    match precedence {
        Precedence::FavorNew => new.clone(),
        Precedence::FavorExisting => old.clone(),
    }
}
