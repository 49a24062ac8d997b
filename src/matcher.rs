//! # Cross-Batch Matcher
//!
//! Decides whether a candidate record denotes an entity already present in
//! its organization's pool. Rules are tried in order and the first one that
//! produces any hit decides:
//!
//! 1. equal strong identifier value
//! 2. equal content fingerprint
//! 3. no match
//!
//! Hits on more than one entity are never auto-resolved; they are reported as
//! a possible match.

use crate::index::{MatchPool, PoolEntry};
use crate::model::{EntityId, Field, Record, RecordId};
use crate::ontology::Ontology;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// The rule that produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum MatchRule {
    IdentityKey { field: Field },
    ContentHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedTo {
    pub entity: EntityId,
    /// Head record the candidate was compared against
    pub record: RecordId,
    pub rule: MatchRule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    NoMatch,
    Matched(MatchedTo),
    /// Candidates in entity order
    PossibleMatch { candidates: Vec<MatchedTo> },
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Matched(_))
    }
}

/// Match `candidate` against the pool.
pub fn match_record(candidate: &Record, pool: &MatchPool, ontology: &Ontology) -> MatchOutcome {
    if candidate.organization != pool.organization() {
        debug!(
            record = %candidate.id,
            organization = %candidate.organization,
            pool = %pool.organization(),
            "candidate outside pool organization"
        );
        return MatchOutcome::NoMatch;
    }

    let mut hits: BTreeMap<EntityId, MatchedTo> = BTreeMap::new();
    for key in ontology.identity_keys(candidate) {
        let rule = MatchRule::IdentityKey { field: key.field };
        for entry in pool.find_by_key(&key) {
            if eligible(candidate, entry) {
                hits.entry(entry.entity).or_insert_with(|| matched(entry, rule));
            }
        }
    }
    if !hits.is_empty() {
        return decide(hits);
    }

    for entry in pool.find_by_hash(candidate.kind, candidate.hash()) {
        if eligible(candidate, entry) {
            hits.entry(entry.entity)
                .or_insert_with(|| matched(entry, MatchRule::ContentHash));
        }
    }
    decide(hits)
}

/// Exact content hits only; identity keys are not consulted.
pub fn find_exact(candidate: &Record, pool: &MatchPool) -> Option<MatchedTo> {
    pool.find_by_hash(candidate.kind, candidate.hash())
        .into_iter()
        .find(|entry| eligible(candidate, entry))
        .map(|entry| matched(entry, MatchRule::ContentHash))
}

fn eligible(candidate: &Record, entry: &PoolEntry) -> bool {
    entry.organization == candidate.organization
        && entry.kind == candidate.kind
        && entry.record != candidate.id
}

fn matched(entry: &PoolEntry, rule: MatchRule) -> MatchedTo {
    MatchedTo {
        entity: entry.entity,
        record: entry.record,
        rule,
    }
}

fn decide(hits: BTreeMap<EntityId, MatchedTo>) -> MatchOutcome {
    let mut candidates: Vec<MatchedTo> = hits.into_values().collect();
    match candidates.len() {
        0 => MatchOutcome::NoMatch,
        1 => MatchOutcome::Matched(candidates.remove(0)),
        _ => MatchOutcome::PossibleMatch { candidates },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::seal;
    use crate::model::{OrganizationId, RecordDraft};

    fn record(id: u64, org: u64, draft: RecordDraft) -> Record {
        let sealed = seal(draft.with_organization(OrganizationId(org)), None).unwrap();
        Record::from_sealed(RecordId(id), sealed)
    }

    fn pool_with(heads: &[(u64, &Record)]) -> MatchPool {
        let ontology = Ontology::default();
        let mut pool = MatchPool::new(OrganizationId(1));
        for (entity, head) in heads {
            pool.insert(EntityId(*entity), head, &ontology).unwrap();
        }
        pool
    }

    #[test]
    fn test_empty_pool_is_no_match() {
        let candidate = record(1, 1, RecordDraft::property().with_field(Field::PmPropertyId, "2264"));
        let pool = MatchPool::new(OrganizationId(1));
        assert_eq!(
            match_record(&candidate, &pool, &Ontology::default()),
            MatchOutcome::NoMatch
        );
    }

    #[test]
    fn test_identity_key_match() {
        let head = record(
            1,
            1,
            RecordDraft::property()
                .with_field(Field::PmPropertyId, "2264")
                .with_field(Field::City, "Golden"),
        );
        let pool = pool_with(&[(10, &head)]);
        let candidate = record(
            2,
            1,
            RecordDraft::property()
                .with_field(Field::PmPropertyId, " 2264 ")
                .with_field(Field::City, "Denver"),
        );

        assert_eq!(
            match_record(&candidate, &pool, &Ontology::default()),
            MatchOutcome::Matched(MatchedTo {
                entity: EntityId(10),
                record: RecordId(1),
                rule: MatchRule::IdentityKey {
                    field: Field::PmPropertyId
                },
            })
        );
    }

    #[test]
    fn test_content_hash_match_without_identifiers() {
        let head = record(1, 1, RecordDraft::property().with_field(Field::AddressLine1, "123 Fake St"));
        let pool = pool_with(&[(10, &head)]);
        let candidate = record(2, 1, RecordDraft::property().with_field(Field::AddressLine1, "123 Fake St"));

        match match_record(&candidate, &pool, &Ontology::default()) {
            MatchOutcome::Matched(to) => assert_eq!(to.rule, MatchRule::ContentHash),
            other => panic!("expected a match, got {:?}", other),
        }
        assert!(find_exact(&candidate, &pool).is_some());
    }

    #[test]
    fn test_blank_identifier_never_matches() {
        let ontology = Ontology::default();
        for blank in ["", "0", "   ", "N/A"] {
            let head = record(
                1,
                1,
                RecordDraft::property()
                    .with_field(Field::PmPropertyId, blank)
                    .with_field(Field::City, "Golden"),
            );
            let pool = pool_with(&[(10, &head)]);
            let candidate = record(
                2,
                1,
                RecordDraft::property()
                    .with_field(Field::PmPropertyId, blank)
                    .with_field(Field::City, "Boulder"),
            );
            assert_eq!(
                match_record(&candidate, &pool, &ontology),
                MatchOutcome::NoMatch,
                "blank identifier {:?} must not match",
                blank
            );
        }
    }

    #[test]
    fn test_ambiguous_identifiers_yield_possible_match() {
        let a = record(1, 1, RecordDraft::property().with_field(Field::PmPropertyId, "2264"));
        let b = record(2, 1, RecordDraft::property().with_field(Field::CustomId1, "ABC"));
        let pool = pool_with(&[(10, &a), (11, &b)]);
        let candidate = record(
            3,
            1,
            RecordDraft::property()
                .with_field(Field::PmPropertyId, "2264")
                .with_field(Field::CustomId1, "ABC"),
        );

        match match_record(&candidate, &pool, &Ontology::default()) {
            MatchOutcome::PossibleMatch { candidates } => {
                let entities: Vec<_> = candidates.iter().map(|to| to.entity).collect();
                assert_eq!(entities, vec![EntityId(10), EntityId(11)]);
            }
            other => panic!("expected a possible match, got {:?}", other),
        }
    }

    #[test]
    fn test_ambiguous_hash_yields_possible_match() {
        let a = record(1, 1, RecordDraft::property().with_field(Field::City, "Golden"));
        let b = record(2, 1, RecordDraft::property().with_field(Field::City, "Golden"));
        let pool = pool_with(&[(10, &a), (11, &b)]);
        let candidate = record(3, 1, RecordDraft::property().with_field(Field::City, "Golden"));
        assert!(matches!(
            match_record(&candidate, &pool, &Ontology::default()),
            MatchOutcome::PossibleMatch { .. }
        ));
    }

    #[test]
    fn test_identifier_rule_wins_over_hash() {
        let by_key = record(1, 1, RecordDraft::property().with_field(Field::PmPropertyId, "7"));
        let by_hash = record(
            2,
            1,
            RecordDraft::property()
                .with_field(Field::PmPropertyId, "7")
                .with_field(Field::City, "Golden"),
        );
        // Only the first head keeps the identifier in the index.
        let ontology = Ontology::default();
        let mut pool = MatchPool::new(OrganizationId(1));
        pool.insert(EntityId(10), &by_key, &ontology).unwrap();
        let mut hash_only = by_hash.clone();
        hash_only.id = RecordId(5);
        let mut no_keys = Ontology::default();
        no_keys.strong_identifiers.clear();
        pool.insert(EntityId(11), &hash_only, &no_keys).unwrap();

        match match_record(&by_hash, &pool, &ontology) {
            MatchOutcome::Matched(to) => assert_eq!(to.entity, EntityId(10)),
            other => panic!("expected identity match, got {:?}", other),
        }
    }

    #[test]
    fn test_cross_tenant_never_matches() {
        let head = record(1, 1, RecordDraft::property().with_field(Field::PmPropertyId, "2264"));
        let pool = pool_with(&[(10, &head)]);
        let candidate = record(2, 2, RecordDraft::property().with_field(Field::PmPropertyId, "2264"));
        assert_eq!(
            match_record(&candidate, &pool, &Ontology::default()),
            MatchOutcome::NoMatch
        );
        assert!(find_exact(&candidate, &pool).is_none());
    }

    #[test]
    fn test_kinds_never_match() {
        let head = record(1, 1, RecordDraft::property().with_field(Field::City, "Golden"));
        let pool = pool_with(&[(10, &head)]);
        let candidate = record(2, 1, RecordDraft::tax_lot().with_field(Field::City, "Golden"));
        assert_eq!(
            match_record(&candidate, &pool, &Ontology::default()),
            MatchOutcome::NoMatch
        );
    }
}
