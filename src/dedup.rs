//! # Intra-Batch Deduplication
//!
//! Collapses rows of one import batch that share a fingerprint. The first
//! row in input order represents its group; callers pass records in row
//! order (ascending `RecordId`, which the store allocates in row order).

use crate::model::{EntityKind, Fingerprint, OrganizationId, Record, RecordId};
use hashbrown::HashMap;
use std::collections::BTreeMap;

/// Result of collapsing a batch.
#[derive(Debug, Clone, Default)]
pub struct Deduplicated<'a> {
    /// One representative per fingerprint, in input order
    pub unique: Vec<&'a Record>,
    /// duplicate -> representative
    pub duplicates: BTreeMap<RecordId, RecordId>,
}

impl Deduplicated<'_> {
    pub fn unique_ids(&self) -> Vec<RecordId> {
        self.unique.iter().map(|record| record.id).collect()
    }
}

type GroupKey<'a> = (OrganizationId, EntityKind, &'a Fingerprint);

/// Group records by fingerprint, keeping the first-encountered of each group.
///
/// The group key also carries organization and kind so that a property and
/// a tax lot with coincidentally equal content never collapse together.
pub fn dedupe<'a, I>(records: I) -> Deduplicated<'a>
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut representatives: HashMap<GroupKey<'a>, RecordId> = HashMap::new();
    let mut result = Deduplicated::default();

    for record in records {
        let key = (record.organization, record.kind, record.hash());
        match representatives.get(&key) {
            Some(&representative) => {
                result.duplicates.insert(record.id, representative);
            }
            None => {
                representatives.insert(key, record.id);
                result.unique.push(record);
            }
        }
    }

    result
}
