//! # Partitioned Processing Module
//!
//! Each organization is one partition. A partition owns its store and match
//! pool exclusively; batches of the same organization serialize on the
//! partition mutex while different organizations proceed in parallel.
//!
//! ## Pipeline
//!
//! ```text
//! sealed rows ──► store (Mapping) ──► dedupe ──► match ──► merge ──► promote
//!                                      │          │
//!                                      ▼          ▼
//!                                   Delete     PossibleMatch (left unbound)
//! ```

use crate::dedup::dedupe;
use crate::error::{BlueskyError, Result};
use crate::hasher::{fingerprint, same_content};
use crate::index::MatchPool;
use crate::matcher::{find_exact, match_record, MatchOutcome, MatchedTo};
use crate::merge::{merge, MergePolicy};
use crate::model::{
    CycleId, DataState, EntityId, ImportBatchId, MatchKind, MergeState, OrganizationId, Record,
    RecordId, SealedDraft,
};
use crate::ontology::Ontology;
use crate::promote::{promote, Promotion};
use crate::store::{IdAllocator, RecordStore, Store};
use crate::temporal::Interval;
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// How unique rows of a batch are reconciled against existing entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchMode {
    /// Match and merge into existing entities
    #[default]
    Reconcile,
    /// Every unique row becomes a new entity; an exact content hit is an error
    ForceNew,
}

/// A row that did not commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowFailure {
    /// Input row index
    pub row: usize,
    #[serde(serialize_with = "serialize_error")]
    pub error: BlueskyError,
}

fn serialize_error<S>(error: &BlueskyError, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(error)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub entity: EntityId,
    /// The merged child, now the entity head
    pub record: RecordId,
    pub parents: Vec<RecordId>,
    /// Keys whose values disagreed
    pub resolutions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PossibleMatchReport {
    pub row: usize,
    pub record: RecordId,
    pub candidates: Vec<EntityId>,
}

/// Everything one batch did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub organization: OrganizationId,
    pub batch: ImportBatchId,
    /// Input rows, failed ones included
    pub rows: usize,
    /// row -> stored record
    pub records: BTreeMap<usize, RecordId>,
    /// duplicate -> in-batch representative
    pub duplicates_in_batch: BTreeMap<RecordId, RecordId>,
    /// record -> entity head it already equalled
    pub duplicates_of_existing: BTreeMap<RecordId, RecordId>,
    pub created_entities: Vec<EntityId>,
    pub merged: Vec<MergeSummary>,
    pub possible_matches: Vec<PossibleMatchReport>,
    pub views: Vec<Promotion>,
    pub failures: Vec<RowFailure>,
}

impl BatchReport {
    fn new(organization: OrganizationId, batch: ImportBatchId, rows: usize) -> Self {
        Self {
            organization,
            batch,
            rows,
            records: BTreeMap::new(),
            duplicates_in_batch: BTreeMap::new(),
            duplicates_of_existing: BTreeMap::new(),
            created_entities: Vec::new(),
            merged: Vec::new(),
            possible_matches: Vec::new(),
            views: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Rows left after intra-batch deduplication.
    pub fn unique_rows(&self) -> usize {
        self.records.len() - self.duplicates_in_batch.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn add_failures(&mut self, failures: Vec<RowFailure>) {
        self.failures.extend(failures);
        self.failures.sort_by_key(|failure| failure.row);
    }
}

enum RowOutcome {
    Created(EntityId),
    Merged(MergeSummary),
    /// Content already held by the entity head
    Unchanged { entity: EntityId, head: RecordId },
    Possible(Vec<EntityId>),
}

impl RowOutcome {
    fn entity(&self) -> Option<EntityId> {
        match self {
            RowOutcome::Created(entity) => Some(*entity),
            RowOutcome::Merged(summary) => Some(summary.entity),
            RowOutcome::Unchanged { entity, .. } => Some(*entity),
            RowOutcome::Possible(_) => None,
        }
    }
}

/// One organization's exclusive state.
pub struct Partition {
    organization: OrganizationId,
    store: Store,
    pool: MatchPool,
    ontology: Arc<Ontology>,
    policy: Arc<MergePolicy>,
}

impl Partition {
    pub fn new(
        organization: OrganizationId,
        ids: Arc<IdAllocator>,
        ontology: Arc<Ontology>,
        policy: Arc<MergePolicy>,
    ) -> Self {
        Self {
            organization,
            store: Store::with_allocator(organization, ids),
            pool: MatchPool::new(organization),
            ontology,
            policy,
        }
    }

    pub fn organization(&self) -> OrganizationId {
        self.organization
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn pool(&self) -> &MatchPool {
        &self.pool
    }

    pub fn open_batch(&mut self, name: &str) -> Result<ImportBatchId> {
        self.store.open_batch(name)
    }

    pub fn create_cycle(&mut self, name: &str, period: Interval) -> Result<CycleId> {
        self.store.create_cycle(name, period)
    }

    pub fn promote(&mut self, record: RecordId, cycle: CycleId) -> Result<Promotion> {
        promote(&mut self.store, record, cycle)
    }

    /// Run one batch through dedupe, match, merge and promotion in row order.
    ///
    /// Unknown batch or cycle fails the whole call; anything else fails only
    /// its row, which is reported and skipped.
    #[instrument(
        skip_all,
        fields(organization = %self.organization, batch = %batch, rows = rows.len())
    )]
    pub fn process_batch(
        &mut self,
        batch: ImportBatchId,
        rows: Vec<(usize, SealedDraft)>,
        mode: MatchMode,
        cycle: Option<CycleId>,
    ) -> Result<BatchReport> {
        if self.store.batch(batch).is_none() {
            return Err(BlueskyError::UnknownBatch(batch));
        }
        if let Some(cycle) = cycle {
            if self.store.cycle(cycle).is_none() {
                return Err(BlueskyError::UnknownCycle(cycle));
            }
        }

        let mut report = BatchReport::new(self.organization, batch, rows.len());
        let mut row_of: FxHashMap<RecordId, usize> = FxHashMap::default();
        let mut stored = Vec::with_capacity(rows.len());

        for (row, mut sealed) in rows {
            sealed.import_batch = Some(batch);
            match self.store.insert_record(sealed) {
                Ok(id) => {
                    row_of.insert(id, row);
                    report.records.insert(row, id);
                    stored.push(id);
                }
                Err(error) => report.failures.push(RowFailure { row, error }),
            }
        }
        for id in &stored {
            if let Some(record) = self.store.record_mut(*id) {
                record.data_state = DataState::Matching;
            }
        }

        // Ids were allocated in row order, so this is the input order.
        let (unique, duplicates) = {
            let records: Vec<&Record> = stored
                .iter()
                .filter_map(|id| self.store.record(*id))
                .collect();
            let deduplicated = dedupe(records);
            (deduplicated.unique_ids(), deduplicated.duplicates)
        };
        for (duplicate, representative) in &duplicates {
            self.discard(*duplicate, *representative);
        }
        debug!(
            unique = unique.len(),
            duplicates = duplicates.len(),
            "deduplicated batch"
        );
        report.duplicates_in_batch = duplicates;

        let mut touched: Vec<(EntityId, usize)> = Vec::new();
        let mut seen: FxHashSet<EntityId> = FxHashSet::default();
        for id in unique {
            let row = row_of.get(&id).copied().unwrap_or_default();
            let outcome = match self.reconcile(id, mode) {
                Ok(outcome) => outcome,
                Err(error) => {
                    debug!(row, record = %id, %error, "row failed");
                    report.failures.push(RowFailure { row, error });
                    continue;
                }
            };
            if let Some(entity) = outcome.entity() {
                if seen.insert(entity) {
                    touched.push((entity, row));
                }
            }
            match outcome {
                RowOutcome::Created(entity) => report.created_entities.push(entity),
                RowOutcome::Merged(summary) => report.merged.push(summary),
                RowOutcome::Unchanged { head, .. } => {
                    report.duplicates_of_existing.insert(id, head);
                }
                RowOutcome::Possible(candidates) => {
                    report.possible_matches.push(PossibleMatchReport {
                        row,
                        record: id,
                        candidates,
                    });
                }
            }
        }

        if let Some(cycle) = cycle {
            for (entity, row) in touched {
                let head = match self.store.entity(entity) {
                    Some(entity) => entity.head,
                    None => continue,
                };
                match promote(&mut self.store, head, cycle) {
                    Ok(promotion) => report.views.push(promotion),
                    Err(error) => report.failures.push(RowFailure { row, error }),
                }
            }
        }
        report.failures.sort_by_key(|failure| failure.row);

        info!(
            created = report.created_entities.len(),
            merged = report.merged.len(),
            duplicates = report.duplicates_in_batch.len(),
            unchanged = report.duplicates_of_existing.len(),
            possible = report.possible_matches.len(),
            views = report.views.len(),
            failures = report.failures.len(),
            "batch processed"
        );
        Ok(report)
    }

    fn reconcile(&mut self, id: RecordId, mode: MatchMode) -> Result<RowOutcome> {
        let candidate = self.store.record(id).ok_or(BlueskyError::UnknownRecord(id))?;

        let outcome = match mode {
            MatchMode::ForceNew => match find_exact(candidate, &self.pool) {
                Some(hit) => {
                    let hash = candidate.hash().clone();
                    self.discard(id, hit.record);
                    return Err(BlueskyError::DuplicateData {
                        existing: hit.record,
                        hash,
                    });
                }
                None => MatchOutcome::NoMatch,
            },
            MatchMode::Reconcile => match_record(candidate, &self.pool, &self.ontology),
        };

        match outcome {
            MatchOutcome::NoMatch => self.create(id),
            MatchOutcome::Matched(to) => self.absorb(id, to),
            MatchOutcome::PossibleMatch { candidates } => {
                if let Some(record) = self.store.record_mut(id) {
                    record.match_kind = Some(MatchKind::PossibleMatch);
                }
                Ok(RowOutcome::Possible(
                    candidates.into_iter().map(|to| to.entity).collect(),
                ))
            }
        }
    }

    fn create(&mut self, id: RecordId) -> Result<RowOutcome> {
        let entity = self.store.create_entity(id)?;
        let record = self
            .store
            .record_mut(id)
            .ok_or(BlueskyError::UnknownRecord(id))?;
        record.merge_state = MergeState::New;
        record.data_state = DataState::Matched;
        self.pool.insert(entity, record, &self.ontology)?;
        debug!(record = %id, entity = %entity, "created entity");
        Ok(RowOutcome::Created(entity))
    }

    fn absorb(&mut self, id: RecordId, to: MatchedTo) -> Result<RowOutcome> {
        let head = self
            .store
            .record(to.record)
            .ok_or(BlueskyError::UnknownRecord(to.record))?;
        let candidate = self.store.record(id).ok_or(BlueskyError::UnknownRecord(id))?;

        // Retried or redundant rows leave the entity untouched, including
        // rows whose content an earlier merge already absorbed.
        let absorbed = same_content(head, candidate)
            || self
                .store
                .raw_ancestors(to.record)
                .into_iter()
                .any(|ancestor| same_content(ancestor, candidate));
        let merged = if absorbed {
            None
        } else {
            let merged = merge(head, candidate, &self.policy);
            (fingerprint(&merged.content) != *head.hash()).then_some(merged)
        };
        let merged = match merged {
            Some(merged) => merged,
            None => {
                self.discard(id, to.record);
                return Ok(RowOutcome::Unchanged {
                    entity: to.entity,
                    head: to.record,
                });
            }
        };

        let resolutions = merged.resolutions.len();
        let child = self.store.seal_merge(to.record, id, merged)?;
        self.store.set_entity_head(to.entity, child)?;
        if let Some(candidate) = self.store.record_mut(id) {
            candidate.entity = Some(to.entity);
            candidate.match_kind = Some(MatchKind::SystemMatch);
            candidate.data_state = DataState::Matched;
        }
        let child_record = self
            .store
            .record_mut(child)
            .ok_or(BlueskyError::UnknownRecord(child))?;
        child_record.data_state = DataState::Matched;
        self.pool.insert(to.entity, child_record, &self.ontology)?;

        debug!(
            record = %id,
            entity = %to.entity,
            head = %child,
            rule = ?to.rule,
            resolutions,
            "merged into entity"
        );
        Ok(RowOutcome::Merged(MergeSummary {
            entity: to.entity,
            record: child,
            parents: vec![to.record, id],
            resolutions,
        }))
    }

    fn discard(&mut self, id: RecordId, kept: RecordId) {
        if let Some(record) = self.store.record_mut(id) {
            record.data_state = DataState::Delete;
            record.duplicate_of = Some(kept);
        }
    }
}

/// Organization -> partition map.
pub struct Partitions {
    ids: Arc<IdAllocator>,
    ontology: Arc<Ontology>,
    policy: Arc<MergePolicy>,
    partitions: DashMap<OrganizationId, Arc<Mutex<Partition>>>,
}

impl Partitions {
    pub fn new(ontology: Arc<Ontology>, policy: Arc<MergePolicy>) -> Self {
        Self {
            ids: Arc::new(IdAllocator::new()),
            ontology,
            policy,
            partitions: DashMap::new(),
        }
    }

    /// The partition of `organization`, created on first use.
    pub fn get(&self, organization: OrganizationId) -> Arc<Mutex<Partition>> {
        let entry = self.partitions.entry(organization).or_insert_with(|| {
            Arc::new(Mutex::new(Partition::new(
                organization,
                Arc::clone(&self.ids),
                Arc::clone(&self.ontology),
                Arc::clone(&self.policy),
            )))
        });
        Arc::clone(entry.value())
    }

    pub fn existing(&self, organization: OrganizationId) -> Option<Arc<Mutex<Partition>>> {
        self.partitions
            .get(&organization)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn organizations(&self) -> Vec<OrganizationId> {
        let mut organizations: Vec<_> = self.partitions.iter().map(|entry| *entry.key()).collect();
        organizations.sort();
        organizations
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::seal;
    use crate::model::{Field, FieldValue, RecordDraft};

    const ORG: OrganizationId = OrganizationId(1);

    fn partition() -> Partition {
        Partition::new(
            ORG,
            Arc::new(IdAllocator::new()),
            Arc::new(Ontology::default()),
            Arc::new(MergePolicy::default()),
        )
    }

    fn rows(drafts: Vec<RecordDraft>) -> Vec<(usize, SealedDraft)> {
        drafts
            .into_iter()
            .map(|draft| seal(draft.with_organization(ORG), None).unwrap())
            .enumerate()
            .collect()
    }

    fn pm(value: &str) -> RecordDraft {
        RecordDraft::property().with_field(Field::PmPropertyId, value)
    }

    #[test]
    fn test_batch_creates_entities_and_views() {
        let mut partition = partition();
        let batch = partition.open_batch("b").unwrap();
        let cycle = partition
            .create_cycle("2016", Interval::new(0, 10).unwrap())
            .unwrap();

        let report = partition
            .process_batch(
                batch,
                rows(vec![pm("1"), pm("2"), pm("1")]),
                MatchMode::Reconcile,
                Some(cycle),
            )
            .unwrap();

        assert_eq!(report.rows, 3);
        assert_eq!(report.unique_rows(), 2);
        assert_eq!(report.created_entities.len(), 2);
        assert_eq!(report.views.len(), 2);
        assert!(report.is_clean());

        let duplicate = report.records[&2];
        let record = partition.store().record(duplicate).unwrap();
        assert_eq!(record.data_state, DataState::Delete);
        assert_eq!(record.duplicate_of, Some(report.records[&0]));
    }

    #[test]
    fn test_unique_rows_sharing_an_identifier_merge() {
        let mut partition = partition();
        let batch = partition.open_batch("b").unwrap();
        let report = partition
            .process_batch(
                batch,
                rows(vec![
                    pm("1").with_field(Field::City, "Golden"),
                    pm("1").with_field(Field::EnergyScore, 75.0),
                ]),
                MatchMode::Reconcile,
                None,
            )
            .unwrap();

        assert_eq!(report.created_entities.len(), 1);
        assert_eq!(report.merged.len(), 1);
        let summary = &report.merged[0];
        let head = partition.store().entity(summary.entity).unwrap().head;
        assert_eq!(head, summary.record);
        let child = partition.store().record(head).unwrap();
        assert_eq!(child.field(Field::City), Some(&FieldValue::from("Golden")));
        assert_eq!(child.field(Field::EnergyScore), Some(&FieldValue::from(75.0)));
        assert!(report.views.is_empty());
    }

    #[test]
    fn test_force_new_rejects_exact_duplicates() {
        let mut partition = partition();
        let first = partition.open_batch("first").unwrap();
        partition
            .process_batch(first, rows(vec![pm("1")]), MatchMode::Reconcile, None)
            .unwrap();

        let second = partition.open_batch("second").unwrap();
        let report = partition
            .process_batch(
                second,
                rows(vec![pm("1"), pm("1").with_field(Field::City, "Golden")]),
                MatchMode::ForceNew,
                None,
            )
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].row, 0);
        assert!(matches!(
            report.failures[0].error,
            BlueskyError::DuplicateData { .. }
        ));
        // Identity hits do not block a forced new entity.
        assert_eq!(report.created_entities.len(), 1);
    }

    #[test]
    fn test_unknown_batch_and_cycle() {
        let mut partition = partition();
        assert_eq!(
            partition.process_batch(ImportBatchId(42), Vec::new(), MatchMode::Reconcile, None),
            Err(BlueskyError::UnknownBatch(ImportBatchId(42)))
        );
        let batch = partition.open_batch("b").unwrap();
        assert_eq!(
            partition.process_batch(batch, Vec::new(), MatchMode::Reconcile, Some(CycleId(7))),
            Err(BlueskyError::UnknownCycle(CycleId(7)))
        );
    }

    #[test]
    fn test_partitions_are_per_organization() {
        let partitions = Partitions::new(
            Arc::new(Ontology::default()),
            Arc::new(MergePolicy::default()),
        );
        let a = partitions.get(OrganizationId(1));
        let again = partitions.get(OrganizationId(1));
        assert!(Arc::ptr_eq(&a, &again));
        partitions.get(OrganizationId(2));
        assert_eq!(
            partitions.organizations(),
            vec![OrganizationId(1), OrganizationId(2)]
        );
        assert!(partitions.existing(OrganizationId(3)).is_none());
    }
}
