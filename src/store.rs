//! # Store Module
//!
//! Arena storage for one organization's records, canonical entities, cycles,
//! views and import batches. Everything is keyed by id and only forward
//! references are kept (view -> record/entity/cycle, record -> parents/entity),
//! so removing views and records, then entities, then cycles never leaves a
//! dangling hidden reference.

use crate::error::{BlueskyError, Result};
use crate::merge::MergedContent;
use crate::model::{
    CanonicalEntity, Cycle, CycleId, DataState, EntityId, EntityKind, ImportBatch, ImportBatchId,
    OrganizationId, Record, RecordId, SealedDraft, SourceType, View, ViewId,
};
use crate::promote::ViewChange;
use crate::temporal::{is_overlapping, Interval};
use hashbrown::{HashMap, HashSet};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Process-wide id source. Stores of different organizations share one so
/// that ids never collide across tenants.
#[derive(Debug, Default)]
pub struct IdAllocator {
    batches: AtomicU64,
    records: AtomicU64,
    entities: AtomicU64,
    cycles: AtomicU64,
    views: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn next(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn next_batch(&self) -> ImportBatchId {
        ImportBatchId(Self::next(&self.batches))
    }

    pub fn next_record(&self) -> RecordId {
        RecordId(Self::next(&self.records))
    }

    pub fn next_entity(&self) -> EntityId {
        EntityId(Self::next(&self.entities))
    }

    pub fn next_cycle(&self) -> CycleId {
        CycleId(Self::next(&self.cycles))
    }

    pub fn next_view(&self) -> ViewId {
        ViewId(Self::next(&self.views))
    }
}

/// Storage seam used by the partition pipeline.
pub trait RecordStore: Send {
    fn organization(&self) -> OrganizationId;

    /// Give a sealed draft an id and store it.
    fn insert_record(&mut self, sealed: SealedDraft) -> Result<RecordId>;
    /// Seal merged content as a new record whose parents are `existing` and `incoming`.
    fn seal_merge(
        &mut self,
        existing: RecordId,
        incoming: RecordId,
        merged: MergedContent,
    ) -> Result<RecordId>;
    fn record(&self, id: RecordId) -> Option<&Record>;
    fn record_mut(&mut self, id: RecordId) -> Option<&mut Record>;
    /// Every record in id order.
    fn records(&self) -> Vec<&Record>;

    /// New entity of the head record's kind, headed by it.
    fn create_entity(&mut self, head: RecordId) -> Result<EntityId>;
    fn set_entity_head(&mut self, entity: EntityId, head: RecordId) -> Result<()>;
    fn entity(&self, id: EntityId) -> Option<&CanonicalEntity>;
    /// Every entity in id order.
    fn entities(&self) -> Vec<&CanonicalEntity>;

    fn create_cycle(&mut self, name: &str, period: Interval) -> Result<CycleId>;
    fn cycle(&self, id: CycleId) -> Option<&Cycle>;
    fn cycle_by_name(&self, name: &str) -> Option<&Cycle>;

    fn open_batch(&mut self, name: &str) -> Result<ImportBatchId>;
    fn batch(&self, id: ImportBatchId) -> Option<&ImportBatch>;
    /// Records ingested under `batch`, in row order.
    fn records_for_batch(&self, batch: ImportBatchId) -> Vec<&Record>;

    /// Insert or rebind the single view for (entity, cycle).
    fn bind_view(
        &mut self,
        entity: EntityId,
        cycle: CycleId,
        record: RecordId,
    ) -> Result<(View, ViewChange)>;
    fn view(&self, id: ViewId) -> Option<&View>;
    fn view_for(&self, entity: EntityId, cycle: CycleId) -> Option<&View>;
    fn views_for_cycle(&self, cycle: CycleId) -> Vec<&View>;

    /// Every ancestor of `record` through parent links, nearest first.
    fn ancestors(&self, record: RecordId) -> Vec<&Record> {
        let mut seen = HashSet::new();
        let mut queue: Vec<RecordId> = self
            .record(record)
            .map(|record| record.parents().to_vec())
            .unwrap_or_default();
        let mut ancestors = Vec::new();
        let mut next = 0;
        while next < queue.len() {
            let id = queue[next];
            next += 1;
            if !seen.insert(id) {
                continue;
            }
            if let Some(parent) = self.record(id) {
                queue.extend_from_slice(parent.parents());
                ancestors.push(parent);
            }
        }
        ancestors
    }

    /// Only the imported (non-composite) leaves of the lineage.
    fn raw_ancestors(&self, record: RecordId) -> Vec<&Record> {
        self.ancestors(record)
            .into_iter()
            .filter(|ancestor| ancestor.source_type != SourceType::Composite)
            .collect()
    }

    /// The head record of every entity of `kind`.
    fn canonical_records(&self, kind: EntityKind) -> Vec<&Record> {
        self.entities()
            .into_iter()
            .filter(|entity| entity.kind == kind)
            .filter_map(|entity| self.record(entity.head))
            .collect()
    }

    /// Records of `batch` and `kind` left without an entity and not discarded.
    fn unmatched_records(&self, batch: ImportBatchId, kind: EntityKind) -> Vec<&Record> {
        self.records_for_batch(batch)
            .into_iter()
            .filter(|record| {
                record.kind == kind
                    && record.entity.is_none()
                    && record.data_state != DataState::Delete
            })
            .collect()
    }
}

/// In-memory arena for one organization
#[derive(Debug, Clone)]
pub struct Store {
    organization: OrganizationId,
    ids: Arc<IdAllocator>,
    records: BTreeMap<RecordId, Record>,
    entities: BTreeMap<EntityId, CanonicalEntity>,
    cycles: BTreeMap<CycleId, Cycle>,
    cycle_names: HashMap<String, CycleId>,
    batches: BTreeMap<ImportBatchId, ImportBatch>,
    batch_records: HashMap<ImportBatchId, Vec<RecordId>>,
    views: BTreeMap<ViewId, View>,
    view_keys: HashMap<(EntityId, CycleId), ViewId>,
}

impl Store {
    /// Create a store with its own id allocator
    pub fn new(organization: OrganizationId) -> Self {
        Self::with_allocator(organization, Arc::new(IdAllocator::new()))
    }

    pub fn with_allocator(organization: OrganizationId, ids: Arc<IdAllocator>) -> Self {
        Self {
            organization,
            ids,
            records: BTreeMap::new(),
            entities: BTreeMap::new(),
            cycles: BTreeMap::new(),
            cycle_names: HashMap::new(),
            batches: BTreeMap::new(),
            batch_records: HashMap::new(),
            views: BTreeMap::new(),
            view_keys: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    fn check_tenant(&self, subject: impl ToString, found: OrganizationId) -> Result<()> {
        if found == self.organization {
            Ok(())
        } else {
            Err(BlueskyError::CrossTenant {
                subject: subject.to_string(),
                expected: self.organization,
                found,
            })
        }
    }

    fn push_record(&mut self, record: Record) -> RecordId {
        let id = record.id;
        if let Some(batch) = record.import_batch {
            self.batch_records.entry(batch).or_default().push(id);
        }
        self.records.insert(id, record);
        id
    }
}

impl RecordStore for Store {
    fn organization(&self) -> OrganizationId {
        self.organization
    }

    fn insert_record(&mut self, sealed: SealedDraft) -> Result<RecordId> {
        self.check_tenant("record", sealed.organization())?;
        if let Some(batch) = sealed.import_batch {
            if !self.batches.contains_key(&batch) {
                return Err(BlueskyError::UnknownBatch(batch));
            }
        }
        let record = Record::from_sealed(self.ids.next_record(), sealed);
        Ok(self.push_record(record))
    }

    fn seal_merge(
        &mut self,
        existing: RecordId,
        incoming: RecordId,
        merged: MergedContent,
    ) -> Result<RecordId> {
        let existing = self
            .records
            .get(&existing)
            .ok_or(BlueskyError::UnknownRecord(existing))?;
        let incoming = self
            .records
            .get(&incoming)
            .ok_or(BlueskyError::UnknownRecord(incoming))?;
        let child = Record::merged(
            self.ids.next_record(),
            existing,
            incoming,
            merged.content,
            merged.resolutions,
        );
        Ok(self.push_record(child))
    }

    fn record(&self, id: RecordId) -> Option<&Record> {
        self.records.get(&id)
    }

    fn record_mut(&mut self, id: RecordId) -> Option<&mut Record> {
        self.records.get_mut(&id)
    }

    fn records(&self) -> Vec<&Record> {
        self.records.values().collect()
    }

    fn create_entity(&mut self, head: RecordId) -> Result<EntityId> {
        let record = self
            .records
            .get_mut(&head)
            .ok_or(BlueskyError::UnknownRecord(head))?;
        let id = self.ids.next_entity();
        let kind = record.kind;
        record.entity = Some(id);
        self.entities.insert(
            id,
            CanonicalEntity {
                id,
                organization: self.organization,
                kind,
                head,
            },
        );
        Ok(id)
    }

    fn set_entity_head(&mut self, entity: EntityId, head: RecordId) -> Result<()> {
        let record = self
            .records
            .get_mut(&head)
            .ok_or(BlueskyError::UnknownRecord(head))?;
        let canonical = self
            .entities
            .get_mut(&entity)
            .ok_or(BlueskyError::UnknownEntity(entity))?;
        record.entity = Some(entity);
        canonical.head = head;
        Ok(())
    }

    fn entity(&self, id: EntityId) -> Option<&CanonicalEntity> {
        self.entities.get(&id)
    }

    fn entities(&self) -> Vec<&CanonicalEntity> {
        self.entities.values().collect()
    }

    fn create_cycle(&mut self, name: &str, period: Interval) -> Result<CycleId> {
        if self.cycle_names.contains_key(name) {
            return Err(BlueskyError::DuplicateCycle {
                organization: self.organization,
                name: name.to_string(),
            });
        }
        for existing in self.cycles.values() {
            if is_overlapping(&existing.period, &period) {
                warn!(
                    organization = %self.organization,
                    cycle = name,
                    overlaps = %existing.name,
                    "cycle periods overlap"
                );
            }
        }
        let id = self.ids.next_cycle();
        self.cycles.insert(
            id,
            Cycle {
                id,
                organization: self.organization,
                name: name.to_string(),
                period,
            },
        );
        self.cycle_names.insert(name.to_string(), id);
        Ok(id)
    }

    fn cycle(&self, id: CycleId) -> Option<&Cycle> {
        self.cycles.get(&id)
    }

    fn cycle_by_name(&self, name: &str) -> Option<&Cycle> {
        self.cycle_names.get(name).and_then(|id| self.cycles.get(id))
    }

    fn open_batch(&mut self, name: &str) -> Result<ImportBatchId> {
        let id = self.ids.next_batch();
        self.batches.insert(
            id,
            ImportBatch {
                id,
                organization: self.organization,
                name: name.to_string(),
            },
        );
        Ok(id)
    }

    fn batch(&self, id: ImportBatchId) -> Option<&ImportBatch> {
        self.batches.get(&id)
    }

    fn records_for_batch(&self, batch: ImportBatchId) -> Vec<&Record> {
        self.batch_records
            .get(&batch)
            .map(|ids| ids.iter().filter_map(|id| self.records.get(id)).collect())
            .unwrap_or_default()
    }

    fn bind_view(
        &mut self,
        entity: EntityId,
        cycle: CycleId,
        record: RecordId,
    ) -> Result<(View, ViewChange)> {
        let cycle_org = self
            .cycles
            .get(&cycle)
            .ok_or(BlueskyError::UnknownCycle(cycle))?
            .organization;
        self.check_tenant(cycle, cycle_org)?;
        let entity_org = self
            .entities
            .get(&entity)
            .ok_or(BlueskyError::UnknownEntity(entity))?
            .organization;
        self.check_tenant(entity, entity_org)?;
        if !self.records.contains_key(&record) {
            return Err(BlueskyError::UnknownRecord(record));
        }

        if let Some(view_id) = self.view_keys.get(&(entity, cycle)).copied() {
            let view = self
                .views
                .get_mut(&view_id)
                .ok_or(BlueskyError::UnknownEntity(entity))?;
            let change = if view.record == record {
                ViewChange::Unchanged
            } else {
                let previous = view.record;
                view.record = record;
                ViewChange::Rebound { previous }
            };
            return Ok((view.clone(), change));
        }

        let view = View {
            id: self.ids.next_view(),
            entity,
            cycle,
            record,
        };
        self.view_keys.insert((entity, cycle), view.id);
        self.views.insert(view.id, view.clone());
        Ok((view, ViewChange::Created))
    }

    fn view(&self, id: ViewId) -> Option<&View> {
        self.views.get(&id)
    }

    fn view_for(&self, entity: EntityId, cycle: CycleId) -> Option<&View> {
        self.view_keys
            .get(&(entity, cycle))
            .and_then(|id| self.views.get(id))
    }

    fn views_for_cycle(&self, cycle: CycleId) -> Vec<&View> {
        self.views
            .values()
            .filter(|view| view.cycle == cycle)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::seal;
    use crate::merge::{merge, MergePolicy};
    use crate::model::{Field, RecordDraft};

    const ORG: OrganizationId = OrganizationId(1);

    fn period(start: i64, end: i64) -> Interval {
        Interval::new(start, end).unwrap()
    }

    fn insert(store: &mut Store, batch: ImportBatchId, draft: RecordDraft) -> RecordId {
        let sealed = seal(draft.with_organization(ORG).with_batch(batch), None).unwrap();
        store.insert_record(sealed).unwrap()
    }

    #[test]
    fn test_ids_are_shared_across_stores() {
        let ids = Arc::new(IdAllocator::new());
        let mut a = Store::with_allocator(OrganizationId(1), Arc::clone(&ids));
        let mut b = Store::with_allocator(OrganizationId(2), Arc::clone(&ids));
        let batch_a = a.open_batch("a").unwrap();
        let batch_b = b.open_batch("b").unwrap();
        assert_ne!(batch_a, batch_b);
    }

    #[test]
    fn test_insert_rejects_foreign_records() {
        let mut store = Store::new(ORG);
        let sealed = seal(
            RecordDraft::property()
                .with_organization(OrganizationId(2))
                .with_field(Field::City, "Golden"),
            None,
        )
        .unwrap();
        assert!(matches!(
            store.insert_record(sealed),
            Err(BlueskyError::CrossTenant { .. })
        ));
    }

    #[test]
    fn test_insert_rejects_unknown_batch() {
        let mut store = Store::new(ORG);
        let sealed = seal(
            RecordDraft::property()
                .with_organization(ORG)
                .with_batch(ImportBatchId(99))
                .with_field(Field::City, "Golden"),
            None,
        )
        .unwrap();
        assert_eq!(
            store.insert_record(sealed),
            Err(BlueskyError::UnknownBatch(ImportBatchId(99)))
        );
    }

    #[test]
    fn test_records_are_in_row_order() {
        let mut store = Store::new(ORG);
        let batch = store.open_batch("2016 import").unwrap();
        let ids: Vec<_> = (0..5)
            .map(|i| {
                let draft = RecordDraft::property().with_field(Field::City, format!("c{}", i));
                insert(&mut store, batch, draft)
            })
            .collect();
        let stored: Vec<_> = store.records_for_batch(batch).iter().map(|r| r.id).collect();
        assert_eq!(stored, ids);
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_duplicate_cycle_name_rejected_overlap_allowed() {
        let mut store = Store::new(ORG);
        store.create_cycle("2015", period(0, 100)).unwrap();
        assert!(matches!(
            store.create_cycle("2015", period(200, 300)),
            Err(BlueskyError::DuplicateCycle { .. })
        ));
        let overlapping = store.create_cycle("2015b", period(50, 150)).unwrap();
        assert_eq!(store.cycle_by_name("2015b").map(|c| c.id), Some(overlapping));
    }

    #[test]
    fn test_lineage_queries() {
        let mut store = Store::new(ORG);
        let batch = store.open_batch("b").unwrap();
        let a = insert(&mut store, batch, RecordDraft::property().with_field(Field::City, "Golden"));
        let b = insert(&mut store, batch, RecordDraft::property().with_field(Field::State, "CO"));
        let c = insert(&mut store, batch, RecordDraft::property().with_field(Field::PostalCode, "80401"));

        let policy = MergePolicy::default();
        let merged = merge(store.record(a).unwrap(), store.record(b).unwrap(), &policy);
        let ab = store.seal_merge(a, b, merged).unwrap();
        let merged = merge(store.record(ab).unwrap(), store.record(c).unwrap(), &policy);
        let abc = store.seal_merge(ab, c, merged).unwrap();

        let ancestors: Vec<_> = store.ancestors(abc).iter().map(|r| r.id).collect();
        assert_eq!(ancestors, vec![ab, c, a, b]);
        let mut raw: Vec<_> = store.raw_ancestors(abc).iter().map(|r| r.id).collect();
        raw.sort();
        assert_eq!(raw, vec![a, b, c]);
        assert!(store.ancestors(a).is_empty());

        let child = store.record(abc).unwrap();
        assert!(child.field(Field::City).is_some());
        assert!(child.field(Field::PostalCode).is_some());
    }

    #[test]
    fn test_canonical_and_unmatched_records() {
        let mut store = Store::new(ORG);
        let batch = store.open_batch("b").unwrap();
        let a = insert(&mut store, batch, RecordDraft::property().with_field(Field::City, "Golden"));
        let b = insert(&mut store, batch, RecordDraft::property().with_field(Field::City, "Boulder"));
        let c = insert(&mut store, batch, RecordDraft::property().with_field(Field::City, "Denver"));
        let lot = insert(&mut store, batch, RecordDraft::tax_lot().with_field(Field::City, "Golden"));

        store.create_entity(a).unwrap();
        store.record_mut(b).unwrap().data_state = DataState::Delete;

        let canonical: Vec<_> = store
            .canonical_records(EntityKind::Property)
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(canonical, vec![a]);

        let unmatched: Vec<_> = store
            .unmatched_records(batch, EntityKind::Property)
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(unmatched, vec![c]);
        assert_eq!(store.unmatched_records(batch, EntityKind::TaxLot).len(), 1);
        assert_eq!(store.record(lot).unwrap().kind, EntityKind::TaxLot);
    }

    #[test]
    fn test_entity_kind_follows_head_record() {
        let mut store = Store::new(ORG);
        let batch = store.open_batch("b").unwrap();
        let lot = insert(&mut store, batch, RecordDraft::tax_lot().with_field(Field::City, "Golden"));
        let building = insert(&mut store, batch, RecordDraft::property().with_field(Field::City, "Golden"));

        let lot_entity = store.create_entity(lot).unwrap();
        let building_entity = store.create_entity(building).unwrap();
        assert_eq!(store.entity(lot_entity).unwrap().kind, EntityKind::TaxLot);
        assert_eq!(store.entity(building_entity).unwrap().kind, EntityKind::Property);
        assert!(matches!(
            store.create_entity(RecordId(999)),
            Err(BlueskyError::UnknownRecord(_))
        ));
    }

    #[test]
    fn test_bind_view_is_one_per_entity_and_cycle() {
        let mut store = Store::new(ORG);
        let batch = store.open_batch("b").unwrap();
        let a = insert(&mut store, batch, RecordDraft::property().with_field(Field::City, "Golden"));
        let b = insert(&mut store, batch, RecordDraft::property().with_field(Field::City, "Boulder"));
        let entity = store.create_entity(a).unwrap();
        let cycle = store.create_cycle("2016", period(0, 10)).unwrap();

        let (view, change) = store.bind_view(entity, cycle, a).unwrap();
        assert_eq!(change, ViewChange::Created);
        let (same, change) = store.bind_view(entity, cycle, a).unwrap();
        assert_eq!(change, ViewChange::Unchanged);
        assert_eq!(same.id, view.id);
        let (rebound, change) = store.bind_view(entity, cycle, b).unwrap();
        assert_eq!(change, ViewChange::Rebound { previous: a });
        assert_eq!(rebound.id, view.id);
        assert_eq!(store.view_count(), 1);
        assert_eq!(store.view_for(entity, cycle).map(|v| v.record), Some(b));
    }
}
