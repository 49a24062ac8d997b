//! # Bluesky
//!
//! Deduplication, identity matching and merge resolution for building and tax
//! lot records. Records arrive in import batches, are fingerprinted, collapsed
//! within their batch, matched against the canonical entities of their
//! organization, merged on a match and finally bound to a reporting cycle.
//!
//! ```text
//! drafts ─► hasher ─► dedup ─► matcher ─► merge ─► promote ─► views
//!           (parallel)  └──── per-organization partition lock ────┘
//! ```

pub mod config;
pub mod dedup;
pub mod error;
pub mod hasher;
pub mod index;
pub mod matcher;
pub mod merge;
pub mod model;
pub mod ontology;
pub mod partition;
pub mod promote;
pub mod store;
pub mod temporal;

pub use config::BlueskyConfig;
pub use dedup::{dedupe, Deduplicated};
pub use error::{BlueskyError, Result};
pub use hasher::{fingerprint, fingerprint_all, seal, seal_all};
pub use matcher::{match_record, MatchOutcome, MatchRule, MatchedTo};
pub use merge::{merge, MergePolicy, MergedContent, Precedence};
pub use model::{
    CanonicalEntity, Cycle, CycleId, DataState, EntityId, EntityKind, Field, FieldValue,
    Fingerprint, ImportBatchId, MergeState, OrganizationId, Record, RecordDraft, RecordId,
    SourceType, View, ViewId,
};
pub use ontology::Ontology;
pub use partition::{BatchReport, MatchMode, Partition, Partitions, RowFailure};
pub use promote::{promote, Promotion, ViewChange};
pub use store::{RecordStore, Store};
pub use temporal::Interval;

use dashmap::DashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// One batch submitted for reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub organization: OrganizationId,
    pub batch: ImportBatchId,
    /// Cycle the touched entities are promoted into, if any
    #[serde(default)]
    pub cycle: Option<CycleId>,
    #[serde(default)]
    pub mode: MatchMode,
    pub drafts: Vec<RecordDraft>,
}

impl BatchRequest {
    pub fn new(organization: OrganizationId, batch: ImportBatchId, drafts: Vec<RecordDraft>) -> Self {
        Self {
            organization,
            batch,
            cycle: None,
            mode: MatchMode::default(),
            drafts,
        }
    }

    pub fn with_cycle(mut self, cycle: CycleId) -> Self {
        self.cycle = Some(cycle);
        self
    }

    pub fn with_mode(mut self, mode: MatchMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Main API for reconciliation
pub struct Bluesky {
    config: BlueskyConfig,
    ontology: Arc<Ontology>,
    policy: Arc<MergePolicy>,
    partitions: Partitions,
    /// Owner of every batch and cycle, for tenant checks before locking
    batches: DashMap<ImportBatchId, OrganizationId>,
    cycles: DashMap<CycleId, OrganizationId>,
    hash_pool: Option<rayon::ThreadPool>,
}

impl Bluesky {
    pub fn new(config: BlueskyConfig) -> Result<Self> {
        let ontology = Arc::new(Ontology::from_config(&config.matching)?);
        let policy = Arc::new(MergePolicy::from_config(&config.merge)?);
        let hash_pool = match config.ingest.hash_workers {
            0 => None,
            workers => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .thread_name(|index| format!("bluesky-hash-{}", index))
                    .build()
                    .map_err(|e| BlueskyError::Config(e.to_string()))?,
            ),
        };
        Ok(Self {
            partitions: Partitions::new(Arc::clone(&ontology), Arc::clone(&policy)),
            config,
            ontology,
            policy,
            batches: DashMap::new(),
            cycles: DashMap::new(),
            hash_pool,
        })
    }

    pub fn config(&self) -> &BlueskyConfig {
        &self.config
    }

    pub fn ontology(&self) -> &Ontology {
        &self.ontology
    }

    pub fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    pub fn organizations(&self) -> Vec<OrganizationId> {
        self.partitions.organizations()
    }

    pub fn open_batch(&self, organization: OrganizationId, name: &str) -> Result<ImportBatchId> {
        let partition = self.partitions.get(organization);
        let batch = partition.lock().open_batch(name)?;
        self.batches.insert(batch, organization);
        Ok(batch)
    }

    pub fn create_cycle(
        &self,
        organization: OrganizationId,
        name: &str,
        period: Interval,
    ) -> Result<CycleId> {
        let partition = self.partitions.get(organization);
        let cycle = partition.lock().create_cycle(name, period)?;
        self.cycles.insert(cycle, organization);
        Ok(cycle)
    }

    pub fn cycle_by_name(&self, organization: OrganizationId, name: &str) -> Option<Cycle> {
        self.read(organization, |store| store.cycle_by_name(name).cloned())
            .flatten()
    }

    /// Reconcile one batch.
    ///
    /// Drafts are validated and fingerprinted in parallel before the
    /// organization's lock is taken. Invalid drafts become row failures.
    pub fn ingest(&self, request: BatchRequest) -> Result<BatchReport> {
        let BatchRequest {
            organization,
            batch,
            cycle,
            mode,
            drafts,
        } = request;
        self.check_batch(batch, organization)?;
        if let Some(cycle) = cycle {
            self.check_cycle(cycle, organization)?;
        }

        let total = drafts.len();
        let sealed = match &self.hash_pool {
            Some(pool) => pool.install(|| seal_all(drafts, Some(organization))),
            None => seal_all(drafts, Some(organization)),
        };
        let mut rows = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for (row, result) in sealed.into_iter().enumerate() {
            match result {
                Ok(sealed) => rows.push((row, sealed)),
                Err(error) => {
                    warn!(%organization, %batch, row, %error, "rejected draft");
                    failures.push(RowFailure { row, error });
                }
            }
        }

        let partition = self.partitions.get(organization);
        let mut report = partition.lock().process_batch(batch, rows, mode, cycle)?;
        report.rows = total;
        report.add_failures(failures);
        Ok(report)
    }

    /// Reconcile many batches; organizations run in parallel, results keep
    /// request order.
    pub fn ingest_many(&self, requests: Vec<BatchRequest>) -> Vec<Result<BatchReport>> {
        requests
            .into_par_iter()
            .map(|request| self.ingest(request))
            .collect()
    }

    pub fn promote(
        &self,
        organization: OrganizationId,
        record: RecordId,
        cycle: CycleId,
    ) -> Result<Promotion> {
        self.check_cycle(cycle, organization)?;
        let partition = self
            .partitions
            .existing(organization)
            .ok_or(BlueskyError::UnknownRecord(record))?;
        let mut partition = partition.lock();
        partition.promote(record, cycle)
    }

    pub fn record(&self, organization: OrganizationId, id: RecordId) -> Option<Record> {
        self.read(organization, |store| store.record(id).cloned())
            .flatten()
    }

    pub fn entity(&self, organization: OrganizationId, id: EntityId) -> Option<CanonicalEntity> {
        self.read(organization, |store| store.entity(id).cloned())
            .flatten()
    }

    pub fn view(&self, organization: OrganizationId, id: ViewId) -> Option<View> {
        self.read(organization, |store| store.view(id).cloned())
            .flatten()
    }

    pub fn view_for(
        &self,
        organization: OrganizationId,
        entity: EntityId,
        cycle: CycleId,
    ) -> Option<View> {
        self.read(organization, |store| store.view_for(entity, cycle).cloned())
            .flatten()
    }

    pub fn views_for_cycle(&self, organization: OrganizationId, cycle: CycleId) -> Vec<View> {
        self.read(organization, |store| {
            store.views_for_cycle(cycle).into_iter().cloned().collect()
        })
        .unwrap_or_default()
    }

    pub fn entities(&self, organization: OrganizationId) -> Vec<CanonicalEntity> {
        self.read(organization, |store| {
            store.entities().into_iter().cloned().collect()
        })
        .unwrap_or_default()
    }

    pub fn records_for_batch(&self, organization: OrganizationId, batch: ImportBatchId) -> Vec<Record> {
        self.read(organization, |store| {
            store.records_for_batch(batch).into_iter().cloned().collect()
        })
        .unwrap_or_default()
    }

    pub fn canonical_records(&self, organization: OrganizationId, kind: EntityKind) -> Vec<Record> {
        self.read(organization, |store| {
            store.canonical_records(kind).into_iter().cloned().collect()
        })
        .unwrap_or_default()
    }

    pub fn unmatched_records(
        &self,
        organization: OrganizationId,
        batch: ImportBatchId,
        kind: EntityKind,
    ) -> Vec<Record> {
        self.read(organization, |store| {
            store
                .unmatched_records(batch, kind)
                .into_iter()
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn ancestors(&self, organization: OrganizationId, record: RecordId) -> Vec<Record> {
        self.read(organization, |store| {
            store.ancestors(record).into_iter().cloned().collect()
        })
        .unwrap_or_default()
    }

    /// Run `f` against an organization's store under its lock.
    pub fn read<R>(&self, organization: OrganizationId, f: impl FnOnce(&Store) -> R) -> Option<R> {
        let partition = self.partitions.existing(organization)?;
        let partition = partition.lock();
        Some(f(partition.store()))
    }

    fn check_batch(&self, batch: ImportBatchId, organization: OrganizationId) -> Result<()> {
        let owner = self
            .batches
            .get(&batch)
            .map(|entry| *entry.value())
            .ok_or(BlueskyError::UnknownBatch(batch))?;
        same_tenant(batch.to_string(), organization, owner)
    }

    fn check_cycle(&self, cycle: CycleId, organization: OrganizationId) -> Result<()> {
        let owner = self
            .cycles
            .get(&cycle)
            .map(|entry| *entry.value())
            .ok_or(BlueskyError::UnknownCycle(cycle))?;
        same_tenant(cycle.to_string(), organization, owner)
    }
}

fn same_tenant(subject: String, expected: OrganizationId, found: OrganizationId) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(BlueskyError::CrossTenant {
            subject,
            expected,
            found,
        })
    }
}
