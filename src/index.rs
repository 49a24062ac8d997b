//! # Index Module
//!
//! The match pool: one organization's canonical entity heads, indexed by
//! identity key and by content fingerprint.

use crate::error::{BlueskyError, Result};
use crate::model::{EntityId, EntityKind, Fingerprint, OrganizationId, Record, RecordId};
use crate::ontology::{IdentityKey, Ontology};
use hashbrown::HashMap;
use std::collections::BTreeSet;

/// Snapshot of an entity head as seen by the matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    pub entity: EntityId,
    pub record: RecordId,
    pub organization: OrganizationId,
    pub kind: EntityKind,
    pub hash: Fingerprint,
    keys: Vec<IdentityKey>,
}

impl PoolEntry {
    pub fn keys(&self) -> &[IdentityKey] {
        &self.keys
    }
}

/// Index for identity key and fingerprint lookups over entity heads
#[derive(Debug, Clone)]
pub struct MatchPool {
    organization: OrganizationId,
    /// entity -> current head
    heads: HashMap<EntityId, PoolEntry>,
    /// identity key -> entities whose head carries it
    by_key: HashMap<IdentityKey, BTreeSet<EntityId>>,
    /// (kind, fingerprint) -> entities whose head has that content
    by_hash: HashMap<(EntityKind, Fingerprint), BTreeSet<EntityId>>,
}

impl MatchPool {
    pub fn new(organization: OrganizationId) -> Self {
        Self {
            organization,
            heads: HashMap::new(),
            by_key: HashMap::new(),
            by_hash: HashMap::new(),
        }
    }

    pub fn organization(&self) -> OrganizationId {
        self.organization
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Make `head` the record standing for `entity`, replacing any previous head.
    pub fn insert(&mut self, entity: EntityId, head: &Record, ontology: &Ontology) -> Result<()> {
        if head.organization != self.organization {
            return Err(BlueskyError::CrossTenant {
                subject: head.id.to_string(),
                expected: self.organization,
                found: head.organization,
            });
        }
        self.remove(entity);

        let keys = ontology.identity_keys(head);
        for key in &keys {
            self.by_key.entry(key.clone()).or_default().insert(entity);
        }
        self.by_hash
            .entry((head.kind, head.hash().clone()))
            .or_default()
            .insert(entity);
        self.heads.insert(
            entity,
            PoolEntry {
                entity,
                record: head.id,
                organization: head.organization,
                kind: head.kind,
                hash: head.hash().clone(),
                keys,
            },
        );
        Ok(())
    }

    /// Drop an entity from the pool; returns its last head.
    pub fn remove(&mut self, entity: EntityId) -> Option<PoolEntry> {
        let entry = self.heads.remove(&entity)?;
        for key in &entry.keys {
            if let Some(entities) = self.by_key.get_mut(key) {
                entities.remove(&entity);
                if entities.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        let hash_key = (entry.kind, entry.hash.clone());
        if let Some(entities) = self.by_hash.get_mut(&hash_key) {
            entities.remove(&entity);
            if entities.is_empty() {
                self.by_hash.remove(&hash_key);
            }
        }
        Some(entry)
    }

    pub fn head(&self, entity: EntityId) -> Option<&PoolEntry> {
        self.heads.get(&entity)
    }

    /// Heads carrying `key`, in entity order
    pub fn find_by_key(&self, key: &IdentityKey) -> Vec<&PoolEntry> {
        self.collect(self.by_key.get(key))
    }

    /// Heads of `kind` whose content fingerprint is `hash`, in entity order
    pub fn find_by_hash(&self, kind: EntityKind, hash: &Fingerprint) -> Vec<&PoolEntry> {
        self.collect(self.by_hash.get(&(kind, hash.clone())))
    }

    fn collect(&self, entities: Option<&BTreeSet<EntityId>>) -> Vec<&PoolEntry> {
        entities
            .map(|entities| {
                entities
                    .iter()
                    .filter_map(|entity| self.heads.get(entity))
                    .collect()
            })
            .unwrap_or_default()
    }
}
