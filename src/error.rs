//! # Error Module
//!
//! Named error kinds surfaced by the reconciliation engine. Every error is
//! scoped to one record or one batch; nothing here is fatal to the process.

use crate::model::{
    CycleId, EntityId, EntityKind, Field, Fingerprint, ImportBatchId, OrganizationId, RecordId,
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BlueskyError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BlueskyError {
    #[error("record has no owning organization")]
    MissingOrganization,

    #[error("record belongs to {found} but the batch belongs to {expected}")]
    OrganizationMismatch {
        expected: OrganizationId,
        found: OrganizationId,
    },

    #[error("record has no fields and no extra data")]
    EmptyRecord,

    #[error("field `{field}` is not part of the {kind} schema")]
    FieldNotInSchema { field: Field, kind: EntityKind },

    #[error("value for `{key}` is not a finite number")]
    NonFiniteNumber { key: String },

    #[error("record duplicates existing record {existing} (hash {hash})")]
    DuplicateData {
        existing: RecordId,
        hash: Fingerprint,
    },

    #[error("unknown record {0}")]
    UnknownRecord(RecordId),

    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),

    #[error("unknown cycle {0}")]
    UnknownCycle(CycleId),

    #[error("unknown import batch {0}")]
    UnknownBatch(ImportBatchId),

    #[error("{subject} belongs to {found}, not {expected}")]
    CrossTenant {
        subject: String,
        expected: OrganizationId,
        found: OrganizationId,
    },

    #[error("record {0} is not bound to a canonical entity")]
    UnboundRecord(RecordId),

    #[error("cycle `{name}` already exists in {organization}")]
    DuplicateCycle {
        organization: OrganizationId,
        name: String,
    },

    #[error("invalid cycle period: {0}")]
    InvalidPeriod(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BlueskyError {
    /// True for errors raised by draft validation, before any hashing.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MissingOrganization
                | Self::OrganizationMismatch { .. }
                | Self::EmptyRecord
                | Self::FieldNotInSchema { .. }
                | Self::NonFiniteNumber { .. }
        )
    }
}
