//! # Canonical Hasher
//!
//! Deterministic fingerprints of record content. Bookkeeping such as the
//! organization, import batch, lifecycle states and source type never enters
//! the digest, so identical content from different provenance collides on
//! purpose.
//!
//! ## Canonical stream
//!
//! ```text
//! "bluesky.content.v1" 0x00
//! 'F' len(name) name len(value) value      -- schema fields, declaration order
//! 'X' len(key)  key  len(value) value      -- extra_data, sorted by key
//! ```
//!
//! Lengths are little-endian `u64`, so no pair can be confused with its
//! neighbours. The SHA-256 digest is truncated to 16 bytes and hex encoded.

use crate::error::{BlueskyError, Result};
use crate::model::{
    FieldValue, Fingerprint, OrganizationId, Record, RecordContent, RecordDraft, SealedDraft,
};
use rayon::prelude::*;
use sha2::{Digest, Sha256};

/// Length of every fingerprint in characters.
pub const FINGERPRINT_LEN: usize = 32;

const STREAM_VERSION: &[u8] = b"bluesky.content.v1\x00";

/// Fingerprint the semantic content of a record.
pub fn fingerprint(content: &RecordContent) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(STREAM_VERSION);

    for (field, value) in &content.fields {
        push_pair(&mut hasher, b'F', field.name(), value);
    }
    // BTreeMap iteration is key-sorted; insertion order is irrelevant.
    for (key, value) in &content.extra_data {
        push_pair(&mut hasher, b'X', key, value);
    }

    let digest = hasher.finalize();
    Fingerprint::from_hex(hex::encode(&digest[..FINGERPRINT_LEN / 2]))
}

#[inline]
fn push_pair(hasher: &mut Sha256, tag: u8, key: &str, value: &FieldValue) {
    if value.is_empty() {
        return;
    }
    let value = value.canonical();
    hasher.update([tag]);
    hasher.update((key.len() as u64).to_le_bytes());
    hasher.update(key.as_bytes());
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

/// Two records are the same snapshot when their content fingerprints agree.
pub fn same_content(a: &Record, b: &Record) -> bool {
    a.hash() == b.hash()
}

/// Reject drafts that must never be fingerprinted.
///
/// When `expected` is given, the draft must belong to that organization.
pub fn validate(draft: &RecordDraft, expected: Option<OrganizationId>) -> Result<OrganizationId> {
    let organization = draft
        .organization
        .ok_or(BlueskyError::MissingOrganization)?;
    if let Some(expected) = expected {
        if expected != organization {
            return Err(BlueskyError::OrganizationMismatch {
                expected,
                found: organization,
            });
        }
    }
    if draft.content.is_empty() {
        return Err(BlueskyError::EmptyRecord);
    }
    for (field, value) in &draft.content.fields {
        if !field.applies_to(draft.kind) {
            return Err(BlueskyError::FieldNotInSchema {
                field: *field,
                kind: draft.kind,
            });
        }
        check_finite(field.name(), value)?;
    }
    for (key, value) in &draft.content.extra_data {
        check_finite(key, value)?;
    }
    // Blank values never reach the digest, so all-blank content is empty.
    let blank = draft
        .content
        .fields
        .values()
        .chain(draft.content.extra_data.values())
        .all(FieldValue::is_empty);
    if blank {
        return Err(BlueskyError::EmptyRecord);
    }
    Ok(organization)
}

fn check_finite(key: &str, value: &FieldValue) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(BlueskyError::NonFiniteNumber {
            key: key.to_string(),
        })
    }
}

/// Validate and fingerprint one draft.
pub fn seal(draft: RecordDraft, expected: Option<OrganizationId>) -> Result<SealedDraft> {
    let organization = validate(&draft, expected)?;
    let hash = fingerprint(&draft.content);
    Ok(SealedDraft {
        organization,
        import_batch: draft.import_batch,
        kind: draft.kind,
        source_type: draft.source_type,
        content: draft.content,
        hash,
    })
}

/// Fingerprint many drafts in parallel without validating them.
pub fn fingerprint_all(drafts: &[RecordDraft]) -> Vec<Fingerprint> {
    drafts
        .par_iter()
        .map(|draft| fingerprint(&draft.content))
        .collect()
}

/// Seal a batch of drafts in parallel. Output order matches input order.
pub fn seal_all(
    drafts: Vec<RecordDraft>,
    expected: Option<OrganizationId>,
) -> Vec<Result<SealedDraft>> {
    drafts
        .into_par_iter()
        .map(|draft| seal(draft, expected))
        .collect()
}
