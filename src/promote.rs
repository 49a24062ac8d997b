//! # Promoter / Cycle Binder
//!
//! Binds a matched record to a reporting cycle through the single view of its
//! entity for that cycle.

use crate::error::{BlueskyError, Result};
use crate::model::{CycleId, DataState, RecordId, View};
use crate::store::RecordStore;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What promotion did to the (entity, cycle) view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ViewChange {
    Created,
    /// The view already pointed at this record
    Unchanged,
    /// The view was moved off `previous`
    Rebound { previous: RecordId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    pub view: View,
    pub change: ViewChange,
}

/// Promote `record` into `cycle`.
///
/// Idempotent: promoting the same record again is `Unchanged`, a different
/// record of the same entity rebinds the existing view in place.
pub fn promote<S>(store: &mut S, record: RecordId, cycle: CycleId) -> Result<Promotion>
where
    S: RecordStore + ?Sized,
{
    let organization = store.organization();
    let target = store
        .record(record)
        .ok_or(BlueskyError::UnknownRecord(record))?;
    let cycle_org = store
        .cycle(cycle)
        .ok_or(BlueskyError::UnknownCycle(cycle))?
        .organization;

    for (subject, found) in [
        (record.to_string(), target.organization),
        (cycle.to_string(), cycle_org),
    ] {
        if found != organization {
            return Err(BlueskyError::CrossTenant {
                subject,
                expected: organization,
                found,
            });
        }
    }
    let entity = target.entity.ok_or(BlueskyError::UnboundRecord(record))?;

    let (view, change) = store.bind_view(entity, cycle, record)?;
    if let Some(target) = store.record_mut(record) {
        target.data_state = DataState::Matched;
    }
    debug!(record = %record, cycle = %cycle, view = %view.id, ?change, "promoted");
    Ok(Promotion { view, change })
}
