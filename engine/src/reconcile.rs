//! Merging remote-origin state into local records.
//!
//! Remote state never overwrites unconfirmed local edits:
//!
//! 1. A bean with a pending local delete ignores remote updates.
//! 2. Protected fields keep their local value, or their local absence. The
//!    stored copy protects its saved-but-unconfirmed fields; a held handle
//!    additionally protects its unsaved ones.
//! 3. A dirty bean is not removed by a remote delete; its pending upsert will
//!    recreate it remotely.
//!
//! The functions here are pure. The coordinator takes the locks, applies the
//! returned decision to the store and to held handles, and emits events.

use crate::record::{BeanBody, FieldKey};
use crate::remote::AttributeSnapshot;
use crate::BeanRecord;
use std::collections::BTreeSet;

/// Why a remote change left local state alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepReason {
    /// The bean is being deleted locally
    PendingDelete,
    /// The bean carries unconfirmed local edits
    Dirty,
    /// The remote state matches the local copy
    Unchanged,
    /// There is no local copy to delete
    Missing,
}

/// Outcome of merging one remote change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Merge {
    /// Store this record as the new canonical copy
    Store(BeanRecord),
    /// Remove the local copy
    Remove,
    Keep(KeepReason),
}

/// Decide how a remote update applies to the stored copy, if any.
pub fn merge_update(
    local: Option<&BeanRecord>,
    snapshot: &AttributeSnapshot,
    protected: &BTreeSet<FieldKey>,
    pending_delete: bool,
) -> Merge {
    if pending_delete {
        return Merge::Keep(KeepReason::PendingDelete);
    }

    let Some(local) = local else {
        let body = match &snapshot.data {
            Some(data) => BeanBody::Hydrated(data.clone()),
            None => BeanBody::Proxy,
        };
        let mut record = BeanRecord::from_cloud(&snapshot.channel, &snapshot.id, body);
        record.readonly = snapshot.readonly;
        return Merge::Store(record);
    };

    let mut merged = local.clone();
    if !apply_snapshot(&mut merged, snapshot, protected) {
        return Merge::Keep(KeepReason::Unchanged);
    }
    Merge::Store(merged)
}

/// Decide how a remote delete applies to the stored copy.
///
/// `held_dirty` reports unsaved edits on a handle the caller holds.
pub fn merge_delete(local: Option<&BeanRecord>, held_dirty: bool) -> Merge {
    match local {
        None => Merge::Keep(KeepReason::Missing),
        Some(record) if record.is_dirty || record.is_new || held_dirty => {
            Merge::Keep(KeepReason::Dirty)
        }
        Some(_) => Merge::Remove,
    }
}

/// Apply remote state to a record in place, keeping protected fields.
/// Returns whether anything changed.
///
/// A snapshot without data only updates the readonly flag; it never turns a
/// hydrated record back into a proxy.
pub fn apply_snapshot(
    record: &mut BeanRecord,
    snapshot: &AttributeSnapshot,
    protected: &BTreeSet<FieldKey>,
) -> bool {
    let before = record.clone();

    if let Some(incoming) = &snapshot.data {
        match &mut record.body {
            BeanBody::Hydrated(data) => data.merge_from(incoming, protected),
            BeanBody::Proxy => record.body = BeanBody::Hydrated(incoming.clone()),
        }
    }
    record.readonly = snapshot.readonly;
    if record.cloud_id.is_none() {
        record.cloud_id = Some(snapshot.id.clone());
    }

    *record != before
}
