//! Shared handles to managed beans.
//!
//! A [`Bean`] is what callers hold and edit. Clones share one record behind a
//! mutex, so writes from several threads are serialized and none is lost.
//! Edits live only in the handle until they are routed through
//! [`SyncCoordinator::save`](crate::SyncCoordinator::save).

use crate::error::{Error, Result};
use crate::{BeanId, BeanKey, BeanList, BeanListEntry, BeanRecord, Channel};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Observable lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeanState {
    /// Created on this device and never confirmed by the cloud
    New,
    /// Carries local edits the cloud has not confirmed
    Dirty,
    Synced,
    /// A save is waiting on the remote
    Saving,
    /// A delete is waiting on the remote
    Deleting,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Live,
    Saving,
    Deleting,
    Deleted,
}

#[derive(Debug)]
pub(crate) struct BeanInner {
    pub(crate) record: BeanRecord,
    pub(crate) lifecycle: Lifecycle,
    /// Bumped by every mutation that changed the record
    pub(crate) edit_gen: u64,
    /// `edit_gen` as of the last local save
    pub(crate) saved_gen: u64,
}

impl BeanInner {
    /// Fail unless the handle still refers to a live bean.
    pub(crate) fn ensure_live(&self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Deleted | Lifecycle::Deleting => Err(Error::not_found(
                &self.record.channel,
                &self.record.local_id,
            )),
            Lifecycle::Live | Lifecycle::Saving => Ok(()),
        }
    }

    /// Whether edits were made since the last local save.
    pub(crate) fn has_unsaved_edits(&self) -> bool {
        self.edit_gen != self.saved_gen
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.lifecycle = Lifecycle::Deleted;
    }

    pub(crate) fn state(&self) -> BeanState {
        match self.lifecycle {
            Lifecycle::Deleted => BeanState::Deleted,
            Lifecycle::Deleting => BeanState::Deleting,
            Lifecycle::Saving => BeanState::Saving,
            Lifecycle::Live if self.record.is_new => BeanState::New,
            Lifecycle::Live if self.record.is_dirty => BeanState::Dirty,
            Lifecycle::Live => BeanState::Synced,
        }
    }
}

#[derive(Debug)]
pub(crate) struct BeanCell {
    inner: Mutex<BeanInner>,
}

/// A shared handle to one bean.
#[derive(Debug, Clone)]
pub struct Bean {
    cell: Arc<BeanCell>,
}

impl Bean {
    pub(crate) fn from_record(record: BeanRecord) -> Self {
        Self {
            cell: Arc::new(BeanCell {
                inner: Mutex::new(BeanInner {
                    record,
                    lifecycle: Lifecycle::Live,
                    edit_gen: 0,
                    saved_gen: 0,
                }),
            }),
        }
    }

    pub(crate) fn from_cell(cell: Arc<BeanCell>) -> Self {
        Self { cell }
    }

    pub(crate) fn downgrade(&self) -> Weak<BeanCell> {
        Arc::downgrade(&self.cell)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BeanInner> {
        self.cell.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wrap a record that no coordinator handed out. Mutations on an
    /// uninitialized record fail with `NotInitialized`.
    pub fn detached(record: BeanRecord) -> Self {
        Self::from_record(record)
    }

    /// Whether both handles share one record.
    pub fn ptr_eq(&self, other: &Bean) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    // ------------------------------------------------------------------
    // Identity and flags
    // ------------------------------------------------------------------

    pub fn key(&self) -> BeanKey {
        self.lock().record.key()
    }

    pub fn channel(&self) -> Channel {
        self.lock().record.channel.clone()
    }

    pub fn id(&self) -> BeanId {
        self.lock().record.local_id.clone()
    }

    pub fn cloud_id(&self) -> Option<BeanId> {
        self.lock().record.cloud_id.clone()
    }

    pub fn is_new(&self) -> bool {
        self.lock().record.is_new
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().record.is_dirty
    }

    pub fn is_proxy(&self) -> bool {
        self.lock().record.is_proxy()
    }

    pub fn is_readonly(&self) -> bool {
        self.lock().record.readonly
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().record.is_initialized()
    }

    pub fn is_created_on_device(&self) -> bool {
        self.lock().record.is_created_on_device()
    }

    pub fn state(&self) -> BeanState {
        self.lock().state()
    }

    /// A copy of the handle's current record, unsaved edits included.
    pub fn snapshot(&self) -> BeanRecord {
        self.lock().record.clone()
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get_value(&self, path: &str) -> Result<Option<String>> {
        self.lock().record.get_value(path)
    }

    pub fn get_binary_value(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.lock().record.get_binary_value(path)
    }

    pub fn read_list(&self, property: &str) -> BeanList {
        self.lock().record.read_list(property)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub fn set_value(&self, path: &str, value: impl Into<String>) -> Result<()> {
        self.mutate(|record| Ok(((), record.set_value(path, value)?)))
    }

    pub fn set_binary_value(&self, path: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        self.mutate(|record| Ok(((), record.set_binary_value(path, value)?)))
    }

    /// Replace a list property; `None` or an empty list clears it.
    pub fn save_list(&self, property: &str, list: Option<BeanList>) -> Result<()> {
        self.mutate(|record| Ok(((), record.save_list(property, list)?)))
    }

    pub fn clear_list(&self, property: &str) -> Result<()> {
        self.mutate(|record| Ok(((), record.clear_list(property)?)))
    }

    pub fn add_bean(&self, property: &str, entry: BeanListEntry) -> Result<()> {
        self.mutate(|record| Ok(((), record.add_bean(property, entry)?)))
    }

    pub fn remove_bean(&self, property: &str, index: usize) -> Result<BeanListEntry> {
        self.mutate(|record| Ok((record.remove_bean(property, index)?, true)))
    }

    /// Run a record mutation; `f` reports whether it changed anything.
    fn mutate<T>(&self, f: impl FnOnce(&mut BeanRecord) -> Result<(T, bool)>) -> Result<T> {
        let mut inner = self.lock();
        inner.ensure_live()?;
        inner.record.validate()?;
        let (out, changed) = f(&mut inner.record)?;
        if changed {
            inner.edit_gen += 1;
        }
        Ok(out)
    }
}
