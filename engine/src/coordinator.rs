//! SyncCoordinator - the bean lifecycle state machine.
//!
//! The coordinator is the only component that talks to the remote service. It
//! hands out [`Bean`] handles, routes saves and deletes through the
//! [`LocalStore`] and the change log, and merges remote-origin state with
//! dirty precedence.
//!
//! # Locking
//!
//! Every operation on one bean takes that bean's key lock first and the
//! handle's mutex second. Local durability always happens before the remote
//! is contacted, and the key lock is held across the remote round trip, so
//! a background sync and a foreground save of the same bean never interleave.
//!
//! # Sync modes
//!
//! With [`SyncMode::Immediate`] `save` and `delete` push to the remote right
//! after the local write. A transient failure is absorbed and reported as
//! [`SyncStatus::Pending`]; a conflict is returned as an error. With
//! [`SyncMode::Deferred`] both return after the local write and leave the
//! remote work to [`SyncCoordinator::sync_pending`].

use crate::bean::{Bean, BeanCell, Lifecycle};
use crate::changelog::{ChangeEntry, ChangeOp};
use crate::error::{Error, Result};
use crate::notify::{ChangeEvent, ChangeKind, NoopNotifier, Notifier};
use crate::query::{Criteria, Query, QueryMode};
use crate::reconcile::{self, Merge};
use crate::record::FieldKey;
use crate::remote::{AttributeSnapshot, RemoteError, RemoteService};
use crate::store::{now_millis, LocalStore};
use crate::{BeanBody, BeanKey, BeanRecord, Revision};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use uuid::Uuid;

/// When `save` and `delete` contact the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Push right after the local write
    #[default]
    Immediate,
    /// Return after the local write; the background worker pushes
    Deferred,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordinatorConfig {
    pub sync_mode: SyncMode,
}

/// Outcome of a save or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Nothing to save
    Unchanged,
    /// Durable locally and confirmed by the remote
    Synced,
    /// Durable locally, remote confirmation outstanding
    Pending,
}

/// Counts from one pass over the change log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub synced: usize,
    pub pending: usize,
    pub conflicts: usize,
}

impl SyncReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Handles split by hydration state.
#[derive(Debug, Default)]
pub struct ProxyPartition {
    pub hydrated: Vec<Bean>,
    pub proxies: Vec<Bean>,
}

pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteService>,
    notifier: Arc<dyn Notifier>,
    config: CoordinatorConfig,
    /// Handles currently held by callers
    live: DashMap<BeanKey, Weak<BeanCell>>,
    locks: DashMap<BeanKey, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("live", &self.live.len())
            .finish()
    }
}

impl SyncCoordinator {
    pub fn new(store: Arc<LocalStore>, remote: Arc<dyn RemoteService>) -> Self {
        Self {
            store,
            remote,
            notifier: Arc::new(NoopNotifier),
            config: CoordinatorConfig::default(),
            live: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // =========================================================================
    // Instances and reads
    // =========================================================================

    /// A new bean with a generated id. Nothing is stored until it is saved.
    pub fn new_instance(&self, channel: &str) -> Result<Bean> {
        self.new_instance_with_id(channel, &Uuid::new_v4().to_string())
    }

    /// A new bean with a caller-chosen id.
    pub fn new_instance_with_id(&self, channel: &str, id: &str) -> Result<Bean> {
        let record = BeanRecord::new(channel, id);
        record.validate()?;
        let key = record.key();

        let lock = self.key_lock(&key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if self.store.is_pending_delete(&key) {
            return Err(Error::PendingDelete {
                channel: key.channel,
                id: key.id,
            });
        }
        let held_live = self
            .held(&key)
            .is_some_and(|bean| bean.lock().lifecycle != Lifecycle::Deleted);
        if held_live || self.store.contains(channel, id) {
            return Err(Error::BeanAlreadyExists {
                channel: key.channel,
                id: key.id,
            });
        }

        let bean = Bean::from_record(record);
        self.live.insert(key.clone(), bean.downgrade());
        tracing::debug!(channel = %key.channel, id = %key.id, "Created bean");
        Ok(bean)
    }

    /// The stored bean with this id, hydrating it if it is a proxy.
    ///
    /// When the remote cannot be reached the proxy is returned unhydrated.
    pub fn read_by_id(&self, channel: &str, id: &str) -> Result<Bean> {
        let record = self.store.read_by_id(channel, id)?;
        let bean = self.handle_for(record);
        if bean.is_proxy() {
            match self.hydrate(&bean) {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        channel = %channel,
                        id = %id,
                        error = %e,
                        "Could not hydrate proxy"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(bean)
    }

    /// Every bean of a booted channel in insertion order, proxies included.
    pub fn read_all(&self, channel: &str) -> Result<Vec<Bean>> {
        self.store.ensure_booted(channel)?;
        Ok(self
            .store
            .read_all(channel)
            .into_iter()
            .map(|record| self.handle_for(record))
            .collect())
    }

    /// Split handles into hydrated beans and proxies, keeping order.
    pub fn filter_proxies(beans: impl IntoIterator<Item = Bean>) -> ProxyPartition {
        let mut partition = ProxyPartition::default();
        for bean in beans {
            if bean.is_proxy() {
                partition.proxies.push(bean);
            } else {
                partition.hydrated.push(bean);
            }
        }
        partition
    }

    /// Load a proxy's data from the remote.
    pub fn hydrate(&self, bean: &Bean) -> Result<()> {
        if !bean.is_proxy() {
            return Ok(());
        }
        let key = bean.key();
        let lock = self.key_lock(&key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let remote_id = {
            let inner = bean.lock();
            inner.ensure_live()?;
            if !inner.record.is_proxy() {
                return Ok(());
            }
            inner.record.remote_id().to_string()
        };

        let snapshot = self
            .remote
            .pull(&key.channel, &remote_id)
            .map_err(Error::from)?;

        let Some(snapshot) = snapshot else {
            self.store.remove(&key.channel, &key.id)?;
            bean.lock().mark_deleted();
            self.notifier
                .notify(ChangeEvent::new(&key, ChangeKind::Deleted));
            return Err(Error::not_found(&key.channel, &key.id));
        };
        if snapshot.data.is_none() {
            return Err(Error::ProxyNotHydrated {
                channel: key.channel,
                id: key.id,
            });
        }

        let mut record = self.store.read_by_id(&key.channel, &key.id)?;
        let protected = record.dirty_fields.clone();
        reconcile::apply_snapshot(&mut record, &snapshot, &protected);
        self.store.put(record.clone())?;
        bean.lock().record = record;

        tracing::debug!(channel = %key.channel, id = %key.id, "Hydrated proxy");
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Stored beans of a booted channel matching the criteria. Unsaved edits
    /// on held handles are not considered.
    pub fn query(&self, channel: &str, mode: QueryMode, criteria: Criteria) -> Result<Vec<Bean>> {
        let query = Query::new(mode, criteria);
        Ok(self
            .store
            .query(channel, &query)?
            .into_iter()
            .map(|record| self.handle_for(record))
            .collect())
    }

    pub fn query_by_equals_all(&self, channel: &str, criteria: Criteria) -> Result<Vec<Bean>> {
        self.query(channel, QueryMode::EqualsAll, criteria)
    }

    pub fn query_by_equals_at_least_one(
        &self,
        channel: &str,
        criteria: Criteria,
    ) -> Result<Vec<Bean>> {
        self.query(channel, QueryMode::EqualsAtLeastOne, criteria)
    }

    pub fn query_by_not_equals_all(&self, channel: &str, criteria: Criteria) -> Result<Vec<Bean>> {
        self.query(channel, QueryMode::NotEqualsAll, criteria)
    }

    pub fn query_by_not_equals_at_least_one(
        &self,
        channel: &str,
        criteria: Criteria,
    ) -> Result<Vec<Bean>> {
        self.query(channel, QueryMode::NotEqualsAtLeastOne, criteria)
    }

    pub fn query_by_contains_all(&self, channel: &str, criteria: Criteria) -> Result<Vec<Bean>> {
        self.query(channel, QueryMode::ContainsAll, criteria)
    }

    pub fn query_by_contains_at_least_one(
        &self,
        channel: &str,
        criteria: Criteria,
    ) -> Result<Vec<Bean>> {
        self.query(channel, QueryMode::ContainsAtLeastOne, criteria)
    }

    // =========================================================================
    // Save / delete / refresh
    // =========================================================================

    /// Persist the handle's edits locally, then (in immediate mode) push them.
    pub fn save(&self, bean: &Bean) -> Result<SyncStatus> {
        let key = bean.key();
        let lock = self.key_lock(&key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let revision = {
            let mut inner = bean.lock();
            inner.ensure_live()?;
            inner.record.validate()?;
            if inner.record.readonly {
                return Err(Error::ReadOnlyViolation {
                    channel: key.channel,
                    id: key.id,
                });
            }
            if !inner.record.is_dirty && !inner.record.is_new {
                return Ok(SyncStatus::Unchanged);
            }
            if self.store.is_pending_delete(&key) {
                return Err(Error::PendingDelete {
                    channel: key.channel,
                    id: key.id,
                });
            }

            let mut record = inner.record.clone();
            record.revision += 1;
            let revision = record.revision;
            self.store.put(record)?;
            inner.record.revision = revision;
            self.store
                .enqueue_change(ChangeEntry::upsert(&key, revision, now_millis()))?;

            inner.saved_gen = inner.edit_gen;
            if self.config.sync_mode == SyncMode::Immediate {
                inner.lifecycle = Lifecycle::Saving;
            }
            revision
        };
        self.register(&key, bean);

        tracing::debug!(
            channel = %key.channel,
            id = %key.id,
            revision,
            "Saved bean locally"
        );

        match self.config.sync_mode {
            SyncMode::Deferred => Ok(SyncStatus::Pending),
            SyncMode::Immediate => self.push_upsert(&key, revision),
        }
    }

    /// Remove the bean locally, then (in immediate mode) delete it remotely.
    pub fn delete(&self, bean: &Bean) -> Result<SyncStatus> {
        let key = bean.key();
        let lock = self.key_lock(&key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let (stored, previous) = {
            let mut inner = bean.lock();
            inner.ensure_live()?;
            inner.record.validate()?;
            if inner.record.readonly {
                return Err(Error::ReadOnlyViolation {
                    channel: key.channel,
                    id: key.id,
                });
            }

            let Some(stored) = self.store.get(&key.channel, &key.id) else {
                if inner.record.is_new {
                    inner.mark_deleted();
                    return Ok(SyncStatus::Synced);
                }
                return Err(Error::not_found(&key.channel, &key.id));
            };
            if stored.readonly {
                return Err(Error::ReadOnlyViolation {
                    channel: key.channel,
                    id: key.id,
                });
            }

            let previous = self.store.change(&key);
            if let Some(cloud_id) = &stored.cloud_id {
                self.store.enqueue_change(ChangeEntry::delete(
                    &key,
                    stored.revision,
                    Some(cloud_id.clone()),
                    now_millis(),
                ))?;
            }
            if let Err(e) = self.store.remove(&key.channel, &key.id) {
                self.restore_change(&key, previous);
                return Err(e);
            }

            if stored.cloud_id.is_none() {
                // Never reached the remote; drop its queued upsert.
                self.store.discard_change(&key)?;
                inner.mark_deleted();
            } else {
                inner.lifecycle = Lifecycle::Deleting;
            }
            (stored, previous)
        };

        tracing::debug!(channel = %key.channel, id = %key.id, "Deleted bean locally");

        let Some(cloud_id) = stored.cloud_id.clone() else {
            return Ok(SyncStatus::Synced);
        };
        match self.config.sync_mode {
            SyncMode::Deferred => Ok(SyncStatus::Pending),
            SyncMode::Immediate => match self.push_delete(&key, &cloud_id, stored.revision) {
                Err(err @ Error::RemoteConflict { .. }) => {
                    self.restore_deleted(&key, &cloud_id, Some(stored), previous)?;
                    Err(err)
                }
                status => status,
            },
        }
    }

    /// Discard unsaved edits and reload the handle from the local store.
    ///
    /// Afterwards `is_dirty` is false. Fields saved but not yet confirmed by
    /// the remote stay in `dirty_fields` and keep their sync pending.
    pub fn refresh(&self, bean: &Bean) -> Result<()> {
        let key = bean.key();
        let lock = self.key_lock(&key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut inner = bean.lock();
        inner.ensure_live()?;
        inner.record.validate()?;

        match self.store.get(&key.channel, &key.id) {
            Some(mut record) => {
                record.is_dirty = false;
                inner.record = record;
            }
            None if inner.record.is_new => {
                inner.record = BeanRecord::new(&key.channel, &key.id);
            }
            None => return Err(Error::not_found(&key.channel, &key.id)),
        }
        inner.saved_gen = inner.edit_gen;

        tracing::debug!(channel = %key.channel, id = %key.id, "Refreshed bean");
        Ok(())
    }

    // =========================================================================
    // Remote-origin changes
    // =========================================================================

    /// Initial bulk load of a channel. Dirty local copies keep their edits.
    pub fn boot_channel(&self, channel: &str) -> Result<usize> {
        let snapshots = self.remote.boot_channel(channel).map_err(Error::from)?;
        let count = snapshots.len();
        for snapshot in &snapshots {
            if snapshot.channel != channel {
                tracing::warn!(
                    channel = %channel,
                    other = %snapshot.channel,
                    "Ignoring boot snapshot for another channel"
                );
                continue;
            }
            self.merge_remote(snapshot)?;
        }
        self.store.mark_booted(channel)?;
        tracing::info!(channel = %channel, beans = count, "Booted channel");
        Ok(count)
    }

    /// Apply a remote update. Returns whether local state changed.
    pub fn apply_remote_update(&self, snapshot: &AttributeSnapshot) -> Result<bool> {
        self.merge_remote(snapshot)
    }

    /// Apply a remote delete. Returns whether local state changed.
    pub fn apply_remote_delete(&self, channel: &str, id: &str) -> Result<bool> {
        let key = self.store.resolve_remote_id(channel, id);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let held = self.held_live(&key);

        if self.store.is_pending_delete(&key) {
            // Our own delete is done, whoever issued it.
            self.store.discard_change(&key)?;
            if let Some(bean) = &held {
                bean.lock().mark_deleted();
            }
            tracing::debug!(channel = %key.channel, id = %key.id, "Remote delete matched pending delete");
            return Ok(true);
        }

        let stored = self.store.get(&key.channel, &key.id);
        let held_dirty = held.as_ref().is_some_and(|bean| bean.is_dirty());

        match reconcile::merge_delete(stored.as_ref(), held_dirty) {
            Merge::Remove => {
                self.store.remove(&key.channel, &key.id)?;
                if let Some(bean) = &held {
                    bean.lock().mark_deleted();
                    self.notifier
                        .notify(ChangeEvent::new(&key, ChangeKind::Deleted));
                }
                tracing::debug!(channel = %key.channel, id = %key.id, "Applied remote delete");
                Ok(true)
            }
            Merge::Keep(reason) => {
                tracing::debug!(
                    channel = %key.channel,
                    id = %key.id,
                    ?reason,
                    "Remote delete left bean in place"
                );
                Ok(false)
            }
            Merge::Store(_) => Ok(false),
        }
    }

    fn merge_remote(&self, snapshot: &AttributeSnapshot) -> Result<bool> {
        let key = self.store.resolve_remote_id(&snapshot.channel, &snapshot.id);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let stored = self.store.get(&key.channel, &key.id);
        let held = self.held_live(&key);
        let mut inner = held.as_ref().map(Bean::lock);

        // The stored copy protects its saved-but-unconfirmed fields; a held
        // handle also protects its unsaved ones.
        let stored_protected: BTreeSet<FieldKey> = stored
            .as_ref()
            .map(|record| record.dirty_fields.clone())
            .unwrap_or_default();

        let pending_delete = self.store.is_pending_delete(&key);
        match reconcile::merge_update(stored.as_ref(), snapshot, &stored_protected, pending_delete)
        {
            Merge::Store(record) => {
                self.store.put(record)?;
                if let Some(inner) = inner.as_mut() {
                    let mut protected = stored_protected;
                    protected.extend(inner.record.dirty_fields.iter().cloned());
                    reconcile::apply_snapshot(&mut inner.record, snapshot, &protected);
                }
                drop(inner);
                if held.is_some() {
                    self.notifier
                        .notify(ChangeEvent::new(&key, ChangeKind::Updated));
                }
                tracing::debug!(channel = %key.channel, id = %key.id, "Applied remote update");
                Ok(true)
            }
            Merge::Keep(reason) => {
                tracing::debug!(
                    channel = %key.channel,
                    id = %key.id,
                    ?reason,
                    "Remote update left bean in place"
                );
                Ok(false)
            }
            Merge::Remove => Ok(false),
        }
    }

    // =========================================================================
    // Background sync
    // =========================================================================

    /// Drain the change log once.
    ///
    /// Conflicted entries are skipped until the bean is saved again. After the
    /// first transient failure the remaining entries are left for the next
    /// pass.
    pub fn sync_pending(&self) -> SyncReport {
        let mut report = SyncReport::default();
        let mut offline = false;

        for queued in self.store.pending_changes() {
            if queued.conflicted {
                report.conflicts += 1;
                continue;
            }
            if offline {
                report.pending += 1;
                continue;
            }

            let key = queued.key();
            let lock = self.key_lock(&key);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

            // Re-read: a foreground save may have confirmed or replaced it.
            let Some(entry) = self.store.change(&key) else {
                continue;
            };
            if entry.conflicted {
                report.conflicts += 1;
                continue;
            }

            let result = match (entry.op, &entry.cloud_id) {
                (ChangeOp::Upsert, _) => self.push_upsert(&key, entry.revision),
                (ChangeOp::Delete, Some(cloud_id)) => {
                    match self.push_delete(&key, cloud_id, entry.revision) {
                        Err(err @ Error::RemoteConflict { .. }) => self
                            .restore_deleted(&key, cloud_id, None, None)
                            .and(Err(err)),
                        status => status,
                    }
                }
                (ChangeOp::Delete, None) => self
                    .store
                    .discard_change(&key)
                    .map(|_| SyncStatus::Unchanged),
            };

            match result {
                Ok(SyncStatus::Synced) => report.synced += 1,
                Ok(SyncStatus::Pending) => {
                    report.pending += 1;
                    offline = true;
                }
                Ok(SyncStatus::Unchanged) => {}
                Err(Error::RemoteConflict { .. }) => report.conflicts += 1,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Sync attempt failed");
                    report.pending += 1;
                }
            }
        }

        self.prune_registry();
        if !report.is_idle() {
            tracing::info!(
                synced = report.synced,
                pending = report.pending,
                conflicts = report.conflicts,
                "Sync pass finished"
            );
        }
        report
    }

    /// Changes waiting for the remote, in arrival order.
    pub fn pending(&self) -> Vec<ChangeEntry> {
        self.store.pending_changes()
    }

    pub fn pending_count(&self) -> usize {
        self.store.pending_count()
    }

    /// Administrative operations. Not part of the application mutation path.
    pub fn admin(&self) -> Admin<'_> {
        Admin { coordinator: self }
    }

    // =========================================================================
    // Remote calls (key lock held by the caller)
    // =========================================================================

    fn push_upsert(&self, key: &BeanKey, revision: Revision) -> Result<SyncStatus> {
        let status = match self.store.get(&key.channel, &key.id) {
            Some(record) => match self.remote.push(&record) {
                Ok(ack) => self.confirm_upsert(key, record, ack.cloud_id, revision),
                Err(err) => self.record_failure(key, err),
            },
            None => self
                .store
                .discard_change(key)
                .map(|_| SyncStatus::Unchanged),
        };

        if let Some(bean) = self.held(key) {
            let mut inner = bean.lock();
            if inner.lifecycle == Lifecycle::Saving {
                inner.lifecycle = Lifecycle::Live;
            }
        }
        status
    }

    fn confirm_upsert(
        &self,
        key: &BeanKey,
        record: BeanRecord,
        cloud_id: String,
        revision: Revision,
    ) -> Result<SyncStatus> {
        let pushed = record.revision;
        let mut synced = record;
        synced.mark_synced(cloud_id.clone());
        self.store.put(synced)?;
        self.store.complete_change(key, revision)?;

        if let Some(bean) = self.held(key) {
            let mut inner = bean.lock();
            if inner.record.revision == pushed {
                if inner.has_unsaved_edits() {
                    inner.record.cloud_id.get_or_insert(cloud_id);
                    inner.record.is_new = false;
                } else {
                    inner.record.mark_synced(cloud_id);
                }
            }
        }

        tracing::debug!(channel = %key.channel, id = %key.id, revision = pushed, "Remote confirmed save");
        Ok(SyncStatus::Synced)
    }

    fn push_delete(&self, key: &BeanKey, cloud_id: &str, revision: Revision) -> Result<SyncStatus> {
        match self.remote.delete(&key.channel, cloud_id) {
            Ok(()) | Err(RemoteError::NotFound { .. }) => {
                self.store.complete_change(key, revision)?;
                if let Some(bean) = self.held(key) {
                    let mut inner = bean.lock();
                    if inner.lifecycle == Lifecycle::Deleting {
                        inner.mark_deleted();
                    }
                }
                tracing::debug!(channel = %key.channel, id = %key.id, "Remote confirmed delete");
                Ok(SyncStatus::Synced)
            }
            Err(err) => self.record_failure(key, err),
        }
    }

    /// Note a failed remote call on the change entry. Transient failures
    /// become `Pending`; everything else is returned.
    fn record_failure(&self, key: &BeanKey, err: RemoteError) -> Result<SyncStatus> {
        let error = Error::from(err);
        match &error {
            Error::RemoteUnavailable(_) => {
                self.store.note_sync_failure(key, &error, false)?;
                tracing::warn!(key = %key, error = %error, "Remote unavailable, sync pending");
                Ok(SyncStatus::Pending)
            }
            Error::RemoteConflict { .. } => {
                self.store.note_sync_failure(key, &error, true)?;
                tracing::warn!(key = %key, error = %error, "Remote rejected change");
                Err(error)
            }
            _ => {
                self.store.note_sync_failure(key, &error, false)?;
                Err(error)
            }
        }
    }

    /// Bring back a bean whose remote delete was refused and drop its
    /// tombstone. Without a stored copy the bean returns as a proxy and
    /// hydrates from the remote on its next read.
    fn restore_deleted(
        &self,
        key: &BeanKey,
        cloud_id: &str,
        stored: Option<BeanRecord>,
        previous: Option<ChangeEntry>,
    ) -> Result<()> {
        let record = stored.unwrap_or_else(|| {
            let mut proxy =
                BeanRecord::from_cloud(key.channel.clone(), cloud_id, BeanBody::Proxy);
            proxy.local_id = key.id.clone();
            proxy
        });
        self.store.put(record)?;
        self.restore_change(key, previous);

        if let Some(bean) = self.held(key) {
            let mut inner = bean.lock();
            if inner.lifecycle == Lifecycle::Deleting {
                inner.lifecycle = Lifecycle::Live;
            }
        }
        tracing::info!(channel = %key.channel, id = %key.id, "Restored bean after refused delete");
        Ok(())
    }

    fn restore_change(&self, key: &BeanKey, previous: Option<ChangeEntry>) {
        let restored = match previous {
            Some(entry) => self.store.enqueue_change(entry).map(|_| ()),
            None => self.store.discard_change(key).map(|_| ()),
        };
        if let Err(e) = restored {
            tracing::warn!(key = %key, error = %e, "Could not restore change entry");
        }
    }

    // =========================================================================
    // Registry and locks
    // =========================================================================

    fn key_lock(&self, key: &BeanKey) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }

    /// The handle callers hold for `key`, if any.
    fn held(&self, key: &BeanKey) -> Option<Bean> {
        self.live
            .get(key)
            .and_then(|weak| weak.upgrade())
            .map(Bean::from_cell)
    }

    /// Like `held`, ignoring handles whose bean is already deleted.
    fn held_live(&self, key: &BeanKey) -> Option<Bean> {
        self.held(key)
            .filter(|bean| bean.lock().lifecycle != Lifecycle::Deleted)
    }

    /// The shared handle for a stored record, creating one if nobody holds it.
    fn handle_for(&self, record: BeanRecord) -> Bean {
        match self.live.entry(record.key()) {
            Entry::Occupied(mut entry) => {
                if let Some(cell) = entry.get().upgrade() {
                    let bean = Bean::from_cell(cell);
                    if bean.lock().lifecycle != Lifecycle::Deleted {
                        return bean;
                    }
                }
                let bean = Bean::from_record(record);
                entry.insert(bean.downgrade());
                bean
            }
            Entry::Vacant(entry) => {
                let bean = Bean::from_record(record);
                entry.insert(bean.downgrade());
                bean
            }
        }
    }

    /// Track a saved handle that was not handed out by this coordinator.
    fn register(&self, key: &BeanKey, bean: &Bean) {
        if self.held(key).is_none() {
            self.live.insert(key.clone(), bean.downgrade());
        }
    }

    /// Forget dead handles and key locks nobody is holding.
    fn prune_registry(&self) {
        self.live.retain(|_, weak| weak.strong_count() > 0);
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// Internal reset operations, used when the remote data set is rebooted.
#[derive(Debug)]
pub struct Admin<'a> {
    coordinator: &'a SyncCoordinator,
}

impl Admin<'_> {
    /// Drop every bean, pending change and boot marker of a channel. Held
    /// handles of the channel become deleted.
    pub fn clear_all(&self, channel: &str) -> Result<usize> {
        let c = self.coordinator;
        let removed = c.store.clear_channel(channel)?;

        let held: Vec<Bean> = c
            .live
            .iter()
            .filter(|entry| entry.key().channel == channel)
            .filter_map(|entry| entry.value().upgrade())
            .map(Bean::from_cell)
            .collect();
        c.live.retain(|key, _| key.channel != channel);
        for bean in held {
            bean.lock().mark_deleted();
        }
        c.prune_registry();
        Ok(removed)
    }

    /// Forget a bean's sync state: drop its pending change and clear its
    /// dirty tracking, locally and on the handle.
    pub fn clear_metadata(&self, bean: &Bean) -> Result<()> {
        let c = self.coordinator;
        let key = bean.key();
        let lock = c.key_lock(&key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        c.store.discard_change(&key)?;
        if let Some(mut record) = c.store.get(&key.channel, &key.id) {
            record.is_dirty = false;
            record.dirty_fields.clear();
            c.store.put(record)?;
        }

        let mut inner = bean.lock();
        inner.record.is_dirty = false;
        inner.record.dirty_fields.clear();
        inner.saved_gen = inner.edit_gen;
        if inner.lifecycle != Lifecycle::Deleted {
            inner.lifecycle = Lifecycle::Live;
        }
        tracing::info!(channel = %key.channel, id = %key.id, "Cleared bean metadata");
        Ok(())
    }

    /// Clear a channel and boot it again from the remote.
    pub fn reboot_channel(&self, channel: &str) -> Result<usize> {
        self.clear_all(channel)?;
        self.coordinator.boot_channel(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;

    fn coordinator() -> SyncCoordinator {
        SyncCoordinator::new(
            Arc::new(LocalStore::in_memory()),
            Arc::new(MemoryRemote::new()),
        )
    }

    #[test]
    fn reads_share_one_handle() {
        let sync = coordinator();
        let bean = sync.new_instance_with_id("orders", "o-1").unwrap();
        bean.set_value("status", "open").unwrap();
        sync.save(&bean).unwrap();

        let again = sync.read_by_id("orders", "o-1").unwrap();
        assert!(again.ptr_eq(&bean));
    }

    #[test]
    fn dropped_handles_are_pruned() {
        let sync = coordinator();
        let bean = sync.new_instance_with_id("orders", "o-1").unwrap();
        sync.save(&bean).unwrap();
        drop(bean);

        sync.sync_pending();
        assert_eq!(sync.live.len(), 0);

        let fresh = sync.read_by_id("orders", "o-1").unwrap();
        assert_eq!(fresh.state(), crate::BeanState::Synced);
    }

    #[test]
    fn idle_key_locks_are_pruned() {
        let sync = coordinator();
        for i in 0..100 {
            let bean = sync.new_instance_with_id("orders", &format!("o-{}", i)).unwrap();
            bean.set_value("status", "open").unwrap();
            sync.save(&bean).unwrap();
            sync.delete(&bean).unwrap();
        }
        assert_eq!(sync.locks.len(), 100);

        sync.sync_pending();
        assert_eq!(sync.locks.len(), 0);

        let bean = sync.new_instance_with_id("orders", "o-1").unwrap();
        sync.save(&bean).unwrap();
        sync.admin().clear_all("orders").unwrap();
        assert_eq!(sync.locks.len(), 0);
    }

    #[test]
    fn generated_ids_are_unique() {
        let sync = coordinator();
        let a = sync.new_instance("orders").unwrap();
        let b = sync.new_instance("orders").unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.is_new() && !a.is_dirty());
        assert!(matches!(
            sync.new_instance(""),
            Err(Error::NotInitialized(_))
        ));
    }

    #[test]
    fn detached_handle_can_be_saved() {
        let sync = coordinator();
        let bean = Bean::detached(BeanRecord::new("orders", "o-7"));
        bean.set_value("status", "open").unwrap();
        assert_eq!(sync.save(&bean).unwrap(), SyncStatus::Synced);
        assert!(sync.read_by_id("orders", "o-7").unwrap().ptr_eq(&bean));
    }
}
