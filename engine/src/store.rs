//! LocalStore - the canonical copy of every bean on the device.
//!
//! The store indexes beans per channel, tracks which channels have been
//! booted, and owns the change log. Every mutation is written through to the
//! [`DurableStorage`] collaborator before it becomes visible in the index, so
//! a crash never exposes state that was not persisted.

use crate::changelog::{ChangeEntry, ChangeLog};
use crate::codec::{self, BootMarker, StoredBean};
use crate::error::{Error, Result};
use crate::query::Query;
use crate::storage::{DurableStorage, MemoryStorage};
use crate::{BeanId, BeanKey, BeanRecord, Channel, Revision, Timestamp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Prefix reserved for the store's own bookkeeping channels.
pub const RESERVED_PREFIX: &str = "__beancache.";
const META_CHANNEL: &str = "__beancache.meta";
const CHANGELOG_CHANNEL: &str = "__beancache.changelog";
const BOOT_KEY_PREFIX: &str = "booted/";

pub(crate) fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

/// A stored bean together with its insertion position.
#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    record: BeanRecord,
}

/// The beans of one channel.
#[derive(Debug, Default)]
struct ChannelIndex {
    records: HashMap<BeanId, Slot>,
    booted_at: Option<Timestamp>,
}

impl ChannelIndex {
    fn is_booted(&self) -> bool {
        self.booted_at.is_some()
    }

    /// Records in insertion order.
    fn ordered(&self) -> Vec<&BeanRecord> {
        let mut slots: Vec<_> = self.records.values().collect();
        slots.sort_by_key(|s| s.seq);
        slots.into_iter().map(|s| &s.record).collect()
    }
}

/// The local bean store.
pub struct LocalStore {
    storage: Arc<dyn DurableStorage>,
    channels: RwLock<HashMap<Channel, ChannelIndex>>,
    changelog: Mutex<ChangeLog>,
    next_seq: AtomicU64,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("channels", &self.channel_names())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl LocalStore {
    /// A store backed by fresh in-memory storage.
    pub fn in_memory() -> Self {
        Self {
            storage: Arc::new(MemoryStorage::new()),
            channels: RwLock::new(HashMap::new()),
            changelog: Mutex::new(ChangeLog::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Open a store over existing storage, loading every persisted bean,
    /// boot marker and change-log entry.
    pub fn open(storage: Arc<dyn DurableStorage>) -> Result<Self> {
        let mut channels: HashMap<Channel, ChannelIndex> = HashMap::new();
        let mut next_seq = 0;

        for channel in storage.channels()? {
            if channel.starts_with(RESERVED_PREFIX) {
                continue;
            }
            let index = channels.entry(channel.clone()).or_default();
            for (_, bytes) in storage.scan(&channel)? {
                let stored: StoredBean = codec::decode(&bytes)?;
                next_seq = next_seq.max(stored.seq + 1);
                index.records.insert(
                    stored.record.local_id.clone(),
                    Slot {
                        seq: stored.seq,
                        record: stored.record,
                    },
                );
            }
        }

        for (key, bytes) in storage.scan(META_CHANNEL)? {
            if let Some(channel) = key.strip_prefix(BOOT_KEY_PREFIX) {
                let marker: BootMarker = codec::decode(&bytes)?;
                channels.entry(channel.to_string()).or_default().booted_at =
                    Some(marker.booted_at);
            }
        }

        let mut entries = Vec::new();
        for (_, bytes) in storage.scan(CHANGELOG_CHANNEL)? {
            entries.push(codec::decode::<ChangeEntry>(&bytes)?);
        }

        tracing::info!(
            channels = channels.len(),
            pending = entries.len(),
            "Opened local store"
        );

        Ok(Self {
            storage,
            channels: RwLock::new(channels),
            changelog: Mutex::new(ChangeLog::from_entries(entries)),
            next_seq: AtomicU64::new(next_seq),
        })
    }

    // ------------------------------------------------------------------
    // Boot state
    // ------------------------------------------------------------------

    pub fn is_booted(&self, channel: &str) -> bool {
        self.read_channels()
            .get(channel)
            .is_some_and(ChannelIndex::is_booted)
    }

    /// Record that a channel has received its initial load.
    pub fn mark_booted(&self, channel: &str) -> Result<()> {
        let booted_at = now_millis();
        let bytes = codec::encode(&BootMarker { booted_at })?;
        let mut channels = self.write_channels();
        self.storage
            .put(META_CHANNEL, &boot_key(channel), bytes)?;
        channels.entry(channel.to_string()).or_default().booted_at = Some(booted_at);
        Ok(())
    }

    /// Fail with `ChannelNotBooted` unless the channel is booted.
    pub fn ensure_booted(&self, channel: &str) -> Result<()> {
        if self.is_booted(channel) {
            Ok(())
        } else {
            Err(Error::ChannelNotBooted(channel.to_string()))
        }
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    pub fn get(&self, channel: &str, id: &str) -> Option<BeanRecord> {
        self.read_channels()
            .get(channel)
            .and_then(|c| c.records.get(id))
            .map(|slot| slot.record.clone())
    }

    pub fn read_by_id(&self, channel: &str, id: &str) -> Result<BeanRecord> {
        self.get(channel, id)
            .ok_or_else(|| Error::not_found(channel, id))
    }

    pub fn contains(&self, channel: &str, id: &str) -> bool {
        self.read_channels()
            .get(channel)
            .is_some_and(|c| c.records.contains_key(id))
    }

    /// Local key of the bean the cloud knows as `remote_id`.
    ///
    /// Beans created on the device may carry a cloud id that differs from
    /// their local id; beans pending delete are found through their change
    /// entry. Unknown ids map to themselves.
    pub fn resolve_remote_id(&self, channel: &str, remote_id: &str) -> BeanKey {
        {
            let channels = self.read_channels();
            if let Some(index) = channels.get(channel) {
                let direct = index.records.get(remote_id).is_some_and(|slot| {
                    slot.record.cloud_id.as_deref().map_or(true, |c| c == remote_id)
                });
                if direct {
                    return BeanKey::new(channel, remote_id);
                }
                if let Some(slot) = index
                    .records
                    .values()
                    .find(|slot| slot.record.cloud_id.as_deref() == Some(remote_id))
                {
                    return slot.record.key();
                }
            }
        }

        self.lock_changelog()
            .entries()
            .into_iter()
            .find(|e| e.channel == channel && e.cloud_id.as_deref() == Some(remote_id))
            .map(|e| e.key())
            .unwrap_or_else(|| BeanKey::new(channel, remote_id))
    }

    /// Every bean of a channel in insertion order, proxies included.
    pub fn read_all(&self, channel: &str) -> Vec<BeanRecord> {
        self.read_channels()
            .get(channel)
            .map(|c| c.ordered().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Beans of a booted channel matching `query`, in insertion order.
    pub fn query(&self, channel: &str, query: &Query) -> Result<Vec<BeanRecord>> {
        let channels = self.read_channels();
        let index = channels
            .get(channel)
            .filter(|c| c.is_booted())
            .ok_or_else(|| Error::ChannelNotBooted(channel.to_string()))?;
        Ok(query
            .filter(index.ordered())
            .into_iter()
            .cloned()
            .collect())
    }

    /// Insert or replace a bean.
    ///
    /// Identity is fixed once stored: the cloud id may go from unset to set
    /// but never change after that.
    pub fn put(&self, record: BeanRecord) -> Result<()> {
        record.validate()?;
        if record.channel.starts_with(RESERVED_PREFIX) {
            return Err(Error::NotInitialized(format!(
                "channel '{}' is reserved",
                record.channel
            )));
        }

        let mut channels = self.write_channels();
        let index = channels.entry(record.channel.clone()).or_default();

        let seq = match index.records.get(&record.local_id) {
            Some(existing) => {
                if let Some(cloud_id) = &existing.record.cloud_id {
                    if record.cloud_id.as_ref() != Some(cloud_id) {
                        return Err(Error::IdentityChanged {
                            channel: record.channel.clone(),
                            id: record.local_id.clone(),
                        });
                    }
                }
                existing.seq
            }
            None => self.next_seq.fetch_add(1, Ordering::SeqCst),
        };

        let stored = StoredBean { seq, record };
        self.storage.put(
            &stored.record.channel,
            &stored.record.local_id,
            codec::encode(&stored)?,
        )?;

        tracing::trace!(
            channel = %stored.record.channel,
            id = %stored.record.local_id,
            "Stored bean"
        );
        index.records.insert(
            stored.record.local_id.clone(),
            Slot {
                seq,
                record: stored.record,
            },
        );
        Ok(())
    }

    /// Remove a bean. Returns the removed record, if any.
    pub fn remove(&self, channel: &str, id: &str) -> Result<Option<BeanRecord>> {
        let mut channels = self.write_channels();
        let Some(index) = channels.get_mut(channel) else {
            return Ok(None);
        };
        if !index.records.contains_key(id) {
            return Ok(None);
        }
        self.storage.delete(channel, id)?;
        Ok(index.records.remove(id).map(|slot| slot.record))
    }

    /// Drop every bean, the boot marker and the pending changes of a channel.
    /// Returns the number of beans removed.
    pub fn clear_channel(&self, channel: &str) -> Result<usize> {
        let mut channels = self.write_channels();
        let removed = match channels.get_mut(channel) {
            Some(index) => {
                let ids: Vec<_> = index.records.keys().cloned().collect();
                for id in &ids {
                    self.storage.delete(channel, id)?;
                    index.records.remove(id);
                }
                ids.len()
            }
            None => 0,
        };
        self.storage.delete(META_CHANNEL, &boot_key(channel))?;
        channels.remove(channel);

        let mut log = self.lock_changelog();
        for key in log.clear_channel(channel) {
            self.storage.delete(CHANGELOG_CHANNEL, &change_key(&key))?;
        }

        tracing::info!(channel = %channel, removed, "Cleared channel");
        Ok(removed)
    }

    /// Names of channels with beans or a boot marker.
    pub fn channel_names(&self) -> Vec<Channel> {
        let mut names: Vec<_> = self.read_channels().keys().cloned().collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Change log
    // ------------------------------------------------------------------

    /// Queue a change, replacing any earlier one for the same bean.
    pub fn enqueue_change(&self, entry: ChangeEntry) -> Result<ChangeEntry> {
        let mut log = self.lock_changelog();
        let key = entry.key();
        let previous = log.get(&key).cloned();
        let stored = log.record(entry);
        if let Err(e) = self.persist_change(&stored) {
            match previous {
                Some(previous) => {
                    log.record(previous);
                }
                None => {
                    log.remove(&key);
                }
            }
            return Err(e);
        }
        Ok(stored)
    }

    pub fn change(&self, key: &BeanKey) -> Option<ChangeEntry> {
        self.lock_changelog().get(key).cloned()
    }

    pub fn is_pending_delete(&self, key: &BeanKey) -> bool {
        self.lock_changelog().is_pending_delete(key)
    }

    /// Remove the change for `key` if it still describes `revision`.
    pub fn complete_change(&self, key: &BeanKey, revision: Revision) -> Result<bool> {
        let mut log = self.lock_changelog();
        if !log.remove_confirmed(key, revision) {
            return Ok(false);
        }
        self.storage.delete(CHANGELOG_CHANNEL, &change_key(key))?;
        Ok(true)
    }

    /// Remove the change for `key` regardless of revision.
    pub fn discard_change(&self, key: &BeanKey) -> Result<Option<ChangeEntry>> {
        let mut log = self.lock_changelog();
        let removed = log.remove(key);
        if removed.is_some() {
            self.storage.delete(CHANGELOG_CHANNEL, &change_key(key))?;
        }
        Ok(removed)
    }

    /// Record a failed sync attempt for `key`.
    pub fn note_sync_failure(&self, key: &BeanKey, error: &Error, conflicted: bool) -> Result<()> {
        let mut log = self.lock_changelog();
        let Some(entry) = log.get_mut(key) else {
            return Ok(());
        };
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.conflicted = conflicted;
        let entry = entry.clone();
        self.persist_change(&entry)
    }

    /// Pending changes in arrival order.
    pub fn pending_changes(&self) -> Vec<ChangeEntry> {
        self.lock_changelog().entries()
    }

    pub fn pending_count(&self) -> usize {
        self.lock_changelog().len()
    }

    fn persist_change(&self, entry: &ChangeEntry) -> Result<()> {
        self.storage.put(
            CHANGELOG_CHANNEL,
            &change_key(&entry.key()),
            codec::encode(entry)?,
        )
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    fn read_channels(&self) -> RwLockReadGuard<'_, HashMap<Channel, ChannelIndex>> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_channels(&self) -> RwLockWriteGuard<'_, HashMap<Channel, ChannelIndex>> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_changelog(&self) -> MutexGuard<'_, ChangeLog> {
        self.changelog.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn boot_key(channel: &str) -> String {
    format!("{}{}", BOOT_KEY_PREFIX, channel)
}

/// Storage key for a change entry. The length prefix keeps keys unique even
/// when channel names contain the separator.
fn change_key(key: &BeanKey) -> String {
    format!("{}:{}/{}", key.channel.len(), key.channel, key.id)
}
