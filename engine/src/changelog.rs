//! The change log: local changes waiting for cloud confirmation.
//!
//! Every bean has at most one entry. A newer save or delete replaces the
//! older entry, so repeated edits made while offline coalesce into a single
//! push of the latest durable copy. A `Delete` entry doubles as the bean's
//! pending-delete tombstone.

use crate::{BeanId, BeanKey, Channel, Revision, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of change waiting to be synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Upsert,
    Delete,
}

/// A change waiting to be synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    pub channel: Channel,
    pub id: BeanId,
    pub op: ChangeOp,
    /// Revision of the local save this entry confirms
    pub revision: Revision,
    /// Cloud id to delete, captured before the local record is dropped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_id: Option<BeanId>,
    /// Queue position, used to drain in arrival order
    pub seq: u64,
    /// When the entry was queued (milliseconds since epoch)
    pub queued_at: Timestamp,
    /// Failed sync attempts so far
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Set when the cloud rejected the change; skipped until the next save
    #[serde(default)]
    pub conflicted: bool,
}

impl ChangeEntry {
    pub fn upsert(key: &BeanKey, revision: Revision, queued_at: Timestamp) -> Self {
        Self::new(key, ChangeOp::Upsert, revision, None, queued_at)
    }

    pub fn delete(
        key: &BeanKey,
        revision: Revision,
        cloud_id: Option<BeanId>,
        queued_at: Timestamp,
    ) -> Self {
        Self::new(key, ChangeOp::Delete, revision, cloud_id, queued_at)
    }

    fn new(
        key: &BeanKey,
        op: ChangeOp,
        revision: Revision,
        cloud_id: Option<BeanId>,
        queued_at: Timestamp,
    ) -> Self {
        Self {
            channel: key.channel.clone(),
            id: key.id.clone(),
            op,
            revision,
            cloud_id,
            seq: 0,
            queued_at,
            attempts: 0,
            last_error: None,
            conflicted: false,
        }
    }

    pub fn key(&self) -> BeanKey {
        BeanKey::new(&self.channel, &self.id)
    }
}

/// In-memory view of the change log. Persistence is handled by the owner.
#[derive(Debug, Clone, Default)]
pub struct ChangeLog {
    entries: HashMap<BeanKey, ChangeEntry>,
    next_seq: u64,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries.
    pub fn from_entries(entries: impl IntoIterator<Item = ChangeEntry>) -> Self {
        let mut log = Self::new();
        for entry in entries {
            log.next_seq = log.next_seq.max(entry.seq + 1);
            log.entries.insert(entry.key(), entry);
        }
        log
    }

    /// Queue a change, replacing any earlier entry for the same bean.
    /// Returns the stored entry.
    pub fn record(&mut self, mut entry: ChangeEntry) -> ChangeEntry {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(entry.key(), entry.clone());
        entry
    }

    pub fn get(&self, key: &BeanKey) -> Option<&ChangeEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &BeanKey) -> Option<&mut ChangeEntry> {
        self.entries.get_mut(key)
    }

    pub fn remove(&mut self, key: &BeanKey) -> Option<ChangeEntry> {
        self.entries.remove(key)
    }

    /// Remove the entry only if it still describes `revision`.
    pub fn remove_confirmed(&mut self, key: &BeanKey, revision: Revision) -> bool {
        match self.entries.get(key) {
            Some(entry) if entry.revision == revision => {
                self.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn is_pending_delete(&self, key: &BeanKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.op == ChangeOp::Delete)
    }

    /// Entries in arrival order.
    pub fn entries(&self) -> Vec<ChangeEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// Drop every entry of a channel, returning the removed keys.
    pub fn clear_channel(&mut self, channel: &str) -> Vec<BeanKey> {
        let keys: Vec<_> = self
            .entries
            .keys()
            .filter(|k| k.channel == channel)
            .cloned()
            .collect();
        for key in &keys {
            self.entries.remove(key);
        }
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> BeanKey {
        BeanKey::new("orders", id)
    }

    #[test]
    fn newer_change_replaces_older() {
        let mut log = ChangeLog::new();
        log.record(ChangeEntry::upsert(&key("o-1"), 1, 1000));
        log.record(ChangeEntry::upsert(&key("o-1"), 2, 2000));
        assert_eq!(log.len(), 1);
        assert_eq!(log.get(&key("o-1")).unwrap().revision, 2);

        log.record(ChangeEntry::delete(&key("o-1"), 2, Some("o-1".into()), 3000));
        assert!(log.is_pending_delete(&key("o-1")));
    }

    #[test]
    fn entries_drain_in_arrival_order() {
        let mut log = ChangeLog::new();
        log.record(ChangeEntry::upsert(&key("b"), 1, 1000));
        log.record(ChangeEntry::upsert(&key("a"), 1, 1000));
        log.record(ChangeEntry::upsert(&key("b"), 2, 1000));

        let ids: Vec<_> = log.entries().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn confirmation_of_stale_revision_keeps_entry() {
        let mut log = ChangeLog::new();
        log.record(ChangeEntry::upsert(&key("o-1"), 3, 1000));
        assert!(!log.remove_confirmed(&key("o-1"), 2));
        assert!(log.remove_confirmed(&key("o-1"), 3));
        assert!(log.is_empty());
    }

    #[test]
    fn rebuild_continues_sequence() {
        let mut log = ChangeLog::new();
        log.record(ChangeEntry::upsert(&key("a"), 1, 1000));
        log.record(ChangeEntry::upsert(&key("b"), 1, 1000));

        let mut rebuilt = ChangeLog::from_entries(log.entries());
        let entry = rebuilt.record(ChangeEntry::upsert(&key("c"), 1, 1000));
        assert_eq!(entry.seq, 2);
    }

    #[test]
    fn clear_channel_only_touches_that_channel() {
        let mut log = ChangeLog::new();
        log.record(ChangeEntry::upsert(&key("o-1"), 1, 1000));
        log.record(ChangeEntry::upsert(&BeanKey::new("items", "i-1"), 1, 1000));

        assert_eq!(log.clear_channel("orders"), vec![key("o-1")]);
        assert_eq!(log.len(), 1);
    }
}
