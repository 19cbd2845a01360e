//! The remote sync service the coordinator pushes to and pulls from.
//!
//! Transport, retry backoff and auth belong to the implementation. The engine
//! only needs the four calls of [`RemoteService`] and a way to tell transient
//! failures from conflicts.

use crate::error::Error;
use crate::record::BeanData;
use crate::{BeanId, BeanKey, BeanRecord, Channel};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Failures reported by a remote service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Transient: the call may succeed later.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// The remote rejected the change.
    #[error("remote conflict on {channel}/{id}: {reason}")]
    Conflict {
        channel: Channel,
        id: BeanId,
        reason: String,
    },

    #[error("not found on remote: {channel}/{id}")]
    NotFound { channel: Channel, id: BeanId },
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unavailable(msg) => Error::RemoteUnavailable(msg),
            RemoteError::Conflict {
                channel,
                id,
                reason,
            } => Error::RemoteConflict {
                channel,
                id,
                reason,
            },
            RemoteError::NotFound { channel, id } => Error::NotFound { channel, id },
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Acknowledgement of a successful push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushAck {
    /// Id the remote stores the bean under
    pub cloud_id: BeanId,
}

/// Remote state of one bean.
///
/// `data` is `None` when the remote only announces the bean's existence; the
/// bean is then stored locally as a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeSnapshot {
    pub channel: Channel,
    /// Cloud id of the bean
    pub id: BeanId,
    #[serde(default)]
    pub data: Option<BeanData>,
    #[serde(default)]
    pub readonly: bool,
}

impl AttributeSnapshot {
    pub fn hydrated(channel: impl Into<Channel>, id: impl Into<BeanId>, data: BeanData) -> Self {
        Self {
            channel: channel.into(),
            id: id.into(),
            data: Some(data),
            readonly: false,
        }
    }

    pub fn proxy(channel: impl Into<Channel>, id: impl Into<BeanId>) -> Self {
        Self {
            channel: channel.into(),
            id: id.into(),
            data: None,
            readonly: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }

    pub fn key(&self) -> BeanKey {
        BeanKey::new(&self.channel, &self.id)
    }
}

/// The remote sync service.
pub trait RemoteService: Send + Sync {
    /// Store the record's current data remotely.
    fn push(&self, record: &BeanRecord) -> RemoteResult<PushAck>;

    /// Fetch one bean by cloud id. `Ok(None)` means the remote has no such bean.
    fn pull(&self, channel: &str, id: &str) -> RemoteResult<Option<AttributeSnapshot>>;

    /// Delete one bean by cloud id.
    fn delete(&self, channel: &str, id: &str) -> RemoteResult<()>;

    /// Initial bulk load of a channel.
    fn boot_channel(&self, channel: &str) -> RemoteResult<Vec<AttributeSnapshot>>;
}

#[derive(Debug, Clone)]
struct RemoteBean {
    data: BeanData,
    readonly: bool,
}

type RemoteChannels = BTreeMap<Channel, BTreeMap<BeanId, RemoteBean>>;

/// In-process remote, used in tests and demos.
///
/// Supports taking the remote offline, injecting conflicts for particular
/// beans and counting calls.
#[derive(Debug)]
pub struct MemoryRemote {
    channels: RwLock<RemoteChannels>,
    online: AtomicBool,
    conflicts: DashMap<BeanKey, String>,
    cloud_id_prefix: Option<String>,
    pushes: AtomicUsize,
    pulls: AtomicUsize,
    deletes: AtomicUsize,
    boots: AtomicUsize,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(BTreeMap::new()),
            online: AtomicBool::new(true),
            conflicts: DashMap::new(),
            cloud_id_prefix: None,
            pushes: AtomicUsize::new(0),
            pulls: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            boots: AtomicUsize::new(0),
        }
    }

    /// Assign cloud ids of the form `{prefix}{local_id}` to beans pushed
    /// without one, instead of reusing the local id.
    pub fn with_cloud_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cloud_id_prefix = Some(prefix.into());
        self
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Reject pushes and deletes of `(channel, id)` until cleared.
    pub fn inject_conflict(&self, channel: &str, id: &str, reason: impl Into<String>) {
        self.conflicts
            .insert(BeanKey::new(channel, id), reason.into());
    }

    pub fn clear_conflict(&self, channel: &str, id: &str) {
        self.conflicts.remove(&BeanKey::new(channel, id));
    }

    /// Store a bean as if another device had pushed it.
    pub fn insert(&self, snapshot: AttributeSnapshot) {
        let bean = RemoteBean {
            data: snapshot.data.unwrap_or_default(),
            readonly: snapshot.readonly,
        };
        self.write_channels()
            .entry(snapshot.channel)
            .or_default()
            .insert(snapshot.id, bean);
    }

    /// Remove a bean as if another device had deleted it.
    pub fn remove(&self, channel: &str, id: &str) -> bool {
        self.write_channels()
            .get_mut(channel)
            .is_some_and(|beans| beans.remove(id).is_some())
    }

    /// Current remote state of a bean.
    pub fn get(&self, channel: &str, id: &str) -> Option<AttributeSnapshot> {
        self.read_channels()
            .get(channel)
            .and_then(|beans| beans.get(id))
            .map(|bean| snapshot_of(channel, id, bean))
    }

    pub fn len(&self, channel: &str) -> usize {
        self.read_channels().get(channel).map_or(0, BTreeMap::len)
    }

    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn boot_count(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> RemoteResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(RemoteError::Unavailable("remote is offline".into()))
        }
    }

    fn check_conflict(&self, channel: &str, id: &str) -> RemoteResult<()> {
        match self.conflicts.get(&BeanKey::new(channel, id)) {
            Some(reason) => Err(RemoteError::Conflict {
                channel: channel.to_string(),
                id: id.to_string(),
                reason: reason.value().clone(),
            }),
            None => Ok(()),
        }
    }

    fn read_channels(&self) -> RwLockReadGuard<'_, RemoteChannels> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_channels(&self) -> RwLockWriteGuard<'_, RemoteChannels> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn snapshot_of(channel: &str, id: &str, bean: &RemoteBean) -> AttributeSnapshot {
    AttributeSnapshot {
        channel: channel.to_string(),
        id: id.to_string(),
        data: Some(bean.data.clone()),
        readonly: bean.readonly,
    }
}

impl RemoteService for MemoryRemote {
    fn push(&self, record: &BeanRecord) -> RemoteResult<PushAck> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let cloud_id = match (&record.cloud_id, &self.cloud_id_prefix) {
            (Some(id), _) => id.clone(),
            (None, Some(prefix)) => format!("{}{}", prefix, record.local_id),
            (None, None) => record.local_id.clone(),
        };
        self.check_conflict(&record.channel, &cloud_id)?;

        let bean = RemoteBean {
            data: record.data().cloned().unwrap_or_default(),
            readonly: record.readonly,
        };
        self.write_channels()
            .entry(record.channel.clone())
            .or_default()
            .insert(cloud_id.clone(), bean);
        Ok(PushAck { cloud_id })
    }

    fn pull(&self, channel: &str, id: &str) -> RemoteResult<Option<AttributeSnapshot>> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self.get(channel, id))
    }

    fn delete(&self, channel: &str, id: &str) -> RemoteResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.check_conflict(channel, id)?;
        if self.remove(channel, id) {
            Ok(())
        } else {
            Err(RemoteError::NotFound {
                channel: channel.to_string(),
                id: id.to_string(),
            })
        }
    }

    fn boot_channel(&self, channel: &str) -> RemoteResult<Vec<AttributeSnapshot>> {
        self.boots.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self
            .read_channels()
            .get(channel)
            .map(|beans| {
                beans
                    .iter()
                    .map(|(id, bean)| snapshot_of(channel, id, bean))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AttributeStore;

    fn data(status: &str) -> BeanData {
        BeanData::new(AttributeStore::from_pairs([("status", status)]).unwrap())
    }

    #[test]
    fn push_assigns_cloud_id() {
        let remote = MemoryRemote::new();
        let record = BeanRecord::new("orders", "o-1");
        assert_eq!(remote.push(&record).unwrap().cloud_id, "o-1");

        let remote = MemoryRemote::new().with_cloud_id_prefix("c-");
        let ack = remote.push(&record).unwrap();
        assert_eq!(ack.cloud_id, "c-o-1");
        assert!(remote.get("orders", "c-o-1").is_some());
    }

    #[test]
    fn offline_calls_fail_transiently() {
        let remote = MemoryRemote::new();
        remote.set_online(false);
        let err = remote.push(&BeanRecord::new("orders", "o-1")).unwrap_err();
        assert!(matches!(err, RemoteError::Unavailable(_)));
        assert!(Error::from(err).is_retryable());
        assert_eq!(remote.push_count(), 1);
        assert_eq!(remote.len("orders"), 0);
    }

    #[test]
    fn injected_conflict_persists_until_cleared() {
        let remote = MemoryRemote::new();
        remote.inject_conflict("orders", "o-1", "stale revision");
        let record = BeanRecord::new("orders", "o-1");

        assert!(matches!(
            remote.push(&record),
            Err(RemoteError::Conflict { .. })
        ));
        assert!(remote.push(&record).is_err());

        remote.clear_conflict("orders", "o-1");
        assert!(remote.push(&record).is_ok());
    }

    #[test]
    fn boot_lists_channel_beans() {
        let remote = MemoryRemote::new();
        remote.insert(AttributeSnapshot::hydrated("orders", "o-1", data("open")));
        remote.insert(AttributeSnapshot::hydrated("orders", "o-2", data("closed")).read_only());
        remote.insert(AttributeSnapshot::hydrated("items", "i-1", data("x")));

        let snapshots = remote.boot_channel("orders").unwrap();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots[1].readonly);
        assert!(remote.boot_channel("empty").unwrap().is_empty());
    }

    #[test]
    fn delete_missing_is_not_found() {
        let remote = MemoryRemote::new();
        assert!(matches!(
            remote.delete("orders", "o-1"),
            Err(RemoteError::NotFound { .. })
        ));
    }
}
