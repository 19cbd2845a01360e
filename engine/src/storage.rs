//! Durable key/value storage beneath the local store.
//!
//! The engine does no IO of its own. Persistence is delegated to a
//! [`DurableStorage`] implementation supplied by the host platform; the
//! engine only serializes records to and from bytes.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

type ChannelMap = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// Byte-level storage collaborator, addressed by `(channel, key)`.
pub trait DurableStorage: Send + Sync {
    /// Read one value.
    fn get(&self, channel: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write one value, replacing any previous one.
    fn put(&self, channel: &str, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Remove one value. Removing a missing key is not an error.
    fn delete(&self, channel: &str, key: &str) -> Result<()>;

    /// Every `(key, value)` pair stored under a channel.
    fn scan(&self, channel: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Names of channels holding at least one value.
    fn channels(&self) -> Result<Vec<String>>;
}

/// In-memory storage, used in tests and for ephemeral caches.
///
/// Cloning an `Arc<MemoryStorage>` and reopening a store over it simulates a
/// process restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    channels: RwLock<ChannelMap>,
    failing: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Total number of stored values.
    pub fn len(&self) -> usize {
        self.read_map().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Storage("storage is failing".into()));
        }
        Ok(())
    }

    fn read_map(&self) -> RwLockReadGuard<'_, ChannelMap> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, ChannelMap> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DurableStorage for MemoryStorage {
    fn get(&self, channel: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .read_map()
            .get(channel)
            .and_then(|c| c.get(key))
            .cloned())
    }

    fn put(&self, channel: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.check_writable()?;
        self.write_map()
            .entry(channel.to_string())
            .or_default()
            .insert(key.to_string(), bytes);
        Ok(())
    }

    fn delete(&self, channel: &str, key: &str) -> Result<()> {
        self.check_writable()?;
        let mut map = self.write_map();
        if let Some(values) = map.get_mut(channel) {
            values.remove(key);
            if values.is_empty() {
                map.remove(channel);
            }
        }
        Ok(())
    }

    fn scan(&self, channel: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .read_map()
            .get(channel)
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn channels(&self) -> Result<Vec<String>> {
        Ok(self.read_map().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let storage = MemoryStorage::new();
        storage.put("orders", "o-1", b"one".to_vec()).unwrap();
        assert_eq!(storage.get("orders", "o-1").unwrap(), Some(b"one".to_vec()));
        assert_eq!(storage.channels().unwrap(), vec!["orders".to_string()]);

        storage.delete("orders", "o-1").unwrap();
        assert_eq!(storage.get("orders", "o-1").unwrap(), None);
        assert!(storage.channels().unwrap().is_empty());
        storage.delete("orders", "o-1").unwrap();
    }

    #[test]
    fn scan_returns_channel_values() {
        let storage = MemoryStorage::new();
        storage.put("orders", "o-2", b"2".to_vec()).unwrap();
        storage.put("orders", "o-1", b"1".to_vec()).unwrap();
        storage.put("items", "i-1", b"i".to_vec()).unwrap();

        let keys: Vec<_> = storage
            .scan("orders")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["o-1", "o-2"]);
        assert_eq!(storage.len(), 3);
    }

    #[test]
    fn failing_switch_rejects_writes() {
        let storage = MemoryStorage::new();
        storage.set_failing(true);
        assert!(matches!(
            storage.put("orders", "o-1", vec![]),
            Err(Error::Storage(_))
        ));
        storage.set_failing(false);
        assert!(storage.put("orders", "o-1", vec![]).is_ok());
    }
}
