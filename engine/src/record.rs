//! Bean records: identity, lifecycle flags and (when hydrated) data.

use crate::error::{Error, Result};
use crate::path::FieldPath;
use crate::{AttributeStore, BeanId, BeanList, BeanListEntry, Channel, ListManager, Revision};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identity of a bean within the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeanKey {
    pub channel: Channel,
    pub id: BeanId,
}

impl BeanKey {
    pub fn new(channel: impl Into<Channel>, id: impl Into<BeanId>) -> Self {
        Self {
            channel: channel.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for BeanKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.channel, self.id)
    }
}

/// Where a bean was first created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Created on this device, id generated locally
    Device,
    /// Received from the cloud
    Cloud,
}

/// A field that carries unconfirmed local edits.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "lowercase")]
pub enum FieldKey {
    Value(String),
    Binary(String),
    List(String),
}

/// Hydrated bean contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeanData {
    pub attributes: AttributeStore,
    pub lists: ListManager,
}

impl BeanData {
    pub fn new(attributes: AttributeStore) -> Self {
        Self {
            attributes,
            lists: ListManager::new(),
        }
    }

    pub fn with_lists(mut self, lists: ListManager) -> Self {
        self.lists = lists;
        self
    }

    /// Overwrite `self` with `incoming`, except for `protected` fields which
    /// keep their current value (or absence).
    pub(crate) fn merge_from(&mut self, incoming: &BeanData, protected: &BTreeSet<FieldKey>) {
        let local = std::mem::replace(self, incoming.clone());
        for key in protected {
            match key {
                FieldKey::Value(k) => self.attributes.copy_value_from(&local.attributes, k),
                FieldKey::Binary(k) => self.attributes.copy_binary_from(&local.attributes, k),
                FieldKey::List(p) => self.lists.copy_property_from(&local.lists, p),
            }
        }
    }
}

/// Either identity only (lazy-load marker) or fully hydrated data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "data", rename_all = "lowercase")]
pub enum BeanBody {
    Proxy,
    Hydrated(BeanData),
}

/// One bean's full state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeanRecord {
    /// Channel this bean belongs to
    pub channel: Channel,
    /// Device-side identifier, unique within the channel
    pub local_id: BeanId,
    /// Cloud-side identifier, set once the cloud acknowledges the bean
    pub cloud_id: Option<BeanId>,
    pub origin: Origin,
    pub body: BeanBody,
    /// True until the first confirmed save
    pub is_new: bool,
    /// True while local mutations are not confirmed by the cloud
    pub is_dirty: bool,
    pub readonly: bool,
    /// Incremented on every local save
    pub revision: Revision,
    /// Fields with unconfirmed local edits
    #[serde(default)]
    pub dirty_fields: BTreeSet<FieldKey>,
}

impl BeanRecord {
    /// A new, empty, device-originated bean.
    pub fn new(channel: impl Into<Channel>, local_id: impl Into<BeanId>) -> Self {
        Self {
            channel: channel.into(),
            local_id: local_id.into(),
            cloud_id: None,
            origin: Origin::Device,
            body: BeanBody::Hydrated(BeanData::default()),
            is_new: true,
            is_dirty: false,
            readonly: false,
            revision: 0,
            dirty_fields: BTreeSet::new(),
        }
    }

    /// A clean bean received from the cloud.
    pub fn from_cloud(channel: impl Into<Channel>, id: impl Into<BeanId>, body: BeanBody) -> Self {
        let id = id.into();
        Self {
            channel: channel.into(),
            local_id: id.clone(),
            cloud_id: Some(id),
            origin: Origin::Cloud,
            body,
            is_new: false,
            is_dirty: false,
            readonly: false,
            revision: 0,
            dirty_fields: BTreeSet::new(),
        }
    }

    /// Check the identity invariants.
    pub fn validate(&self) -> Result<()> {
        if self.channel.trim().is_empty() {
            return Err(Error::NotInitialized("channel is empty".into()));
        }
        if self.local_id.trim().is_empty() {
            return Err(Error::NotInitialized(format!(
                "bean in channel '{}' has an empty id",
                self.channel
            )));
        }
        if self.is_new && self.is_proxy() {
            return Err(Error::NotInitialized(format!(
                "bean {}/{} is both new and a proxy",
                self.channel, self.local_id
            )));
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn key(&self) -> BeanKey {
        BeanKey::new(&self.channel, &self.local_id)
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.body, BeanBody::Proxy)
    }

    pub fn is_created_on_device(&self) -> bool {
        self.origin == Origin::Device
    }

    /// Hydrated data, if any.
    pub fn data(&self) -> Option<&BeanData> {
        match &self.body {
            BeanBody::Hydrated(data) => Some(data),
            BeanBody::Proxy => None,
        }
    }

    /// Id to address the bean with on the cloud side.
    pub fn remote_id(&self) -> &str {
        self.cloud_id.as_deref().unwrap_or(&self.local_id)
    }

    /// Read a string value; proxies have no values.
    pub fn get_value(&self, path: &str) -> Result<Option<String>> {
        match self.data() {
            Some(data) => Ok(data.attributes.get(path)?.map(str::to_string)),
            None => {
                FieldPath::parse(path)?;
                Ok(None)
            }
        }
    }

    pub fn get_binary_value(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.data() {
            Some(data) => Ok(data.attributes.get_binary(path)?.map(<[u8]>::to_vec)),
            None => {
                FieldPath::parse(path)?;
                Ok(None)
            }
        }
    }

    pub fn read_list(&self, property: &str) -> BeanList {
        self.data()
            .map(|data| data.lists.read(property))
            .unwrap_or_default()
    }

    // Mutators return whether the record changed. Identical writes leave
    // dirty tracking alone.

    pub fn set_value(&mut self, path: &str, value: impl Into<String>) -> Result<bool> {
        let key = FieldPath::parse(path)?.canonical();
        let changed = self.data_mut()?.attributes.set(&key, value)?;
        Ok(self.touch(changed, FieldKey::Value(key)))
    }

    pub fn set_binary_value(&mut self, path: &str, value: impl Into<Vec<u8>>) -> Result<bool> {
        let key = FieldPath::parse(path)?.canonical();
        let changed = self.data_mut()?.attributes.set_binary(&key, value)?;
        Ok(self.touch(changed, FieldKey::Binary(key)))
    }

    pub fn save_list(&mut self, property: &str, list: Option<BeanList>) -> Result<bool> {
        let changed = self.data_mut()?.lists.save(property, list)?;
        Ok(self.touch(changed, FieldKey::List(property.to_string())))
    }

    pub fn clear_list(&mut self, property: &str) -> Result<bool> {
        let changed = self.data_mut()?.lists.clear(property);
        Ok(self.touch(changed, FieldKey::List(property.to_string())))
    }

    pub fn add_bean(&mut self, property: &str, entry: BeanListEntry) -> Result<bool> {
        self.data_mut()?.lists.add(property, entry)?;
        Ok(self.touch(true, FieldKey::List(property.to_string())))
    }

    pub fn remove_bean(&mut self, property: &str, index: usize) -> Result<BeanListEntry> {
        let removed = self.data_mut()?.lists.remove_at(property, index)?;
        self.touch(true, FieldKey::List(property.to_string()));
        Ok(removed)
    }

    /// Mark the record as confirmed by the cloud.
    pub(crate) fn mark_synced(&mut self, cloud_id: BeanId) {
        if self.cloud_id.is_none() {
            self.cloud_id = Some(cloud_id);
        }
        self.is_new = false;
        self.is_dirty = false;
        self.dirty_fields.clear();
    }

    /// Gate shared by every mutating accessor.
    fn data_mut(&mut self) -> Result<&mut BeanData> {
        if self.readonly {
            return Err(Error::ReadOnlyViolation {
                channel: self.channel.clone(),
                id: self.local_id.clone(),
            });
        }
        match &mut self.body {
            BeanBody::Hydrated(data) => Ok(data),
            BeanBody::Proxy => Err(Error::ProxyNotHydrated {
                channel: self.channel.clone(),
                id: self.local_id.clone(),
            }),
        }
    }

    fn touch(&mut self, changed: bool, key: FieldKey) -> bool {
        if changed {
            self.is_dirty = true;
            self.dirty_fields.insert(key);
        }
        changed
    }
}
