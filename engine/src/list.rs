//! List properties: ordered references from a parent bean to other beans.

use crate::error::{Error, Result};
use crate::{BeanId, Channel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A reference to another bean inside a list property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeanListEntry {
    /// Channel of the referenced bean
    pub channel: Channel,
    /// Id of the referenced bean
    pub id: BeanId,
}

impl BeanListEntry {
    pub fn new(channel: impl Into<Channel>, id: impl Into<BeanId>) -> Self {
        Self {
            channel: channel.into(),
            id: id.into(),
        }
    }

    /// Reject entries that cannot reference anything.
    pub fn validate(&self) -> Result<()> {
        if self.channel.trim().is_empty() {
            return Err(Error::InvalidEntry(format!(
                "entry for id '{}' has an empty channel",
                self.id
            )));
        }
        if self.id.trim().is_empty() {
            return Err(Error::InvalidEntry(format!(
                "entry in channel '{}' has an empty id",
                self.channel
            )));
        }
        Ok(())
    }
}

/// An ordered list of bean references. Position in the list is the ordinal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeanList {
    entries: Vec<BeanListEntry>,
}

impl BeanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<BeanListEntry>) -> Self {
        Self { entries }
    }

    pub fn push(&mut self, entry: BeanListEntry) {
        self.entries.push(entry);
    }

    pub fn get(&self, ordinal: usize) -> Option<&BeanListEntry> {
        self.entries.get(ordinal)
    }

    pub fn entries(&self) -> &[BeanListEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &BeanListEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<BeanListEntry> for BeanList {
    fn from_iter<I: IntoIterator<Item = BeanListEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// All list properties of one bean, keyed by property name.
///
/// Every mutating method returns whether the stored state changed, which the
/// owning record uses for dirty tracking. An empty list is never stored:
/// clearing a property removes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListManager {
    lists: BTreeMap<String, BeanList>,
}

impl ListManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a list property. Absent properties read as empty.
    pub fn read(&self, property: &str) -> BeanList {
        self.lists.get(property).cloned().unwrap_or_default()
    }

    /// Replace a list property wholesale. `None` or an empty list clears it.
    pub fn save(&mut self, property: &str, list: Option<BeanList>) -> Result<bool> {
        let list = match list {
            Some(list) if !list.is_empty() => list,
            _ => return Ok(self.clear(property)),
        };
        for entry in list.iter() {
            entry.validate()?;
        }
        if self.lists.get(property) == Some(&list) {
            return Ok(false);
        }
        self.lists.insert(property.to_string(), list);
        Ok(true)
    }

    /// Remove every entry of a list property.
    pub fn clear(&mut self, property: &str) -> bool {
        self.lists.remove(property).is_some()
    }

    /// Append an entry at the end of a list property.
    pub fn add(&mut self, property: &str, entry: BeanListEntry) -> Result<()> {
        entry.validate()?;
        self.lists
            .entry(property.to_string())
            .or_default()
            .push(entry);
        Ok(())
    }

    /// Remove the entry at `index`; later entries shift down by one.
    pub fn remove_at(&mut self, property: &str, index: usize) -> Result<BeanListEntry> {
        match self.lists.get_mut(property) {
            Some(list) if index < list.len() => {
                let removed = list.entries.remove(index);
                if list.is_empty() {
                    self.lists.remove(property);
                }
                Ok(removed)
            }
            other => Err(Error::IndexOutOfRange {
                property: property.to_string(),
                index,
                len: other.map_or(0, |list| list.len()),
            }),
        }
    }

    /// Names of the list properties that hold at least one entry.
    pub fn properties(&self) -> impl Iterator<Item = &str> {
        self.lists.keys().map(String::as_str)
    }

    pub(crate) fn copy_property_from(&mut self, source: &ListManager, property: &str) {
        match source.lists.get(property) {
            Some(list) => self.lists.insert(property.to_string(), list.clone()),
            None => self.lists.remove(property),
        };
    }
}
