//! Flat attribute storage for one bean.
//!
//! Values are keyed by the canonical form of their [`FieldPath`]. String
//! values and binary values share the same path space but live in separate
//! maps, so a path can be read back only through the accessor it was
//! written with.

use crate::error::Result;
use crate::path::FieldPath;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field-path to value mapping for one bean instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeStore {
    #[serde(default)]
    values: BTreeMap<String, String>,
    #[serde(default)]
    binaries: BTreeMap<String, Vec<u8>>,
}

impl AttributeStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from `(path, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut store = Self::new();
        for (path, value) in pairs {
            store.set(path.as_ref(), value)?;
        }
        Ok(store)
    }

    /// Get a string value.
    pub fn get(&self, path: &str) -> Result<Option<&str>> {
        let key = FieldPath::parse(path)?.canonical();
        Ok(self.values.get(&key).map(String::as_str))
    }

    /// Set a string value. Returns `true` if the stored value changed.
    pub fn set(&mut self, path: &str, value: impl Into<String>) -> Result<bool> {
        let key = FieldPath::parse(path)?.canonical();
        let value = value.into();
        if self.values.get(&key) == Some(&value) {
            return Ok(false);
        }
        self.values.insert(key, value);
        Ok(true)
    }

    /// Get a binary value.
    pub fn get_binary(&self, path: &str) -> Result<Option<&[u8]>> {
        let key = FieldPath::parse(path)?.canonical();
        Ok(self.binaries.get(&key).map(Vec::as_slice))
    }

    /// Set a binary value. Returns `true` if the stored value changed.
    pub fn set_binary(&mut self, path: &str, value: impl Into<Vec<u8>>) -> Result<bool> {
        let key = FieldPath::parse(path)?.canonical();
        let value = value.into();
        if self.binaries.get(&key) == Some(&value) {
            return Ok(false);
        }
        self.binaries.insert(key, value);
        Ok(true)
    }

    /// Paths of string values stored beneath `prefix`, in path order.
    pub fn children(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = FieldPath::parse(prefix)?;
        Ok(self
            .values
            .keys()
            .filter(|key| {
                FieldPath::parse(key)
                    .map(|path| path.is_nested_under(&prefix))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    /// Look up a value by canonical key, skipping path parsing.
    pub(crate) fn value_by_key(&self, key: &str) -> Option<&String> {
        self.values.get(key)
    }

    /// Copy (or remove) a single value from `source`.
    pub(crate) fn copy_value_from(&mut self, source: &AttributeStore, key: &str) {
        match source.values.get(key) {
            Some(value) => self.values.insert(key.to_string(), value.clone()),
            None => self.values.remove(key),
        };
    }

    pub(crate) fn copy_binary_from(&mut self, source: &AttributeStore, key: &str) {
        match source.binaries.get(key) {
            Some(value) => self.binaries.insert(key.to_string(), value.clone()),
            None => self.binaries.remove(key),
        };
    }

    /// Iterate over string values in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of string and binary values.
    pub fn len(&self) -> usize {
        self.values.len() + self.binaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
