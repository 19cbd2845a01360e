//! Byte encoding for everything the local store persists.
//!
//! Values are wrapped in a versioned JSON envelope so that stored data written
//! by a newer engine is rejected instead of being misread.

use crate::error::{Error, Result};
use crate::{BeanRecord, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Version of the stored envelope format.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    format_version: u32,
    payload: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionProbe {
    format_version: u32,
}

/// A bean as persisted, with its insertion sequence number so channel
/// iteration order survives a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBean {
    pub seq: u64,
    pub record: BeanRecord,
}

/// Persisted marker for a booted channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootMarker {
    pub booted_at: Timestamp,
}

/// Encode a value into its stored byte form.
pub fn encode<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(&Envelope {
        format_version: FORMAT_VERSION,
        payload,
    })
    .map_err(|e| Error::Codec(e.to_string()))
}

/// Decode a value from its stored byte form.
///
/// The version is checked before the payload is parsed, so a newer payload
/// shape is reported as a version mismatch.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let probe: VersionProbe =
        serde_json::from_slice(bytes).map_err(|e| Error::Codec(e.to_string()))?;

    if probe.format_version > FORMAT_VERSION {
        return Err(Error::Codec(format!(
            "unsupported format version: {} (max supported: {})",
            probe.format_version, FORMAT_VERSION
        )));
    }

    let envelope: Envelope<T> =
        serde_json::from_slice(bytes).map_err(|e| Error::Codec(e.to_string()))?;
    Ok(envelope.payload)
}
