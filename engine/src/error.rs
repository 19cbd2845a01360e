//! Error types for the Beancache engine.

use crate::{BeanId, Channel};
use thiserror::Error;

/// All possible errors from the Beancache engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Lookup errors
    #[error("bean not found: {channel}/{id}")]
    NotFound { channel: Channel, id: BeanId },

    #[error("channel not booted: {0}")]
    ChannelNotBooted(Channel),

    // Local validation errors
    #[error("bean not initialized: {0}")]
    NotInitialized(String),

    #[error("bean is read-only: {channel}/{id}")]
    ReadOnlyViolation { channel: Channel, id: BeanId },

    #[error("invalid list entry: {0}")]
    InvalidEntry(String),

    #[error("index {index} out of range for list '{property}' of length {len}")]
    IndexOutOfRange {
        property: String,
        index: usize,
        len: usize,
    },

    #[error("invalid field path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("bean is an unhydrated proxy: {channel}/{id}")]
    ProxyNotHydrated { channel: Channel, id: BeanId },

    #[error("bean already exists: {channel}/{id}")]
    BeanAlreadyExists { channel: Channel, id: BeanId },

    #[error("bean has a pending delete: {channel}/{id}")]
    PendingDelete { channel: Channel, id: BeanId },

    #[error("bean identity cannot change once stored: {channel}/{id}")]
    IdentityChanged { channel: Channel, id: BeanId },

    // Remote errors
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("remote conflict on {channel}/{id}: {reason}")]
    RemoteConflict {
        channel: Channel,
        id: BeanId,
        reason: String,
    },

    // Persistence errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl Error {
    pub(crate) fn not_found(channel: &str, id: &str) -> Self {
        Error::NotFound {
            channel: channel.to_string(),
            id: id.to_string(),
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RemoteUnavailable(_) | Error::Storage(_))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::ChannelNotBooted("orders".into());
        assert_eq!(err.to_string(), "channel not booted: orders");

        let err = Error::IndexOutOfRange {
            property: "items".into(),
            index: 10,
            len: 5,
        };
        assert_eq!(
            err.to_string(),
            "index 10 out of range for list 'items' of length 5"
        );

        let err = Error::not_found("orders", "o-1");
        assert_eq!(err.to_string(), "bean not found: orders/o-1");
    }

    #[test]
    fn retryable_kinds() {
        assert!(Error::RemoteUnavailable("offline".into()).is_retryable());
        assert!(!Error::InvalidEntry("empty id".into()).is_retryable());
        assert!(!Error::RemoteConflict {
            channel: "orders".into(),
            id: "o-1".into(),
            reason: "stale".into(),
        }
        .is_retryable());
    }
}
