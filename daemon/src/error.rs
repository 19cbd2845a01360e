//! Unified error handling for the daemon.

use crate::config::ConfigError;

/// Daemon error type.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("Engine error: {0}")]
    Engine(#[from] beancache_engine::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Sync worker is not running")]
    WorkerStopped,
}

impl DaemonError {
    /// Whether retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DaemonError::Engine(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;
