//! Configuration management for the daemon.

use std::env;
use std::time::Duration;

use beancache_engine::{CoordinatorConfig, SyncMode};
use tracing_subscriber::EnvFilter;

const DEFAULT_SYNC_INTERVAL_MS: u64 = 30_000;

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Time between background sync passes
    pub sync_interval: Duration,
    /// When saves and deletes contact the remote
    pub sync_mode: SyncMode,
    /// Tracing filter directive, if set
    pub log_filter: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_millis(DEFAULT_SYNC_INTERVAL_MS),
            sync_mode: SyncMode::Immediate,
            log_filter: None,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the environment, after reading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let sync_interval = match lookup("BEANCACHE_SYNC_INTERVAL_MS") {
            Some(raw) => {
                let millis: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidSyncInterval(raw.clone()))?;
                if millis == 0 {
                    return Err(ConfigError::InvalidSyncInterval(raw));
                }
                Duration::from_millis(millis)
            }
            None => Duration::from_millis(DEFAULT_SYNC_INTERVAL_MS),
        };

        let sync_mode = match lookup("BEANCACHE_SYNC_MODE") {
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "immediate" => SyncMode::Immediate,
                "deferred" => SyncMode::Deferred,
                _ => return Err(ConfigError::InvalidSyncMode(raw)),
            },
            None => SyncMode::Immediate,
        };

        let log_filter = match lookup("BEANCACHE_LOG") {
            Some(raw) if !raw.trim().is_empty() => {
                EnvFilter::try_new(&raw).map_err(|_| ConfigError::InvalidLogFilter(raw.clone()))?;
                Some(raw)
            }
            _ => None,
        };

        Ok(Self {
            sync_interval,
            sync_mode,
            log_filter,
        })
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Engine-side settings derived from this configuration.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            sync_mode: self.sync_mode,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid BEANCACHE_SYNC_INTERVAL_MS value: {0:?} (expected milliseconds > 0)")]
    InvalidSyncInterval(String),

    #[error("Invalid BEANCACHE_SYNC_MODE value: {0:?} (expected immediate or deferred)")]
    InvalidSyncMode(String),

    #[error("Invalid BEANCACHE_LOG filter: {0:?}")]
    InvalidLogFilter(String),
}
