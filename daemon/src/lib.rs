//! # Beancache Daemon
//!
//! The async runtime around [`beancache_engine`]: a background worker that
//! drains the change log and applies push notifications, a hub that fans
//! change events out to subscribers, and environment configuration.
//!
//! ```no_run
//! use std::sync::Arc;
//! use beancache_daemon::{init_tracing, DaemonConfig, NotificationHub, SyncWorker};
//! use beancache_engine::{LocalStore, MemoryRemote, SyncCoordinator};
//!
//! # async fn run() -> beancache_daemon::Result<()> {
//! let config = DaemonConfig::from_env()?;
//! init_tracing(config.log_filter.as_deref());
//!
//! let hub = NotificationHub::new_shared();
//! let remote = Arc::new(MemoryRemote::new());
//! let coordinator = Arc::new(
//!     SyncCoordinator::new(Arc::new(LocalStore::in_memory()), remote.clone())
//!         .with_notifier(hub.clone())
//!         .with_config(config.coordinator_config()),
//! );
//!
//! let (_subscription, mut events) = hub.subscribe(Some("orders"));
//! let worker = SyncWorker::spawn(coordinator, remote, &config);
//! worker.trigger_sync().await?;
//! while let Ok(event) = events.try_recv() {
//!     println!("{} {} {:?}", event.channel, event.id, event.kind);
//! }
//! worker.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hub;
pub mod telemetry;
pub mod worker;

pub use config::{ConfigError, DaemonConfig};
pub use error::{DaemonError, Result};
pub use hub::{EventReceiver, EventSender, NotificationHub};
pub use telemetry::init_tracing;
pub use worker::{PushReport, PushTrigger, SyncWorker, WorkerHandle};
