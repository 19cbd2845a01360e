//! # Beancache Engine
//!
//! A local-first bean cache for mobile and desktop clients.
//!
//! Beans are small records grouped into channels. The device keeps a durable
//! copy of every bean, lets the application read, query and edit them while
//! offline, and synchronizes local changes with a remote service when it can.
//!
//! ## Design Principles
//!
//! - **No IO**: storage and network are collaborators behind traits
//!   ([`DurableStorage`], [`RemoteService`], [`Notifier`])
//! - **Local first**: every save is durable locally before the remote is
//!   contacted; an unreachable remote only leaves the change pending
//! - **Dirty precedence**: remote updates never overwrite unsaved or
//!   unconfirmed local edits
//!
//! ## Core Concepts
//!
//! ### Beans
//!
//! A [`BeanRecord`] holds identity (channel, local id, cloud id), lifecycle
//! flags and, once hydrated, an [`AttributeStore`] of path-addressed values
//! plus list properties managed by a [`ListManager`]. A record holding only
//! identity is a *proxy*.
//!
//! Callers work with [`Bean`] handles. Clones of a handle share one record,
//! and the coordinator hands out the same handle for the same bean while any
//! clone is alive.
//!
//! ### Storage
//!
//! The [`LocalStore`] is the canonical copy of every bean. It tracks which
//! channels are booted and owns the [`ChangeLog`] of changes waiting for the
//! remote.
//!
//! ### Sync
//!
//! The [`SyncCoordinator`] implements the bean lifecycle: `new_instance`,
//! `read_by_id`, `save`, `delete`, `refresh`, queries, channel boot, remote
//! update application and change-log draining.
//!
//! ## Quick Start
//!
//! ```rust
//! use beancache_engine::{
//!     Criteria, LocalStore, MemoryRemote, SyncCoordinator, SyncStatus,
//! };
//! use std::sync::Arc;
//!
//! let remote = Arc::new(MemoryRemote::new());
//! let sync = SyncCoordinator::new(Arc::new(LocalStore::in_memory()), remote.clone());
//! sync.boot_channel("orders").unwrap();
//!
//! // Create and save a bean
//! let order = sync.new_instance("orders").unwrap();
//! order.set_value("status", "open").unwrap();
//! order.set_value("/shipping/region", "west").unwrap();
//! assert_eq!(sync.save(&order).unwrap(), SyncStatus::Synced);
//! assert!(!order.is_dirty());
//!
//! // Query the channel
//! let criteria = Criteria::from_pairs([("status", "open"), ("shipping.region", "west")]).unwrap();
//! let open = sync.query_by_equals_all("orders", criteria).unwrap();
//! assert_eq!(open.len(), 1);
//!
//! // Offline saves stay pending until the next sync pass
//! remote.set_online(false);
//! order.set_value("status", "closed").unwrap();
//! assert_eq!(sync.save(&order).unwrap(), SyncStatus::Pending);
//! remote.set_online(true);
//! assert_eq!(sync.sync_pending().synced, 1);
//! ```

pub mod attributes;
pub mod bean;
pub mod changelog;
pub mod codec;
pub mod coordinator;
pub mod error;
pub mod list;
pub mod notify;
pub mod path;
pub mod query;
pub mod reconcile;
pub mod record;
pub mod remote;
pub mod storage;
pub mod store;

// Re-export main types at crate root
pub use attributes::AttributeStore;
pub use bean::{Bean, BeanState};
pub use changelog::{ChangeEntry, ChangeLog, ChangeOp};
pub use coordinator::{
    Admin, CoordinatorConfig, ProxyPartition, SyncCoordinator, SyncMode, SyncReport, SyncStatus,
};
pub use error::{Error, Result};
pub use list::{BeanList, BeanListEntry, ListManager};
pub use notify::{ChangeEvent, ChangeKind, CollectingNotifier, NoopNotifier, Notifier};
pub use path::FieldPath;
pub use query::{Combinator, Comparator, Criteria, Polarity, Query, QueryMode};
pub use record::{BeanBody, BeanData, BeanKey, BeanRecord, FieldKey, Origin};
pub use remote::{AttributeSnapshot, MemoryRemote, PushAck, RemoteError, RemoteService};
pub use storage::{DurableStorage, MemoryStorage};
pub use store::LocalStore;

/// Type aliases for clarity
pub type Channel = String;
pub type BeanId = String;
pub type Revision = u64;
pub type Timestamp = u64;
