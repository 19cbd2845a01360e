//! Change notifications for beans a caller currently holds.

use crate::{BeanId, BeanKey, Channel};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Updated,
    Deleted,
}

/// A remote-origin change applied to a held bean.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub channel: Channel,
    pub id: BeanId,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(key: &BeanKey, kind: ChangeKind) -> Self {
        Self {
            channel: key.channel.clone(),
            id: key.id.clone(),
            kind,
        }
    }
}

/// Receives change events. Called while the bean's key lock is held, so
/// events for one bean arrive in the order they were applied; implementations
/// must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: ChangeEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _event: ChangeEvent) {}
}

/// Records every event, for tests.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    events: Mutex<Vec<ChangeEvent>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.lock().clone()
    }

    /// Drain the recorded events.
    pub fn take(&self) -> Vec<ChangeEvent> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ChangeEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, event: ChangeEvent) {
        self.lock().push(event);
    }
}
