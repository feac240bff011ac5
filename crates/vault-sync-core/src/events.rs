//! Event infrastructure for vault-sync-core.
//!
//! `SyncEvent` announces things outside the database change feed (import
//! progress, conflicts, connection state). `EventBus` fans them out to
//! subscribers held alive by a `Subscription`.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Notifications emitted by the importer, resolver and sync engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    /// The vault root disappeared; nothing further is processed for it.
    VaultDeleted { vault_id: String },
    /// Local-change import advanced.
    ImportProgress {
        vault_id: String,
        done: usize,
        total: usize,
        unsupported: usize,
    },
    /// Supervisor moved to another state.
    SyncStateChanged { vault_id: String, state: String },
    /// Divergences were parked for an explicit choice.
    ConflictsDetected { vault_id: String, count: usize },
    /// Parked divergences were resolved, keeping `accepted` ("local" or "remote").
    ConflictsResolved {
        vault_id: String,
        accepted: String,
        count: usize,
    },
    /// A config file in the vault was added, changed or removed.
    ConfigChanged { vault_id: String, path: String },
    /// Event records changed; scheduled reminders must be recomputed.
    RemindersInvalidated { vault_id: String },
    /// A pull applied remote changes to one table.
    RemoteFetched {
        vault_id: String,
        table: String,
        count: usize,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events, drop it to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Event bus for publishing sync events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    /// Forward every event into an unbounded channel.
    pub fn subscribe_channel(
        self: &Arc<Self>,
    ) -> (Subscription, tokio::sync::mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let sub = self.subscribe(move |event| {
            let _ = tx.send(event);
        });
        (sub, rx)
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run while emit holds the read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Snapshot so callbacks may subscribe without deadlocking
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}
