//! Persistent queue of local changes the remote has not acknowledged yet.
//!
//! Entries are coalesced per record: create+update stays a create with the
//! merged fields, create+delete cancels out, anything followed by a delete
//! becomes a delete. The last acknowledged server revision of every record
//! is kept alongside in `_revisions`.

use crate::change::{Change, ChangeBatch, ChangeKind};
use crate::entity::{EntityKind, Mods, now_millis};
use crate::store::{Bookkeeping, Op, Result, VaultStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Fields never replicated: they only describe this device.
pub const DEVICE_FIELDS: [&str; 2] = ["filepath", "clientId"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub table: EntityKind,
    pub key: String,
    pub kind: ChangeKind,
    /// Full fields for creates, modified fields for updates, empty for deletes.
    pub fields: Mods,
    /// Server revision the change was made against.
    pub base_revision: u64,
    pub queued_at: i64,
}

pub fn entry_key(table: EntityKind, key: &str) -> String {
    format!("{}/{}", table.table_name(), key)
}

fn strip_device_fields(mut fields: Mods) -> Mods {
    for field in DEVICE_FIELDS {
        fields.remove(field);
    }
    fields
}

/// Fields a change contributes to the outbox.
fn change_fields(change: &Change) -> Mods {
    match change.kind {
        ChangeKind::Create => change
            .obj
            .as_ref()
            .and_then(|e| e.to_fields().ok())
            .map(|m| strip_device_fields(m.into_iter().collect()))
            .unwrap_or_default(),
        ChangeKind::Update => strip_device_fields(change.mods.clone()),
        ChangeKind::Delete => Mods::new(),
    }
}

/// Fold `change` into the pending entry for its record.
pub fn coalesce(existing: Option<OutboxEntry>, change: &Change, base_revision: u64) -> Option<OutboxEntry> {
    let fields = change_fields(change);
    let fresh = |kind| OutboxEntry {
        table: change.table,
        key: change.key.clone(),
        kind,
        fields: fields.clone(),
        base_revision,
        queued_at: now_millis(),
    };

    let Some(mut entry) = existing else {
        return Some(fresh(change.kind));
    };
    match (entry.kind, change.kind) {
        (ChangeKind::Create, ChangeKind::Delete) => None,
        (_, ChangeKind::Delete) => {
            entry.kind = ChangeKind::Delete;
            entry.fields.clear();
            Some(entry)
        }
        (ChangeKind::Delete, ChangeKind::Update) => Some(entry),
        (ChangeKind::Delete, ChangeKind::Create) => Some(OutboxEntry {
            base_revision: entry.base_revision,
            ..fresh(ChangeKind::Create)
        }),
        (_, _) => {
            entry.fields.extend(fields);
            Some(entry)
        }
    }
}

#[derive(Clone)]
pub struct Outbox {
    store: Arc<VaultStore>,
}

impl Outbox {
    pub fn new(store: Arc<VaultStore>) -> Self {
        Self { store }
    }

    /// Queue every local-origin change of `batch` accepted by `filter`.
    pub fn record(&self, batch: &ChangeBatch, filter: impl Fn(&Change) -> bool) -> Result<usize> {
        if !batch.origin.is_local() {
            return Ok(0);
        }
        let mut ops = Vec::new();
        let mut staged: std::collections::HashMap<String, Option<OutboxEntry>> = Default::default();

        for change in batch.changes.iter().filter(|c| filter(c)) {
            let key = entry_key(change.table, &change.key);
            let existing = match staged.remove(&key) {
                Some(staged) => staged,
                None => self.store.book_get(Bookkeeping::Outbox, &key)?,
            };
            let base = match &existing {
                Some(entry) => entry.base_revision,
                None => self.revision(change.table, &change.key)?,
            };
            staged.insert(key, coalesce(existing, change, base));
        }

        let count = staged.len();
        for (key, entry) in staged {
            ops.push(match entry {
                Some(entry) => Op::book_put(Bookkeeping::Outbox, key, &entry)?,
                None => Op::book_delete(Bookkeeping::Outbox, key),
            });
        }
        if !ops.is_empty() {
            self.store.transact(batch.origin.clone(), ops)?;
            debug!("outbox: {} record(s) updated", count);
        }
        Ok(count)
    }

    pub fn get(&self, table: EntityKind, key: &str) -> Result<Option<OutboxEntry>> {
        self.store.book_get(Bookkeeping::Outbox, &entry_key(table, key))
    }

    /// Pending entries of one table, oldest first.
    pub fn pending(&self, table: EntityKind) -> Result<Vec<OutboxEntry>> {
        let mut entries: Vec<OutboxEntry> = self
            .store
            .book_list::<OutboxEntry>(Bookkeeping::Outbox)?
            .into_iter()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.table == table)
            .collect();
        entries.sort_by_key(|e| e.queued_at);
        Ok(entries)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.store.book_list::<OutboxEntry>(Bookkeeping::Outbox)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// A create for this record has not been acknowledged yet.
    pub fn has_pending_create(&self, table: EntityKind, key: &str) -> bool {
        matches!(
            self.get(table, key),
            Ok(Some(OutboxEntry {
                kind: ChangeKind::Create,
                ..
            }))
        )
    }

    /// Last acknowledged server revision of a record (0 if never seen).
    pub fn revision(&self, table: EntityKind, key: &str) -> Result<u64> {
        Ok(self
            .store
            .book_get(Bookkeeping::Revisions, &entry_key(table, key))?
            .unwrap_or(0))
    }

    pub fn revision_op(table: EntityKind, key: &str, revision: u64) -> Result<Op> {
        Op::book_put(Bookkeeping::Revisions, entry_key(table, key), &revision)
    }

    /// Drop the entry and remember the revision the server assigned.
    pub fn ack(&self, table: EntityKind, key: &str, revision: u64) -> Result<()> {
        let ops = vec![
            Op::book_delete(Bookkeeping::Outbox, entry_key(table, key)),
            Self::revision_op(table, key, revision)?,
        ];
        self.store.transact(crate::origin::WriteOrigin::Device, ops)?;
        Ok(())
    }

    pub fn replace(&self, entry: &OutboxEntry) -> Result<()> {
        self.store
            .book_put(Bookkeeping::Outbox, &entry_key(entry.table, &entry.key), entry)
    }

    pub fn remove(&self, table: EntityKind, key: &str) -> Result<()> {
        self.store
            .book_delete(Bookkeeping::Outbox, &entry_key(table, key))
    }
}
