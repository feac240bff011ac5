//! Divergences between the vault directory and replicated records that need
//! an explicit choice.
//!
//! The importer parks a record here when its file vanished from a remote
//! vault while the app was not watching. Accepting local changes deletes the
//! record everywhere; accepting remote changes writes it back to disk.

use crate::entity::{Entity, EntityKind, now_millis};
use crate::events::SyncEvent;
use crate::fs::FileSystem;
use crate::store::{Bookkeeping, Op, SaveOptions, StoreError, TableError, VaultDatabase};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Table error: {0}")]
    Table(#[from] TableError),
}

pub type Result<T> = std::result::Result<T, ConflictError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictReason {
    /// The record has a filepath but the file is gone.
    MissingOnDisk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalConflict {
    pub id: String,
    pub kind: EntityKind,
    /// Record as it was when the divergence was detected.
    pub entity: Entity,
    pub detected_at: i64,
    pub reason: ConflictReason,
}

impl LocalConflict {
    pub fn missing_on_disk(entity: Entity) -> Self {
        Self {
            id: entity.id.clone(),
            kind: entity.kind(),
            entity,
            detected_at: now_millis(),
            reason: ConflictReason::MissingOnDisk,
        }
    }

    fn key(&self) -> String {
        conflict_key(self.kind, &self.id)
    }
}

fn conflict_key(kind: EntityKind, id: &str) -> String {
    format!("{}/{}", kind.table_name(), id)
}

/// Deletion order for accept-local: contents before the folders holding them.
fn delete_rank(kind: EntityKind) -> u8 {
    match kind {
        EntityKind::Document | EntityKind::Event | EntityKind::Task => 0,
        EntityKind::Image | EntityKind::Integration => 1,
        EntityKind::Folder => 2,
    }
}

pub struct ConflictResolver<F: FileSystem> {
    db: Arc<VaultDatabase<F>>,
}

impl<F: FileSystem + 'static> ConflictResolver<F> {
    pub fn new(db: Arc<VaultDatabase<F>>) -> Self {
        Self { db }
    }

    fn vault_id(&self) -> String {
        self.db.context().vault.id.clone()
    }

    pub fn list(&self) -> Result<Vec<LocalConflict>> {
        Ok(self
            .db
            .store()
            .book_list::<LocalConflict>(Bookkeeping::LocalConflicts)?
            .into_iter()
            .map(|(_, c)| c)
            .collect())
    }

    pub fn contains(&self, kind: EntityKind, id: &str) -> Result<bool> {
        Ok(self
            .db
            .store()
            .book_get::<LocalConflict>(Bookkeeping::LocalConflicts, &conflict_key(kind, id))?
            .is_some())
    }

    /// Park conflicts. Announces the count when non-zero.
    pub fn record(&self, conflicts: Vec<LocalConflict>) -> Result<usize> {
        if conflicts.is_empty() {
            return Ok(0);
        }
        let count = conflicts.len();
        let ops = conflicts
            .iter()
            .map(|c| Op::book_put(Bookkeeping::LocalConflicts, c.key(), c))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.db
            .store()
            .transact(crate::origin::WriteOrigin::Device, ops)?;

        info!("{} local conflict(s) detected in {}", count, self.db.context().vault.name);
        self.db.context().events.emit(SyncEvent::ConflictsDetected {
            vault_id: self.vault_id(),
            count,
        });
        Ok(count)
    }

    fn clear(&self, conflicts: &[LocalConflict]) -> Result<()> {
        let ops = conflicts
            .iter()
            .map(|c| Op::book_delete(Bookkeeping::LocalConflicts, c.key()))
            .collect();
        self.db
            .store()
            .transact(crate::origin::WriteOrigin::Device, ops)?;
        Ok(())
    }

    /// Keep the local state: the records are deleted with this client's
    /// origin so the deletion replicates.
    pub async fn accept_local_changes(&self, conflicts: &[LocalConflict]) -> Result<usize> {
        let mut by_kind: BTreeMap<(u8, EntityKind), Vec<String>> = BTreeMap::new();
        for conflict in conflicts {
            by_kind
                .entry((delete_rank(conflict.kind), conflict.kind))
                .or_default()
                .push(conflict.id.clone());
        }

        let mut deleted = 0;
        for ((_, kind), ids) in by_kind {
            deleted += self
                .db
                .table(kind)
                .delete_bulk(&ids, SaveOptions::default())
                .await?
                .len();
        }
        self.clear(conflicts)?;

        self.db.context().events.emit(SyncEvent::ConflictsResolved {
            vault_id: self.vault_id(),
            accepted: "local".into(),
            count: conflicts.len(),
        });
        Ok(deleted)
    }

    /// Keep the replicated state: write the records back into the vault,
    /// folders first.
    pub async fn accept_remote_changes(&self, conflicts: &[LocalConflict]) -> Result<usize> {
        let mut by_kind: BTreeMap<EntityKind, Vec<String>> = BTreeMap::new();
        for conflict in conflicts {
            by_kind
                .entry(conflict.kind)
                .or_default()
                .push(conflict.id.clone());
        }

        // EntityKind orders folders first
        let mut written = 0;
        for (kind, ids) in by_kind {
            let table = self.db.table(kind);
            let entities = table.list_by_ids(&ids)?;
            written += table.sync_entities_to_device(entities).await?;
        }
        self.clear(conflicts)?;

        self.db.context().events.emit(SyncEvent::ConflictsResolved {
            vault_id: self.vault_id(),
            accepted: "remote".into(),
            count: conflicts.len(),
        });
        Ok(written)
    }
}
