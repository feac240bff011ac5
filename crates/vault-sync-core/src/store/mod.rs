//! Embedded per-vault database.
//!
//! `VaultStore` keeps one redb table per entity kind (values are the
//! entity's JSON) plus bookkeeping tables. `transact` applies a list of
//! operations in a single write transaction, computes the resulting
//! `ChangeBatch`, commits, and only then publishes the batch to change-feed
//! subscribers.

pub mod behavior;
pub mod database;
pub mod feed;
pub mod table;

pub use behavior::{FilepathBase, TableBehavior, behavior_for};
pub use database::VaultDatabase;
pub use feed::{SearchIndex, UiBatch, UiFeed};
pub use table::{FilepathRegister, SaveOptions, Table, TableContext, TableError};

use crate::change::{Change, ChangeBatch};
use crate::entity::{Entity, EntityKind, Mods};
use crate::node_id::NodeId;
use crate::origin::WriteOrigin;
use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

type Bytes = TableDefinition<'static, &'static str, &'static [u8]>;

fn entity_table(kind: EntityKind) -> Bytes {
    TableDefinition::new(kind.table_name())
}

/// Tables that hold sync bookkeeping rather than entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bookkeeping {
    LocalConflicts,
    Outbox,
    Revisions,
    Meta,
}

impl Bookkeeping {
    pub const ALL: [Bookkeeping; 4] = [
        Bookkeeping::LocalConflicts,
        Bookkeeping::Outbox,
        Bookkeeping::Revisions,
        Bookkeeping::Meta,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Bookkeeping::LocalConflicts => "_localConflicts",
            Bookkeeping::Outbox => "_outbox",
            Bookkeeping::Revisions => "_revisions",
            Bookkeeping::Meta => "_meta",
        }
    }

    fn definition(self) -> Bytes {
        TableDefinition::new(self.name())
    }
}

const SYNC_NODES_KEY: &str = "syncNodes";

/// One operation inside a transaction.
#[derive(Debug, Clone)]
pub enum Op {
    /// Insert or replace a whole entity.
    Put(Entity),
    Delete { table: EntityKind, key: String },
    /// Apply field-level mods to an existing entity. Missing keys are skipped.
    Modify {
        table: EntityKind,
        key: String,
        mods: Mods,
    },
    /// Write (`Some`) or remove (`None`) a bookkeeping row. Never produces a change.
    Book {
        table: Bookkeeping,
        key: String,
        value: Option<Vec<u8>>,
    },
}

impl Op {
    pub fn delete(table: EntityKind, key: impl Into<String>) -> Self {
        Op::Delete {
            table,
            key: key.into(),
        }
    }

    pub fn modify(table: EntityKind, key: impl Into<String>, mods: Mods) -> Self {
        Op::Modify {
            table,
            key: key.into(),
            mods,
        }
    }

    pub fn book_put<T: Serialize>(
        table: Bookkeeping,
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self> {
        Ok(Op::Book {
            table,
            key: key.into(),
            value: Some(serde_json::to_vec(value)?),
        })
    }

    pub fn book_delete(table: Bookkeeping, key: impl Into<String>) -> Self {
        Op::Book {
            table,
            key: key.into(),
            value: None,
        }
    }
}

fn read_json<T, R>(table: &R, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

pub struct VaultStore {
    db: Database,
    vault_id: String,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Arc<ChangeBatch>>>>,
}

impl VaultStore {
    /// Open or create the database file at `path`.
    pub fn open(path: impl AsRef<Path>, vault_id: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Database::create(path)?, vault_id.into())
    }

    /// Database kept entirely in memory.
    pub fn in_memory(vault_id: impl Into<String>) -> Result<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db, vault_id.into())
    }

    fn init(db: Database, vault_id: String) -> Result<Self> {
        // Ensure tables exist so read transactions never miss one
        let tx = db.begin_write()?;
        for kind in EntityKind::ALL {
            tx.open_table(entity_table(kind))?;
        }
        for book in Bookkeeping::ALL {
            tx.open_table(book.definition())?;
        }
        tx.commit()?;
        Ok(Self {
            db,
            vault_id,
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn vault_id(&self) -> &str {
        &self.vault_id
    }

    /// Receive every committed, non-empty batch.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Arc<ChangeBatch>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    fn publish(&self, batch: ChangeBatch) {
        let batch = Arc::new(batch);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(batch.clone()).is_ok());
    }

    // ========== Transactions ==========

    /// Apply `ops` atomically. A failing op aborts the whole transaction.
    pub fn transact(&self, origin: WriteOrigin, ops: Vec<Op>) -> Result<ChangeBatch> {
        let tx = self.db.begin_write()?;
        let mut changes = Vec::new();

        for op in ops {
            match op {
                Op::Put(entity) => {
                    let mut table = tx.open_table(entity_table(entity.kind()))?;
                    let old: Option<Entity> = read_json(&table, &entity.id)?;
                    if old.as_ref() == Some(&entity) {
                        continue;
                    }
                    let bytes = serde_json::to_vec(&entity)?;
                    table.insert(entity.id.as_str(), bytes.as_slice())?;
                    changes.push(match old {
                        Some(old) => Change::update(old, entity, origin.clone()),
                        None => Change::create(entity, origin.clone()),
                    });
                }
                Op::Delete { table: kind, key } => {
                    let mut table = tx.open_table(entity_table(kind))?;
                    let old: Option<Entity> = read_json(&table, &key)?;
                    if let Some(old) = old {
                        table.remove(key.as_str())?;
                        changes.push(Change::delete(old, origin.clone()));
                    }
                }
                Op::Modify {
                    table: kind,
                    key,
                    mods,
                } => {
                    let mut table = tx.open_table(entity_table(kind))?;
                    let Some(old) = read_json::<Entity, _>(&table, &key)? else {
                        debug!("modify on missing {} {}", kind, key);
                        continue;
                    };
                    let new = old.apply_mods(&mods)?;
                    if new == old {
                        continue;
                    }
                    let bytes = serde_json::to_vec(&new)?;
                    table.insert(key.as_str(), bytes.as_slice())?;
                    changes.push(Change::update(old, new, origin.clone()));
                }
                Op::Book { table, key, value } => {
                    let mut table = tx.open_table(table.definition())?;
                    match value {
                        Some(bytes) => {
                            table.insert(key.as_str(), bytes.as_slice())?;
                        }
                        None => {
                            table.remove(key.as_str())?;
                        }
                    }
                }
            }
        }
        tx.commit()?;

        let batch = ChangeBatch {
            vault_id: self.vault_id.clone(),
            origin,
            changes,
        };
        if !batch.is_empty() {
            debug!(
                "committed {} change(s) from {}",
                batch.changes.len(),
                batch.origin
            );
            self.publish(batch.clone());
        }
        Ok(batch)
    }

    // ========== Entity reads ==========

    pub fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(entity_table(kind))?;
        read_json(&table, id)
    }

    /// Up to `limit` entities with ids strictly greater than `after`, ascending.
    pub fn list_page(&self, kind: EntityKind, after: Option<&str>, limit: usize) -> Result<Vec<Entity>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(entity_table(kind))?;
        let lower = match after {
            Some(after) => Bound::Excluded(after),
            None => Bound::Unbounded,
        };
        let mut out = Vec::new();
        for item in table.range::<&str>((lower, Bound::Unbounded))? {
            if out.len() >= limit {
                break;
            }
            let (_, value) = item?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    pub fn list_all(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        self.list_page(kind, None, usize::MAX)
    }

    // ========== Bookkeeping ==========

    pub fn book_get<T: DeserializeOwned>(&self, table: Bookkeeping, key: &str) -> Result<Option<T>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(table.definition())?;
        read_json(&table, key)
    }

    pub fn book_list<T: DeserializeOwned>(&self, table: Bookkeeping) -> Result<Vec<(String, T)>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(table.definition())?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            out.push((key.value().to_string(), serde_json::from_slice(value.value())?));
        }
        Ok(out)
    }

    pub fn book_put<T: Serialize>(&self, table: Bookkeeping, key: &str, value: &T) -> Result<()> {
        self.transact(WriteOrigin::Device, vec![Op::book_put(table, key, value)?])
            .map(|_| ())
    }

    pub fn book_delete(&self, table: Bookkeeping, key: &str) -> Result<()> {
        self.transact(WriteOrigin::Device, vec![Op::book_delete(table, key)])
            .map(|_| ())
    }

    // ========== Sync nodes ==========

    pub fn sync_nodes(&self) -> Result<BTreeSet<NodeId>> {
        Ok(self
            .book_get(Bookkeeping::Meta, SYNC_NODES_KEY)?
            .unwrap_or_default())
    }

    /// Remember `node` as a remote endpoint of this vault.
    pub fn register_sync_node(&self, node: NodeId) -> Result<()> {
        let mut nodes = self.sync_nodes()?;
        if nodes.insert(node) {
            self.book_put(Bookkeeping::Meta, SYNC_NODES_KEY, &nodes)?;
        }
        Ok(())
    }

    /// Origin is `Remote(n)` and `n` is a registered sync node.
    pub fn is_remote_change(&self, origin: &WriteOrigin) -> bool {
        match origin {
            WriteOrigin::Remote(node) => self
                .sync_nodes()
                .map(|nodes| nodes.contains(node))
                .unwrap_or(false),
            _ => false,
        }
    }
}
