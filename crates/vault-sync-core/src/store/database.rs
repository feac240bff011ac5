//! All tables of one vault plus the task that feeds committed batches
//! through them.

use super::table::{Result, Table, TableContext};
use super::VaultStore;
use crate::change::ChangeBatch;
use crate::entity::EntityKind;
use crate::fs::FileSystem;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct VaultDatabase<F: FileSystem> {
    ctx: Arc<TableContext<F>>,
    tables: BTreeMap<EntityKind, Table<F>>,
}

impl<F: FileSystem + 'static> VaultDatabase<F> {
    pub fn new(ctx: TableContext<F>) -> Self {
        let ctx = Arc::new(ctx);
        let tables = EntityKind::ALL
            .into_iter()
            .map(|kind| (kind, Table::new(kind, ctx.clone())))
            .collect();
        Self { ctx, tables }
    }

    pub fn context(&self) -> &Arc<TableContext<F>> {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<VaultStore> {
        &self.ctx.store
    }

    pub fn table(&self, kind: EntityKind) -> &Table<F> {
        // Every kind gets a table in `new`
        &self.tables[&kind]
    }

    pub fn documents(&self) -> &Table<F> {
        self.table(EntityKind::Document)
    }

    pub fn folders(&self) -> &Table<F> {
        self.table(EntityKind::Folder)
    }

    /// Run every table's change-feed processing for one batch, folders first.
    /// All tables run even if one fails; the first error is returned.
    pub async fn apply_batch(&self, batch: &ChangeBatch) -> Result<()> {
        let mut first_err = None;
        for table in self.tables.values() {
            if let Err(e) = table.register_local_sync(batch).await {
                error!("{} change processing failed: {}", table.kind(), e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Process every batch already queued on `rx`, including batches produced
    /// while processing. Returns how many were handled.
    pub async fn drain(&self, rx: &mut UnboundedReceiver<Arc<ChangeBatch>>) -> Result<usize> {
        let mut handled = 0;
        while let Ok(batch) = rx.try_recv() {
            self.apply_batch(&batch).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Subscribe to the store and process batches until the store side closes.
    pub fn spawn_change_feed(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.store().subscribe();
        let db = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                // Errors are logged per table inside apply_batch
                let _ = db.apply_batch(&batch).await;
            }
        })
    }

    /// Write every record that belongs on disk, folders first.
    pub async fn sync_all_to_device(&self) -> Result<usize> {
        let mut written = 0;
        for table in self.tables.values() {
            written += table.sync_all_to_device().await?;
        }
        info!("Materialised {} record(s) into {}", written, self.ctx.vault.name);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::fs::InMemoryFs;
    use crate::io::ChangeRegister;
    use crate::node_id::NodeId;
    use crate::origin::{ClientId, WriteOrigin};
    use crate::store::Op;
    use crate::vault::{Vault, VaultKind};

    fn database() -> (Arc<InMemoryFs>, VaultDatabase<InMemoryFs>) {
        let fs = Arc::new(InMemoryFs::new());
        let store = Arc::new(VaultStore::in_memory("v").unwrap());
        let vault = Vault::new("v", "Vault", VaultKind::Remote).with_filepath("/vault");
        let ctx = TableContext::new(vault, store, fs.clone(), ChangeRegister::new(), ClientId::from("me"));
        (fs, VaultDatabase::new(ctx))
    }

    #[tokio::test]
    async fn test_drain_materialises_remote_batches() {
        let (fs, db) = database();
        let node = NodeId::from(1);
        db.store().register_sync_node(node).unwrap();
        let mut rx = db.store().subscribe();

        db.store()
            .transact(
                WriteOrigin::Remote(node),
                vec![
                    Op::Put(Entity::document("v", "Doc").with_id("d").with_parent(Some("f".into()))),
                    Op::Put(Entity::folder("v", "Folder").with_id("f")),
                ],
            )
            .unwrap();

        // The remote batch, then one device batch per table recording allocated paths
        assert_eq!(db.drain(&mut rx).await.unwrap(), 3);
        assert!(fs.exists("Folder/Doc.md").await.unwrap());
    }

    #[tokio::test]
    async fn test_spawned_feed() {
        let (fs, db) = database();
        let db = Arc::new(db);
        let node = NodeId::from(1);
        db.store().register_sync_node(node).unwrap();
        let handle = db.spawn_change_feed();

        db.store()
            .transact(WriteOrigin::Remote(node), vec![Op::Put(Entity::document("v", "Live"))])
            .unwrap();

        for _ in 0..100 {
            if fs.exists("Live.md").await.unwrap() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(fs.exists("Live.md").await.unwrap());
        handle.abort();
    }

    #[tokio::test]
    async fn test_deleted_vault_is_not_recreated() {
        let (fs, db) = database();
        let node = NodeId::from(1);
        db.store().register_sync_node(node).unwrap();
        let mut rx = db.store().subscribe();
        db.context().mark_deleted();

        db.store()
            .transact(
                WriteOrigin::Remote(node),
                vec![
                    Op::Put(Entity::document("v", "Doc").with_id("d").with_parent(Some("f".into()))),
                    Op::Put(Entity::folder("v", "Folder").with_id("f")),
                ],
            )
            .unwrap();

        assert_eq!(db.drain(&mut rx).await.unwrap(), 1);
        assert!(!fs.exists("Folder").await.unwrap());
        assert_eq!(db.sync_all_to_device().await.unwrap(), 0);
        assert!(db.documents().retrieve("d").unwrap().is_some());
    }
}
