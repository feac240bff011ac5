//! Generic table over one entity kind.
//!
//! A `Table` combines the store with the vault directory: client writes are
//! committed and then written to disk, importer writes are committed only,
//! and remote changes arriving on the change feed are materialised by
//! `register_local_sync`.

use super::behavior::{FilepathBase, TableBehavior, behavior_for};
use super::feed::{SearchIndex, UiFeed, UiItem};
use super::{Op, StoreError, VaultStore};
use crate::change::{Change, ChangeBatch, ChangeKind};
use crate::encryption::{Encryption, EncryptionError, NoEncryption};
use crate::entity::{Entity, EntityKind, Mods};
use crate::events::EventBus;
use crate::fs::{FileSystem, FsError};
use crate::io::{ChangeRegister, EntityReader, EntityWriter, IoError};
use crate::origin::{ClientId, WriteOrigin};
use crate::vault::Vault;
use futures::Stream;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

/// Page size of `list_page` / `list_paginated`.
pub const PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },
}

pub type Result<T> = std::result::Result<T, TableError>;

/// How a write is attributed and whether it goes to disk.
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// `None` means this client.
    pub origin: Option<WriteOrigin>,
    pub write_to_device: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            origin: None,
            write_to_device: true,
        }
    }
}

impl SaveOptions {
    /// Importer writes: the file is already on disk.
    pub fn device() -> Self {
        Self {
            origin: Some(WriteOrigin::Device),
            write_to_device: false,
        }
    }

    /// Writes applied from a replication peer; the change feed materialises them.
    pub fn remote(node: crate::NodeId) -> Self {
        Self {
            origin: Some(WriteOrigin::Remote(node)),
            write_to_device: false,
        }
    }
}

/// Paths handed out during one batch, so no two entities share one.
#[derive(Debug, Default)]
pub struct FilepathRegister {
    taken: HashSet<String>,
    /// entity id -> path assigned in this batch
    assigned: HashMap<String, String>,
}

impl FilepathRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.taken.contains(path)
    }

    pub fn claim(&mut self, id: &str, path: &str) {
        self.taken.insert(path.to_string());
        self.assigned.insert(id.to_string(), path.to_string());
    }

    pub fn assigned(&self, id: &str) -> Option<&str> {
        self.assigned.get(id).map(String::as_str)
    }
}

/// Everything a table needs besides its behaviour. Shared by all tables of a vault.
pub struct TableContext<F: FileSystem> {
    pub vault: Vault,
    pub store: Arc<VaultStore>,
    pub client_id: ClientId,
    pub reader: EntityReader<F>,
    pub writer: EntityWriter<F>,
    pub encryption: Arc<dyn Encryption>,
    pub search: Option<Arc<dyn SearchIndex>>,
    pub ui: Option<UiFeed>,
    pub events: Arc<EventBus>,
    /// Set once the vault directory is gone; nothing is written to disk after that.
    deleted: AtomicBool,
}

impl<F: FileSystem> TableContext<F> {
    pub fn new(
        vault: Vault,
        store: Arc<VaultStore>,
        fs: Arc<F>,
        register: ChangeRegister,
        client_id: ClientId,
    ) -> Self {
        let writer = EntityWriter::new(fs.clone(), register, vault.id.clone());
        Self {
            vault,
            store,
            client_id,
            reader: EntityReader::new(fs),
            writer,
            encryption: Arc::new(NoEncryption),
            search: None,
            ui: None,
            events: Arc::new(EventBus::new()),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn with_encryption(mut self, encryption: Arc<dyn Encryption>) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn with_search(mut self, search: Arc<dyn SearchIndex>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_ui(mut self, ui: UiFeed) -> Self {
        self.ui = Some(ui);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn register(&self) -> &ChangeRegister {
        self.writer.register()
    }

    pub fn mark_deleted(&self) {
        if !self.deleted.swap(true, Ordering::SeqCst) {
            warn!("Vault {} was deleted from disk, no longer writing to it", self.vault.name);
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn fs(&self) -> &Arc<F> {
        self.writer.fs()
    }

    /// Origin of writes made by this client.
    pub fn origin(&self) -> WriteOrigin {
        WriteOrigin::Client(self.client_id.clone())
    }

    /// Directory of folder `id`, preferring a path assigned earlier in the
    /// current batch. Unknown or unplaced folders resolve to the root.
    pub fn folder_path(
        &self,
        id: Option<&str>,
        register: Option<&FilepathRegister>,
    ) -> std::result::Result<String, StoreError> {
        let Some(id) = id else {
            return Ok(String::new());
        };
        if let Some(path) = register.and_then(|r| r.assigned(id)) {
            return Ok(path.to_string());
        }
        Ok(self
            .store
            .get(EntityKind::Folder, id)?
            .and_then(|f| f.filepath)
            .unwrap_or_default())
    }

    /// Number of folder ancestors above `entity`.
    pub fn depth(&self, entity: &Entity) -> usize {
        let mut depth = 0;
        let mut seen = HashSet::new();
        let mut next = entity.parent_id().map(str::to_string);
        while let Some(id) = next {
            if !seen.insert(id.clone()) {
                break;
            }
            depth += 1;
            next = self
                .store
                .get(EntityKind::Folder, &id)
                .ok()
                .flatten()
                .and_then(|f| f.parent_id().map(str::to_string));
        }
        depth
    }
}

pub struct Table<F: FileSystem> {
    behavior: Arc<dyn TableBehavior>,
    ctx: Arc<TableContext<F>>,
}

impl<F: FileSystem> Clone for Table<F> {
    fn clone(&self) -> Self {
        Self {
            behavior: self.behavior.clone(),
            ctx: self.ctx.clone(),
        }
    }
}

impl<F: FileSystem + 'static> Table<F> {
    pub fn new(kind: EntityKind, ctx: Arc<TableContext<F>>) -> Self {
        Self {
            behavior: behavior_for(kind),
            ctx,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.behavior.kind()
    }

    pub fn behavior(&self) -> &Arc<dyn TableBehavior> {
        &self.behavior
    }

    pub fn context(&self) -> &Arc<TableContext<F>> {
        &self.ctx
    }

    fn materialises(&self) -> bool {
        self.behavior.has_file() && self.ctx.vault.has_directory() && !self.ctx.is_deleted()
    }

    /// New local records get a key when the vault encrypts this kind.
    fn mints_keys(&self) -> bool {
        let enc = &self.ctx.encryption;
        enc.should_encrypt(&self.ctx.vault) && enc.is_encryptable(self.kind())
    }

    // ========== Reads ==========

    pub fn retrieve(&self, id: &str) -> Result<Option<Entity>> {
        Ok(self.ctx.store.get(self.kind(), id)?)
    }

    pub fn list(&self) -> Result<Vec<Entity>> {
        Ok(self.ctx.store.list_all(self.kind())?)
    }

    /// One page of at most `PAGE_SIZE` entities after `after`, ordered by id.
    pub fn list_page(&self, after: Option<&str>) -> Result<Vec<Entity>> {
        Ok(self.ctx.store.list_page(self.kind(), after, PAGE_SIZE)?)
    }

    /// Every entity, one page at a time.
    pub fn list_paginated(&self) -> impl Stream<Item = Result<Vec<Entity>>> + '_ {
        futures::stream::unfold(Some(None::<String>), move |cursor| async move {
            let after = cursor?;
            match self.list_page(after.as_deref()) {
                Ok(page) if page.is_empty() => None,
                Ok(page) => {
                    let next = (page.len() == PAGE_SIZE).then(|| page.last().map(|e| e.id.clone()));
                    Some((Ok(page), next))
                }
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    pub fn list_by_ids(&self, ids: &[String]) -> Result<Vec<Entity>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entity) = self.retrieve(id)? {
                out.push(entity);
            }
        }
        Ok(out)
    }

    pub fn list_by_filepath(&self, paths: &[&str]) -> Result<Vec<Entity>> {
        let wanted: HashSet<&str> = paths.iter().copied().collect();
        Ok(self
            .list()?
            .into_iter()
            .filter(|e| e.filepath.as_deref().is_some_and(|p| wanted.contains(p)))
            .collect())
    }

    pub fn find_by_filepath(&self, path: &str) -> Result<Option<Entity>> {
        Ok(self.list_by_filepath(&[path])?.into_iter().next())
    }

    // ========== Writes ==========

    pub async fn save(&self, entity: Entity, opts: SaveOptions) -> Result<Entity> {
        let id = entity.id.clone();
        self.save_bulk(vec![entity], opts)
            .await?
            .pop()
            .ok_or(TableError::NotFound {
                kind: self.kind(),
                id,
            })
    }

    /// Upsert many entities in one transaction. An incoming entity matches an
    /// existing record by id, then by filepath (reusing the stored id).
    pub async fn save_bulk(&self, entities: Vec<Entity>, opts: SaveOptions) -> Result<Vec<Entity>> {
        let origin = opts.origin.clone().unwrap_or_else(|| self.ctx.origin());
        let needs_paths = entities
            .iter()
            .any(|e| e.filepath.is_some() && self.retrieve(&e.id).ok().flatten().is_none());
        let by_path: HashMap<String, Entity> = if needs_paths {
            self.list()?
                .into_iter()
                .filter_map(|e| e.filepath.clone().map(|p| (p, e)))
                .collect()
        } else {
            HashMap::new()
        };

        let mut register = FilepathRegister::new();
        let mut claimed_ids = HashSet::new();
        let mut prepared = Vec::with_capacity(entities.len());

        for mut entity in entities {
            let current = match self.retrieve(&entity.id)? {
                Some(current) => Some(current),
                None => entity
                    .filepath
                    .as_deref()
                    .and_then(|p| by_path.get(p))
                    .filter(|e| !claimed_ids.contains(&e.id))
                    .cloned(),
            };
            if let Some(current) = &current {
                entity.id = current.id.clone();
                entity.created_at = current.created_at;
                if entity.filepath.is_none() {
                    entity.filepath = current.filepath.clone();
                }
                if entity.encryption_key.is_none() {
                    entity.encryption_key = current.encryption_key.clone();
                }
            } else if origin.is_local() && entity.encryption_key.is_none() && self.mints_keys() {
                entity.encryption_key = Some(self.ctx.encryption.create_encryption_key().await?);
            }
            claimed_ids.insert(entity.id.clone());

            if opts.write_to_device && self.materialises() {
                if entity.filepath.is_some() || self.behavior.creates_files() {
                    entity.filepath = self
                        .create_file_path(&entity, &mut register)
                        .await?
                        .or(entity.filepath);
                }
            } else if let Some(path) = &entity.filepath {
                register.claim(&entity.id, path);
            }
            prepared.push(entity);
        }

        let ops = prepared.iter().cloned().map(Op::Put).collect();
        let batch = self.ctx.store.transact(origin, ops)?;

        if opts.write_to_device && self.materialises() {
            self.write_changes(&batch.changes).await;
        }
        Ok(prepared)
    }

    pub async fn delete(&self, id: &str, opts: SaveOptions) -> Result<Option<Entity>> {
        Ok(self
            .delete_bulk(&[id.to_string()], opts)
            .await?
            .into_iter()
            .next())
    }

    /// Delete records; with `write_to_device` their files go to the trash.
    pub async fn delete_bulk(&self, ids: &[String], opts: SaveOptions) -> Result<Vec<Entity>> {
        let origin = opts.origin.clone().unwrap_or_else(|| self.ctx.origin());
        let ops = ids.iter().map(|id| Op::delete(self.kind(), id)).collect();
        let batch = self.ctx.store.transact(origin, ops)?;

        let removed: Vec<Entity> = batch
            .changes
            .iter()
            .filter_map(|c| c.old_obj.clone())
            .collect();
        if opts.write_to_device && self.materialises() {
            self.write_changes(&batch.changes).await;
        }
        Ok(removed)
    }

    /// Apply field-level mods. Renames and moves relocate the file.
    pub async fn modify(&self, id: &str, mut mods: Mods, opts: SaveOptions) -> Result<Option<Entity>> {
        let origin = opts.origin.clone().unwrap_or_else(|| self.ctx.origin());
        let Some(current) = self.retrieve(id)? else {
            return Ok(None);
        };

        if opts.write_to_device && self.materialises() && current.filepath.is_some() {
            let next = current.apply_mods(&mods).map_err(StoreError::from)?;
            let mut register = FilepathRegister::new();
            if let Some(path) = self.create_file_path(&next, &mut register).await?
                && Some(&path) != current.filepath.as_ref()
            {
                mods.insert("filepath".into(), serde_json::Value::String(path));
            }
        }

        let batch = self
            .ctx
            .store
            .transact(origin, vec![Op::modify(self.kind(), id, mods)])?;
        if opts.write_to_device && self.materialises() {
            self.write_changes(&batch.changes).await;
        }
        Ok(self.retrieve(id)?)
    }

    /// Mirror committed client changes to disk. Failures are logged.
    async fn write_changes(&self, changes: &[Change]) {
        let writer = &self.ctx.writer;
        for change in changes {
            let result = match (&change.kind, &change.obj, &change.old_obj) {
                (ChangeKind::Create, Some(new), _) if new.filepath.is_some() => {
                    writer.write(new).await.map(|_| ())
                }
                (ChangeKind::Update, Some(new), Some(old)) if new.filepath.is_some() => {
                    writer.update(new, old).await.map(|_| ())
                }
                (ChangeKind::Delete, _, Some(old)) => writer.trash(old).await.map(|_| ()),
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!("Failed to write {} {} to disk: {}", change.table, change.key, e);
            }
        }
    }

    // ========== Filepath allocation ==========

    /// Canonical, available path for `entity`, or `None` for kinds without files.
    pub async fn create_file_path(
        &self,
        entity: &Entity,
        register: &mut FilepathRegister,
    ) -> Result<Option<String>> {
        let parent_dir = self.ctx.folder_path(entity.parent_id(), Some(register))?;
        let Some(base) = self.behavior.base_filepath(entity, &parent_dir) else {
            return Ok(None);
        };
        let path = self
            .get_available_filepath(&base, entity.filepath.as_deref(), register)
            .await?;
        register.claim(&entity.id, &path);
        Ok(Some(path))
    }

    /// First of `base`, `base 1`, `base 2`, ... that is neither on disk nor
    /// taken in this batch. The entity's current path counts as available.
    pub async fn get_available_filepath(
        &self,
        base: &FilepathBase,
        original: Option<&str>,
        register: &FilepathRegister,
    ) -> Result<String> {
        let fs = self.ctx.fs();
        let mut n = 0;
        loop {
            let candidate = base.candidate(n);
            if !register.contains(&candidate)
                && (original == Some(candidate.as_str()) || !fs.exists(&candidate).await?)
            {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    // ========== Change feed ==========

    /// Process this table's share of a committed batch.
    pub async fn register_local_sync(&self, batch: &ChangeBatch) -> Result<()> {
        let changes: Vec<Change> = batch.for_table(self.kind()).cloned().collect();
        if changes.is_empty() {
            return Ok(());
        }

        let changes = self.decrypt_changes(changes).await?;

        if let Some(search) = &self.ctx.search {
            let upserts: Vec<Entity> = changes.iter().filter_map(|c| c.obj.clone()).collect();
            let deletes: Vec<String> = changes
                .iter()
                .filter(|c| c.kind == ChangeKind::Delete)
                .map(|c| c.key.clone())
                .collect();
            search.index(self.kind(), &upserts, &deletes);
        }

        let changes: Vec<Change> = changes
            .into_iter()
            .filter(|c| !c.is_updated_at_only())
            .collect();
        if changes.is_empty() {
            return Ok(());
        }

        let remote = self.ctx.store.is_remote_change(&batch.origin);
        if batch.origin.is_local() {
            self.behavior
                .after_local_changes(&self.ctx.vault.id, &changes, &self.ctx.events);
        } else if remote {
            self.behavior
                .after_remote_changes(&self.ctx.vault.id, &changes, &self.ctx.events);
        }

        if remote && self.materialises() {
            self.sync_to_device(&changes).await?;
        }

        if let Some(ui) = &self.ctx.ui {
            for change in &changes {
                if batch.origin.is_client(&self.ctx.client_id) && !change.moved_filepath() {
                    continue;
                }
                match (&change.kind, &change.obj) {
                    (ChangeKind::Delete, _) => ui.push(UiItem::Delete {
                        kind: change.table,
                        id: change.key.clone(),
                    }),
                    (_, Some(obj)) => ui.push(UiItem::Update(obj.clone())),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn decrypt_changes(&self, mut changes: Vec<Change>) -> Result<Vec<Change>> {
        let sealed: Vec<usize> = changes
            .iter()
            .enumerate()
            .filter(|(_, c)| c.obj.as_ref().is_some_and(|o| o.encrypted_data.is_some()))
            .map(|(i, _)| i)
            .collect();
        if sealed.is_empty() {
            return Ok(changes);
        }
        let entities = sealed
            .iter()
            .filter_map(|&i| changes[i].obj.clone())
            .collect();
        let opened = self
            .ctx
            .encryption
            .decrypt_data(&self.ctx.vault, entities)
            .await?;
        for (i, entity) in sealed.into_iter().zip(opened) {
            changes[i].obj = Some(entity);
        }
        Ok(changes)
    }

    /// Materialise remote changes: allocate paths, write files, trash deletes,
    /// then record the allocated paths with `Device` origin.
    pub async fn sync_to_device(&self, changes: &[Change]) -> Result<()> {
        if self.ctx.is_deleted() {
            debug!("{} is deleted, dropping {} change(s)", self.ctx.vault.name, changes.len());
            return Ok(());
        }
        let mut register = FilepathRegister::new();
        let mut fixups = Vec::new();

        let mut ordered: Vec<&Change> = changes.iter().collect();
        ordered.sort_by_key(|c| c.entity().map(|e| self.ctx.depth(e)).unwrap_or(0));

        for change in ordered {
            match change.kind {
                ChangeKind::Delete => {
                    if let Some(old) = &change.old_obj
                        && let Err(e) = self.ctx.writer.trash(old).await
                    {
                        warn!("Failed to trash {}: {}", change.key, e);
                    }
                }
                ChangeKind::Create | ChangeKind::Update => {
                    let Some(new) = &change.obj else { continue };
                    self.materialise(new, change.old_obj.as_ref(), &mut register, &mut fixups)
                        .await?;
                }
            }
        }
        self.commit_fixups(fixups)
    }

    /// Write entities that are not on disk yet, parents first.
    pub async fn sync_entities_to_device(&self, entities: Vec<Entity>) -> Result<usize> {
        if !self.materialises() {
            return Ok(0);
        }
        let mut entities = entities;
        entities.sort_by_key(|e| self.ctx.depth(e));

        let mut register = FilepathRegister::new();
        let mut fixups = Vec::new();
        let mut written = 0;
        for entity in &entities {
            if self.materialise(entity, None, &mut register, &mut fixups).await? {
                written += 1;
            }
        }
        self.commit_fixups(fixups)?;
        Ok(written)
    }

    /// Materialise every record of this table.
    pub async fn sync_all_to_device(&self) -> Result<usize> {
        let entities = self.list()?;
        self.sync_entities_to_device(entities).await
    }

    async fn materialise(
        &self,
        entity: &Entity,
        old: Option<&Entity>,
        register: &mut FilepathRegister,
        fixups: &mut Vec<Op>,
    ) -> Result<bool> {
        if entity.filepath.is_none() && !self.behavior.creates_files() {
            return Ok(false);
        }
        let Some(path) = self.create_file_path(entity, register).await? else {
            return Ok(false);
        };
        let mut target = entity.clone();
        target.filepath = Some(path.clone());

        let written = match old.filter(|o| o.filepath.is_some()) {
            Some(old) => self.ctx.writer.update(&target, old).await,
            None => self.ctx.writer.write(&target).await,
        };
        if let Err(e) = written {
            warn!("Failed to materialise {} {}: {}", self.kind(), entity.id, e);
            return Ok(false);
        }

        if entity.filepath.as_deref() != Some(path.as_str()) {
            let mut mods = Mods::new();
            mods.insert("filepath".into(), serde_json::Value::String(path));
            fixups.push(Op::modify(self.kind(), &entity.id, mods));
        }
        Ok(true)
    }

    fn commit_fixups(&self, fixups: Vec<Op>) -> Result<()> {
        if fixups.is_empty() {
            return Ok(());
        }
        debug!("recording {} allocated path(s)", fixups.len());
        self.ctx.store.transact(WriteOrigin::Device, fixups)?;
        Ok(())
    }
}
