//! Brings changes made to the vault directory into the database.
//!
//! `import_changes` reconciles a full snapshot of the directory with the
//! stored records (used at startup, when changes happened while nobody was
//! watching). `import_events` applies a classified watcher batch. Both write
//! with `Device` origin and never write files back.

use crate::conflicts::{ConflictError, ConflictResolver, LocalConflict};
use crate::entity::{Entity, EntityKind, ImageFields, Mods, Payload};
use crate::events::SyncEvent;
use crate::fs::{FileSystem, file_name, parent, split_extension};
use crate::io::reader::{DirEntry, FileRecord, ORDER_STEP};
use crate::io::{EVENTS_DIR, FileType, is_ignored};
use crate::origin::WriteOrigin;
use crate::store::{Op, SaveOptions, StoreError, TableError, VaultDatabase};
use crate::sync::outbox::Outbox;
use crate::watcher::{WatchEntity, WatchEvent, WatchEventKind};
use futures::future::join_all;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Documents read and saved per transaction.
pub const IMPORT_CHUNK: usize = 50;

/// A file must be this much newer than its record to count as changed.
pub const MTIME_TOLERANCE_MS: i64 = 1000;

/// Directories whose files are never imported as documents.
const EXCLUDED_DIRS: [&str; 2] = [".tasks", EVENTS_DIR];

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Table error: {0}")]
    Table(#[from] TableError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Conflict error: {0}")]
    Conflict(#[from] ConflictError),
}

pub type Result<T> = std::result::Result<T, ImportError>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub conflicts: usize,
    pub unsupported: usize,
    /// Per-file failures; each is also counted as unsupported.
    pub errors: Vec<String>,
}

impl ImportReport {
    /// Database writes performed.
    pub fn writes(&self) -> usize {
        self.created + self.updated + self.deleted + self.conflicts
    }

    fn failed(&mut self, path: &str, reason: &str) {
        warn!("Skipping {}: {}", path, reason);
        self.unsupported += 1;
        self.errors.push(format!("{}: {}", path, reason));
    }
}

/// Whether a file stamped `disk_updated_at` should overwrite `record`.
pub fn should_import(disk_updated_at: i64, record: Option<&Entity>) -> bool {
    match record {
        None => true,
        Some(record) => disk_updated_at - MTIME_TOLERANCE_MS > record.updated_at,
    }
}

fn in_excluded_dir(path: &str) -> bool {
    path.split('/').any(|segment| EXCLUDED_DIRS.contains(&segment))
}

/// Whether a snapshot import would have listed a record stored at `path`.
fn is_tracked(kind: EntityKind, path: &str) -> bool {
    match kind {
        EntityKind::Event => path.starts_with(&format!("{}/", EVENTS_DIR)),
        _ => !is_ignored(path) && !in_excluded_dir(path),
    }
}

fn by_filepath(entities: &[Entity]) -> HashMap<&str, &Entity> {
    entities
        .iter()
        .filter_map(|e| e.filepath.as_deref().map(|p| (p, e)))
        .collect()
}

fn mime_for(path: &str) -> Option<String> {
    let ext = split_extension(file_name(path)).1?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        _ => return None,
    };
    Some(mime.to_string())
}

/// Parent-id field name used in mods for each kind.
fn parent_field(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Document => "projectId",
        _ => "parentId",
    }
}

fn name_field(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Document => "title",
        _ => "name",
    }
}

/// Record a file should produce. An existing record keeps its id, creation
/// time, encryption key and other database-only fields; the file decides
/// content, title, location and front matter.
fn merge_document(
    vault_id: &str,
    record: &FileRecord,
    existing: Option<&Entity>,
    fallback_id: &str,
    parent_id: Option<String>,
) -> Entity {
    let from_disk = record.to_entity(vault_id, fallback_id, parent_id);
    let Some(current) = existing else {
        return from_disk;
    };
    let mut merged = current.clone();
    merged.content = from_disk.content;
    merged.payload = from_disk.payload;
    merged.filepath = from_disk.filepath;
    merged.updated_at = from_disk.updated_at;
    merged
}

fn merge_folder(vault_id: &str, entry: &DirEntry, existing: Option<&Entity>, parent_id: Option<String>) -> Entity {
    let mut folder = match existing {
        Some(current) => current.clone(),
        None => {
            let mut folder = Entity::folder(vault_id, &entry.name).with_id(&entry.id);
            if let Payload::Folder(fields) = &mut folder.payload {
                fields.order = entry.order;
            }
            folder.created_at = entry.created_at;
            folder
        }
    };
    folder.set_display_name(&entry.name);
    folder.set_parent_id(parent_id);
    folder.filepath = Some(entry.filepath.clone());
    folder.updated_at = entry.updated_at;
    folder
}

pub struct LocalChangeImporter<F: FileSystem> {
    db: Arc<VaultDatabase<F>>,
    outbox: Outbox,
    conflicts: ConflictResolver<F>,
}

impl<F: FileSystem + 'static> LocalChangeImporter<F> {
    pub fn new(db: Arc<VaultDatabase<F>>) -> Self {
        Self {
            outbox: Outbox::new(db.store().clone()),
            conflicts: ConflictResolver::new(db.clone()),
            db,
        }
    }

    fn vault_id(&self) -> &str {
        &self.db.context().vault.id
    }

    fn progress(&self, done: usize, total: usize, unsupported: usize) {
        self.db.context().events.emit(SyncEvent::ImportProgress {
            vault_id: self.vault_id().to_string(),
            done,
            total,
            unsupported,
        });
    }

    // ========== Snapshot import ==========

    /// Reconcile the whole vault directory with the database.
    pub async fn import_changes(&self) -> Result<ImportReport> {
        let ctx = self.db.context();
        let vault_id = ctx.vault.id.clone();
        let mut report = ImportReport::default();

        match ctx.fs().exists("").await {
            Ok(true) => {}
            Ok(false) => {
                self.vault_deleted();
                return Ok(report);
            }
            Err(e) => warn!("Failed to stat vault root of {}: {}", ctx.vault.name, e),
        }
        let listing = ctx.reader.list_dir().await;
        let event_listing = ctx.reader.list_events().await;
        let complete = listing.complete && event_listing.complete;
        let entries = listing.entries;
        let event_entries = event_listing.entries;

        let folders = self.db.folders().list()?;
        let documents = self.db.documents().list()?;
        let events = self.db.table(EntityKind::Event).list()?;
        let folder_by_path = by_filepath(&folders);
        let doc_by_path = by_filepath(&documents);
        let event_by_path = by_filepath(&events);

        // Existing record's id for known directories, the snapshot's otherwise
        let dir_ids: HashMap<&str, String> = entries
            .iter()
            .filter(|e| e.is_dir)
            .map(|e| {
                let id = folder_by_path
                    .get(e.filepath.as_str())
                    .map_or_else(|| e.id.clone(), |f| f.id.clone());
                (e.filepath.as_str(), id)
            })
            .collect();
        let parent_id = |dir: &str| dir_ids.get(dir).cloned();

        let dirs: Vec<&DirEntry> = entries.iter().filter(|e| e.is_dir).collect();
        let markdown: Vec<&DirEntry> = entries
            .iter()
            .filter(|e| e.file_type == Some(FileType::Markdown) && !in_excluded_dir(&e.filepath))
            .collect();
        let attachments = entries
            .iter()
            .filter(|e| e.file_type == Some(FileType::Attachment))
            .count();
        let total = entries.len() + event_entries.len();
        report.unsupported = entries.len() - attachments - dirs.len() - markdown.len();

        // Folders, parents first
        let mut levels: BTreeMap<usize, Vec<Entity>> = BTreeMap::new();
        for entry in &dirs {
            let existing = folder_by_path.get(entry.filepath.as_str()).copied();
            if !should_import(entry.updated_at, existing) {
                continue;
            }
            match existing {
                Some(_) => report.updated += 1,
                None => report.created += 1,
            }
            levels
                .entry(entry.depth())
                .or_default()
                .push(merge_folder(&vault_id, entry, existing, parent_id(&entry.dir)));
        }
        for (_, level) in levels {
            self.db.folders().save_bulk(level, SaveOptions::device()).await?;
        }
        let mut done = dirs.len();
        self.progress(done, total, report.unsupported);

        // Documents, then events
        let event_refs: Vec<&DirEntry> = event_entries.iter().collect();
        for (kind, files, by_path) in [
            (EntityKind::Document, &markdown, &doc_by_path),
            (EntityKind::Event, &event_refs, &event_by_path),
        ] {
            let pending: Vec<&DirEntry> = files
                .iter()
                .copied()
                .filter(|e| should_import(e.updated_at, by_path.get(e.filepath.as_str()).copied()))
                .collect();
            done += files.len() - pending.len();

            for chunk in pending.chunks(IMPORT_CHUNK) {
                let records = join_all(chunk.iter().map(|e| ctx.reader.read(&e.filepath))).await;
                let mut batch = Vec::with_capacity(chunk.len());
                for (entry, record) in chunk.iter().zip(records) {
                    let Some(record) = record else {
                        report.failed(&entry.filepath, "unreadable");
                        continue;
                    };
                    let existing = by_path.get(entry.filepath.as_str()).copied();
                    let parent_folder = match kind {
                        EntityKind::Document => parent_id(&entry.dir),
                        _ => None,
                    };
                    let record =
                        merge_document(&vault_id, &record, existing, &entry.id, parent_folder);
                    if existing.is_some() || self.db.table(kind).retrieve(&record.id)?.is_some() {
                        report.updated += 1;
                    } else {
                        report.created += 1;
                    }
                    batch.push(record);
                }
                if !batch.is_empty() {
                    self.db.table(kind).save_bulk(batch, SaveOptions::device()).await?;
                }
                done += chunk.len();
                self.progress(done, total, report.unsupported);
            }
        }

        if complete {
            let on_disk: HashSet<&str> = entries
                .iter()
                .chain(&event_entries)
                .map(|e| e.filepath.as_str())
                .collect();
            self.import_missing(&on_disk, &mut report).await?;
        } else {
            warn!(
                "Listing of {} was incomplete, not treating absent files as deleted",
                ctx.vault.name
            );
        }

        self.progress(total, total, report.unsupported);
        info!(
            "Imported {}: {} created, {} updated, {} deleted, {} conflict(s), {} unsupported",
            ctx.vault.name,
            report.created,
            report.updated,
            report.deleted,
            report.conflicts,
            report.unsupported
        );
        Ok(report)
    }

    /// Stop writing to the vault directory and announce that it is gone.
    fn vault_deleted(&self) {
        let ctx = self.db.context();
        ctx.mark_deleted();
        ctx.events.emit(SyncEvent::VaultDeleted {
            vault_id: self.vault_id().to_string(),
        });
    }

    /// A pending local change explains why a record has no file yet.
    fn is_pending(&self, entity: &Entity) -> bool {
        let Some(path) = entity.filepath.as_deref() else {
            return true;
        };
        self.outbox.has_pending_create(entity.kind(), &entity.id)
            || self.db.context().register().has_pending_write(self.vault_id(), path)
    }

    /// Records whose file is gone: deleted for local vaults, parked as
    /// conflicts for remote ones.
    async fn import_missing(&self, on_disk: &HashSet<&str>, report: &mut ImportReport) -> Result<()> {
        let remote = self.db.context().vault.is_remote();
        for kind in [EntityKind::Document, EntityKind::Event, EntityKind::Folder] {
            let missing: Vec<Entity> = self
                .db
                .table(kind)
                .list()?
                .into_iter()
                .filter(|e| {
                    e.filepath
                        .as_deref()
                        .is_some_and(|p| !on_disk.contains(p) && is_tracked(kind, p))
                })
                .filter(|e| !self.is_pending(e))
                .collect();
            if missing.is_empty() {
                continue;
            }

            if remote {
                let mut fresh = Vec::new();
                for entity in missing {
                    if !self.conflicts.contains(kind, &entity.id)? {
                        fresh.push(LocalConflict::missing_on_disk(entity));
                    }
                }
                report.conflicts += self.conflicts.record(fresh)?;
            } else {
                let ids: Vec<String> = missing.into_iter().map(|e| e.id).collect();
                report.deleted += self
                    .db
                    .table(kind)
                    .delete_bulk(&ids, SaveOptions::device())
                    .await?
                    .len();
            }
        }
        Ok(())
    }

    // ========== Watcher batches ==========

    /// Apply one classified watcher batch in order.
    pub async fn import_events(&self, events: Vec<WatchEvent>) -> Result<ImportReport> {
        let mut report = ImportReport::default();
        for event in events {
            debug!("import {:?} {:?} {}", event.kind, event.entity, event.path);
            match (event.kind, event.entity) {
                (WatchEventKind::VaultDeleted, _) => {
                    self.vault_deleted();
                    break;
                }
                (_, WatchEntity::Config) => {
                    self.db.context().events.emit(SyncEvent::ConfigChanged {
                        vault_id: self.vault_id().to_string(),
                        path: event.path.clone(),
                    });
                }
                (_, WatchEntity::Vault) => {}
                (WatchEventKind::Add | WatchEventKind::Change, WatchEntity::Document) => {
                    self.upsert_document(&event.path, &mut report).await?;
                }
                (WatchEventKind::Add | WatchEventKind::Change, WatchEntity::Folder) => {
                    self.upsert_folder(&event.path, &mut report).await?;
                }
                (WatchEventKind::Add | WatchEventKind::Change, WatchEntity::Attachment) => {
                    self.upsert_image(&event.path, &mut report).await?;
                }
                (WatchEventKind::Delete, WatchEntity::Folder) => {
                    self.delete_folder(&event.path, &mut report).await?;
                }
                (WatchEventKind::Delete, entity) => {
                    let kind = match entity {
                        WatchEntity::Attachment => EntityKind::Image,
                        _ => EntityKind::Document,
                    };
                    self.delete_at(kind, &event.path, &mut report).await?;
                }
                (WatchEventKind::Rename, entity) => {
                    let Some(from) = event.from.as_deref() else {
                        continue;
                    };
                    match entity {
                        WatchEntity::Folder => self.rename_folder(from, &event.path, &mut report).await?,
                        WatchEntity::Attachment => {
                            self.rename_entity(EntityKind::Image, from, &event.path, &mut report)
                                .await?
                        }
                        _ => {
                            self.rename_entity(EntityKind::Document, from, &event.path, &mut report)
                                .await?
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    fn folder_id_at(&self, dir: &str) -> Result<Option<String>> {
        if dir.is_empty() {
            return Ok(None);
        }
        Ok(self.db.folders().find_by_filepath(dir)?.map(|f| f.id))
    }

    async fn upsert_document(&self, path: &str, report: &mut ImportReport) -> Result<()> {
        if in_excluded_dir(path) {
            return Ok(());
        }
        let Some(record) = self.db.context().reader.read(path).await else {
            report.failed(path, "unreadable");
            return Ok(());
        };
        let existing = self.db.documents().find_by_filepath(path)?;
        let parent_id = self.folder_id_at(parent(path))?;
        let fallback = uuid::Uuid::new_v4().to_string();
        let doc = merge_document(self.vault_id(), &record, existing.as_ref(), &fallback, parent_id);

        if existing.as_ref() == Some(&doc) {
            return Ok(());
        }
        match existing {
            Some(_) => report.updated += 1,
            None => report.created += 1,
        }
        self.db.documents().save(doc, SaveOptions::device()).await?;
        Ok(())
    }

    async fn upsert_folder(&self, path: &str, report: &mut ImportReport) -> Result<()> {
        if self.db.folders().find_by_filepath(path)?.is_some() {
            return Ok(());
        }
        let Ok(stat) = self.db.context().fs().stat(path).await else {
            report.failed(path, "vanished");
            return Ok(());
        };
        let parent_id = self.folder_id_at(parent(path))?;
        let siblings = self
            .db
            .folders()
            .list()?
            .iter()
            .filter(|f| f.parent_id() == parent_id.as_deref())
            .count();

        let mut folder = Entity::folder(self.vault_id(), file_name(path)).with_parent(parent_id);
        if let Payload::Folder(fields) = &mut folder.payload {
            fields.order = siblings as f64 * ORDER_STEP;
        }
        folder.filepath = Some(path.to_string());
        folder.created_at = stat.birthtime_millis as i64;
        folder.updated_at = stat.mtime_millis as i64;
        self.db.folders().save(folder, SaveOptions::device()).await?;
        report.created += 1;
        Ok(())
    }

    async fn upsert_image(&self, path: &str, report: &mut ImportReport) -> Result<()> {
        if self.db.table(EntityKind::Image).find_by_filepath(path)?.is_some() {
            return Ok(());
        }
        let Ok(stat) = self.db.context().fs().stat(path).await else {
            report.failed(path, "vanished");
            return Ok(());
        };
        let mut image = Entity::new(
            self.vault_id(),
            Payload::Image(ImageFields {
                name: file_name(path).to_string(),
                parent_id: self.folder_id_at(parent(path))?,
                mime: mime_for(path),
            }),
        );
        image.filepath = Some(path.to_string());
        image.created_at = stat.birthtime_millis as i64;
        image.updated_at = stat.mtime_millis as i64;
        self.db
            .table(EntityKind::Image)
            .save(image, SaveOptions::device())
            .await?;
        report.created += 1;
        Ok(())
    }

    async fn delete_at(&self, kind: EntityKind, path: &str, report: &mut ImportReport) -> Result<()> {
        let table = self.db.table(kind);
        if let Some(entity) = table.find_by_filepath(path)? {
            table.delete(&entity.id, SaveOptions::device()).await?;
            report.deleted += 1;
        }
        Ok(())
    }

    /// The folder and every record below it.
    async fn delete_folder(&self, path: &str, report: &mut ImportReport) -> Result<()> {
        let prefix = format!("{}/", path);
        for kind in [EntityKind::Document, EntityKind::Image, EntityKind::Folder] {
            let table = self.db.table(kind);
            let ids: Vec<String> = table
                .list()?
                .into_iter()
                .filter(|e| {
                    e.filepath
                        .as_deref()
                        .is_some_and(|p| p == path || p.starts_with(&prefix))
                })
                .map(|e| e.id)
                .collect();
            if !ids.is_empty() {
                report.deleted += table.delete_bulk(&ids, SaveOptions::device()).await?.len();
            }
        }
        Ok(())
    }

    fn location_mods(&self, kind: EntityKind, to: &str) -> Result<Mods> {
        let name = match kind {
            EntityKind::Document => split_extension(file_name(to)).0,
            _ => file_name(to),
        };
        let parent = self.folder_id_at(parent(to))?;
        let mut mods = Mods::new();
        mods.insert("filepath".into(), json!(to));
        mods.insert(name_field(kind).into(), json!(name));
        mods.insert(parent_field(kind).into(), parent.map_or(Value::Null, Value::String));
        Ok(mods)
    }

    async fn rename_entity(&self, kind: EntityKind, from: &str, to: &str, report: &mut ImportReport) -> Result<()> {
        let Some(entity) = self.db.table(kind).find_by_filepath(from)? else {
            // Never imported; treat the destination as new
            return match kind {
                EntityKind::Image => self.upsert_image(to, report).await,
                _ => self.upsert_document(to, report).await,
            };
        };
        let mods = self.location_mods(kind, to)?;
        self.db
            .table(kind)
            .modify(&entity.id, mods, SaveOptions::device())
            .await?;
        report.updated += 1;
        Ok(())
    }

    /// Move the folder and rewrite the paths of everything below it in one
    /// transaction. Parent ids below the folder are unchanged.
    async fn rename_folder(&self, from: &str, to: &str, report: &mut ImportReport) -> Result<()> {
        let Some(folder) = self.db.folders().find_by_filepath(from)? else {
            return self.upsert_folder(to, report).await;
        };
        let mut ops = vec![Op::modify(
            EntityKind::Folder,
            &folder.id,
            self.location_mods(EntityKind::Folder, to)?,
        )];

        let prefix = format!("{}/", from);
        for kind in [EntityKind::Folder, EntityKind::Document, EntityKind::Image] {
            for entity in self.db.table(kind).list()? {
                let Some(rest) = entity.filepath.as_deref().and_then(|p| p.strip_prefix(&prefix)) else {
                    continue;
                };
                let mut mods = Mods::new();
                mods.insert("filepath".into(), json!(format!("{}/{}", to, rest)));
                ops.push(Op::modify(kind, &entity.id, mods));
            }
        }
        let batch = self.db.store().transact(WriteOrigin::Device, ops)?;
        report.updated += batch.changes.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;
    use crate::io::ChangeRegister;
    use crate::origin::ClientId;
    use crate::store::{TableContext, VaultStore};
    use crate::vault::{Vault, VaultKind};

    struct Fixture {
        fs: Arc<InMemoryFs>,
        db: Arc<VaultDatabase<InMemoryFs>>,
        importer: LocalChangeImporter<InMemoryFs>,
    }

    fn fixture(kind: VaultKind) -> Fixture {
        let fs = Arc::new(InMemoryFs::new());
        let store = Arc::new(VaultStore::in_memory("v").unwrap());
        let vault = Vault::new("v", "Vault", kind).with_filepath("/vault");
        let ctx = TableContext::new(vault, store, fs.clone(), ChangeRegister::new(), ClientId::from("me"));
        let db = Arc::new(VaultDatabase::new(ctx));
        Fixture {
            fs,
            importer: LocalChangeImporter::new(db.clone()),
            db,
        }
    }

    async fn seed_files(fs: &InMemoryFs) {
        fs.write("Notes/Todo.md", b"---\nid: abc\n---\n\n- milk\n")
            .await
            .unwrap();
        fs.write("Top.md", b"top level").await.unwrap();
        fs.write("Notes/pic.png", b"\x89PNG").await.unwrap();
        fs.write("Notes/archive.zip", b"zip").await.unwrap();
        fs.write(".events/Standup.md", b"---\nstart: 1\n---\n").await.unwrap();
    }

    fn event(kind: WatchEventKind, entity: WatchEntity, path: &str) -> WatchEvent {
        WatchEvent {
            kind,
            entity,
            path: path.into(),
            from: None,
            stat: None,
        }
    }

    #[tokio::test]
    async fn test_import_creates_folders_and_documents() {
        let fx = fixture(VaultKind::Local);
        seed_files(&fx.fs).await;

        let report = fx.importer.import_changes().await.unwrap();
        assert_eq!(report.created, 4);
        assert_eq!(report.unsupported, 1);

        let folder = fx.db.folders().find_by_filepath("Notes").unwrap().unwrap();
        let todo = fx.db.documents().retrieve("abc").unwrap().unwrap();
        assert_eq!(todo.filepath.as_deref(), Some("Notes/Todo.md"));
        assert_eq!(todo.display_name(), "Todo");
        assert_eq!(todo.parent_id(), Some(folder.id.as_str()));
        assert_eq!(todo.content, "- milk\n");
        assert!(fx.db.documents().find_by_filepath("Top.md").unwrap().is_some());
        // Hidden directories are not documents
        assert_eq!(fx.db.documents().list().unwrap().len(), 2);

        let events = fx.db.table(EntityKind::Event).list().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].display_name(), "Standup");
        assert_eq!(events[0].filepath.as_deref(), Some(".events/Standup.md"));
        match &events[0].payload {
            Payload::Event(fields) => assert_eq!(fields.start, 1),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_removed_event_file_deletes_event() {
        let fx = fixture(VaultKind::Local);
        seed_files(&fx.fs).await;
        fx.importer.import_changes().await.unwrap();

        fx.fs.delete(".events/Standup.md").await.unwrap();
        let report = fx.importer.import_changes().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(fx.db.table(EntityKind::Event).list().unwrap().is_empty());
        assert_eq!(fx.db.documents().list().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_directory_deletes_nothing() {
        let fx = fixture(VaultKind::Local);
        seed_files(&fx.fs).await;
        fx.importer.import_changes().await.unwrap();

        fx.fs.fail_list("Notes");
        let report = fx.importer.import_changes().await.unwrap();
        assert_eq!(report.deleted, 0);
        assert!(fx.db.documents().retrieve("abc").unwrap().is_some());
        assert!(fx.db.folders().find_by_filepath("Notes").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_import_writes_nothing() {
        let fx = fixture(VaultKind::Local);
        seed_files(&fx.fs).await;
        fx.importer.import_changes().await.unwrap();

        let mut feed = fx.db.store().subscribe();
        let report = fx.importer.import_changes().await.unwrap();
        assert_eq!(report.writes(), 0);
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_newer_file_merges_into_record() {
        let fx = fixture(VaultKind::Local);
        let mut doc = Entity::document("v", "Plan").with_id("plan").with_content("old");
        doc.filepath = Some("Plan.md".into());
        doc.encryption_key = Some("key".into());
        doc.updated_at = 1_000;
        fx.db.documents().save(doc, SaveOptions::device()).await.unwrap();

        fx.fs.write("Plan.md", b"new body").await.unwrap();
        fx.fs.set_mtime("Plan.md", 5_000).await.unwrap();

        let report = fx.importer.import_changes().await.unwrap();
        assert_eq!(report.updated, 1);
        let merged = fx.db.documents().retrieve("plan").unwrap().unwrap();
        assert_eq!(merged.content, "new body");
        assert_eq!(merged.encryption_key.as_deref(), Some("key"));
        assert_eq!(merged.updated_at, 5_000);
    }

    #[tokio::test]
    async fn test_file_within_tolerance_is_not_reimported() {
        let fx = fixture(VaultKind::Local);
        let mut doc = Entity::document("v", "Plan").with_id("plan").with_content("db");
        doc.filepath = Some("Plan.md".into());
        doc.updated_at = 10_000;
        fx.db.documents().save(doc, SaveOptions::device()).await.unwrap();

        fx.fs.write("Plan.md", b"disk").await.unwrap();
        fx.fs.set_mtime("Plan.md", 10_900).await.unwrap();

        fx.importer.import_changes().await.unwrap();
        assert_eq!(fx.db.documents().retrieve("plan").unwrap().unwrap().content, "db");
    }

    #[tokio::test]
    async fn test_missing_file_deleted_in_local_vault() {
        let fx = fixture(VaultKind::Local);
        let mut doc = Entity::document("v", "Gone").with_id("gone");
        doc.filepath = Some("Gone.md".into());
        fx.db.documents().save(doc, SaveOptions::device()).await.unwrap();

        let report = fx.importer.import_changes().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(fx.db.documents().retrieve("gone").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_file_parked_in_remote_vault() {
        let fx = fixture(VaultKind::Remote);
        let (_sub, mut events) = fx.db.context().events.subscribe_channel();
        let mut doc = Entity::document("v", "Gone").with_id("gone");
        doc.filepath = Some("Gone.md".into());
        fx.db.documents().save(doc, SaveOptions::device()).await.unwrap();

        let report = fx.importer.import_changes().await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert!(fx.db.documents().retrieve("gone").unwrap().is_some());

        let mut saw_detected = false;
        while let Ok(event) = events.try_recv() {
            saw_detected |= matches!(event, SyncEvent::ConflictsDetected { count: 1, .. });
        }
        assert!(saw_detected);

        // Already parked: not recorded again
        let again = fx.importer.import_changes().await.unwrap();
        assert_eq!(again.conflicts, 0);
    }

    #[tokio::test]
    async fn test_pending_create_is_not_missing() {
        let fx = fixture(VaultKind::Remote);
        let mut doc = Entity::document("v", "Draft").with_id("draft");
        doc.filepath = Some("Draft.md".into());
        let batch = fx
            .db
            .store()
            .transact(WriteOrigin::Client(ClientId::from("me")), vec![Op::Put(doc)])
            .unwrap();
        Outbox::new(fx.db.store().clone()).record(&batch, |_| true).unwrap();

        let report = fx.importer.import_changes().await.unwrap();
        assert_eq!(report.conflicts, 0);
        assert_eq!(report.deleted, 0);
    }

    #[tokio::test]
    async fn test_external_edit_keeps_id_and_path() {
        let fx = fixture(VaultKind::Local);
        fx.fs
            .write("Notes/Todo.md", b"---\nid: abc\n---\n\n- milk\n")
            .await
            .unwrap();
        fx.importer.import_changes().await.unwrap();

        fx.fs
            .write("Notes/Todo.md", b"---\nid: abc\n---\n\n- milk\n- eggs\n")
            .await
            .unwrap();
        let report = fx
            .importer
            .import_events(vec![event(WatchEventKind::Change, WatchEntity::Document, "Notes/Todo.md")])
            .await
            .unwrap();

        assert_eq!(report.updated, 1);
        let docs = fx.db.documents().list().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "abc");
        assert_eq!(docs[0].filepath.as_deref(), Some("Notes/Todo.md"));
        assert!(docs[0].content.ends_with("- eggs\n"));
    }

    #[tokio::test]
    async fn test_folder_rename_moves_children() {
        let fx = fixture(VaultKind::Local);
        fx.fs.write("Old/Sub/Deep.md", b"deep").await.unwrap();
        fx.importer.import_changes().await.unwrap();
        let sub = fx.db.folders().find_by_filepath("Old/Sub").unwrap().unwrap();

        fx.fs.rename("Old", "New").await.unwrap();
        let mut rename = event(WatchEventKind::Rename, WatchEntity::Folder, "New");
        rename.from = Some("Old".into());
        fx.importer.import_events(vec![rename]).await.unwrap();

        let moved = fx.db.folders().find_by_filepath("New").unwrap().unwrap();
        assert_eq!(moved.display_name(), "New");
        let sub_after = fx.db.folders().retrieve(&sub.id).unwrap().unwrap();
        assert_eq!(sub_after.filepath.as_deref(), Some("New/Sub"));
        assert!(fx.db.documents().find_by_filepath("New/Sub/Deep.md").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_document_rename_updates_title_and_project() {
        let fx = fixture(VaultKind::Local);
        fx.fs.write("Inbox.md", b"x").await.unwrap();
        fx.fs.mkdir("Projects").await.unwrap();
        fx.importer.import_changes().await.unwrap();
        let id = fx.db.documents().find_by_filepath("Inbox.md").unwrap().unwrap().id;

        fx.fs.rename("Inbox.md", "Projects/Filed.md").await.unwrap();
        let mut rename = event(WatchEventKind::Rename, WatchEntity::Document, "Projects/Filed.md");
        rename.from = Some("Inbox.md".into());
        fx.importer.import_events(vec![rename]).await.unwrap();

        let doc = fx.db.documents().retrieve(&id).unwrap().unwrap();
        let folder = fx.db.folders().find_by_filepath("Projects").unwrap().unwrap();
        assert_eq!(doc.display_name(), "Filed");
        assert_eq!(doc.parent_id(), Some(folder.id.as_str()));
    }

    #[tokio::test]
    async fn test_folder_delete_removes_contents() {
        let fx = fixture(VaultKind::Local);
        fx.fs.write("Box/a.md", b"a").await.unwrap();
        fx.fs.write("Box/b.png", b"b").await.unwrap();
        fx.importer.import_changes().await.unwrap();
        fx.importer
            .import_events(vec![event(WatchEventKind::Add, WatchEntity::Attachment, "Box/b.png")])
            .await
            .unwrap();

        let report = fx
            .importer
            .import_events(vec![event(WatchEventKind::Delete, WatchEntity::Folder, "Box")])
            .await
            .unwrap();
        assert_eq!(report.deleted, 3);
        assert!(fx.db.documents().list().unwrap().is_empty());
        assert!(fx.db.table(EntityKind::Image).list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_config_and_vault_events_are_announced() {
        let fx = fixture(VaultKind::Local);
        let (_sub, mut events) = fx.db.context().events.subscribe_channel();

        fx.importer
            .import_events(vec![
                event(WatchEventKind::Change, WatchEntity::Config, "settings.json"),
                event(WatchEventKind::VaultDeleted, WatchEntity::Vault, ""),
                event(WatchEventKind::Add, WatchEntity::Document, "late.md"),
            ])
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::ConfigChanged {
                vault_id: "v".into(),
                path: "settings.json".into()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::VaultDeleted { vault_id: "v".into() }
        );
        assert!(events.try_recv().is_err());
        assert!(fx.db.context().is_deleted());

        // Nothing is written back into the removed directory
        let mut feed = fx.db.store().subscribe();
        let node = crate::NodeId::from(7);
        fx.db.store().register_sync_node(node).unwrap();
        fx.db
            .documents()
            .save(Entity::document("v", "Pulled"), SaveOptions::remote(node))
            .await
            .unwrap();
        fx.db.drain(&mut feed).await.unwrap();
        assert!(!fx.fs.exists("Pulled.md").await.unwrap());
    }
}
