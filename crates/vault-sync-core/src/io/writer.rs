//! Writes entities to the vault directory.
//!
//! Written files get their mtime set to the entity's `updatedAt` so a later
//! import sees them as unchanged. File and directory writes are registered
//! after the write, once their stat is known; renames and deletes are
//! registered before the move. The watcher classifies an OS event only after
//! its debounce window, by which time the entry is in the change register.

use super::register::ChangeRegister;
use super::{IoError, Result, TRASH_DIR};
use crate::entity::{Entity, Payload};
use crate::fs::{FileStat, FileSystem, file_name, join, parent, split_extension};
use crate::markdown::{self, Frontmatter};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info};

/// Files written concurrently per chunk in `write_batch`.
pub const WRITE_CHUNK: usize = 100;

pub struct EntityWriter<F: FileSystem> {
    fs: Arc<F>,
    register: ChangeRegister,
    vault_id: String,
}

impl<F: FileSystem> Clone for EntityWriter<F> {
    fn clone(&self) -> Self {
        Self {
            fs: self.fs.clone(),
            register: self.register.clone(),
            vault_id: self.vault_id.clone(),
        }
    }
}

/// Markdown text for entities that live in files, `None` otherwise.
pub fn render(entity: &Entity) -> Option<String> {
    let mut fm = Frontmatter::new();
    fm.insert("id".into(), serde_yaml::Value::String(entity.id.clone()));
    match &entity.payload {
        Payload::Document(doc) => {
            for (key, value) in &doc.properties {
                fm.insert(key.clone(), markdown::json_to_yaml(value));
            }
        }
        Payload::Event(event) => {
            fm.insert("start".into(), serde_yaml::Value::from(event.start));
            fm.insert("end".into(), serde_yaml::Value::from(event.end));
            if let Some(calendar) = &event.calendar_id {
                fm.insert(
                    "calendarId".into(),
                    serde_yaml::Value::String(calendar.clone()),
                );
            }
        }
        _ => return None,
    }
    Some(markdown::serialize(&fm, &entity.content))
}

impl<F: FileSystem> EntityWriter<F> {
    pub fn new(fs: Arc<F>, register: ChangeRegister, vault_id: impl Into<String>) -> Self {
        Self {
            fs,
            register,
            vault_id: vault_id.into(),
        }
    }

    pub fn register(&self) -> &ChangeRegister {
        &self.register
    }

    pub fn fs(&self) -> &Arc<F> {
        &self.fs
    }

    /// Write one entity to its `filepath`. Folders become directories; kinds
    /// without a file representation are skipped (`Ok(None)`).
    pub async fn write(&self, entity: &Entity) -> Result<Option<FileStat>> {
        let path = entity
            .filepath
            .as_deref()
            .ok_or_else(|| IoError::NoFilepath(entity.id.clone()))?;

        if matches!(entity.payload, Payload::Folder(_)) {
            self.create_dir(path).await?;
            return Ok(Some(self.fs.stat(path).await?));
        }
        let Some(text) = render(entity) else {
            return Ok(None);
        };
        let mtime = entity.updated_at.max(0) as u64;

        if let Ok(existing) = self.fs.stat(path).await
            && existing.mtime_millis == mtime
            && self.fs.read(path).await.ok().as_deref() == Some(text.as_bytes())
        {
            debug!("{} already up to date", path);
            return Ok(Some(existing));
        }

        self.create_dir(parent(path)).await?;
        self.fs.write(path, text.as_bytes()).await?;
        self.fs.set_mtime(path, mtime).await?;
        let stat = self.fs.stat(path).await?;
        self.register.register_file_write(&self.vault_id, path, &stat);
        Ok(Some(stat))
    }

    /// Write many entities, `WRITE_CHUNK` at a time.
    pub async fn write_batch(&self, entities: &[Entity]) -> Vec<Result<Option<FileStat>>> {
        let mut results = Vec::with_capacity(entities.len());
        for chunk in entities.chunks(WRITE_CHUNK) {
            results.extend(join_all(chunk.iter().map(|e| self.write(e))).await);
        }
        results
    }

    /// Write `new`, moving the file first when its path changed.
    pub async fn update(&self, new: &Entity, old: &Entity) -> Result<Option<FileStat>> {
        if let (Some(from), Some(to)) = (old.filepath.as_deref(), new.filepath.as_deref())
            && from != to
            && self.fs.exists(from).await?
            && !self.fs.exists(to).await?
        {
            self.rename(from, to).await?;
        }
        self.write(new).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.create_dir(parent(to)).await?;
        self.register.register_rename(&self.vault_id, from, to);
        self.fs.rename(from, to).await?;
        debug!("Renamed {} -> {}", from, to);
        Ok(())
    }

    /// Create `path` and any missing ancestors, registering each new directory.
    pub async fn create_dir(&self, path: &str) -> Result<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = join(&current, segment);
            if self.fs.exists(&current).await? {
                continue;
            }
            self.fs.mkdir(&current).await?;
            let stat = self.fs.stat(&current).await?;
            self.register
                .register_file_write(&self.vault_id, &current, &stat);
        }
        Ok(())
    }

    /// Move the entity's file into `.trash/`. Returns the trash path, or
    /// `None` when there was nothing on disk.
    pub async fn trash(&self, entity: &Entity) -> Result<Option<String>> {
        let Some(path) = entity.filepath.as_deref() else {
            return Ok(None);
        };
        if !self.fs.exists(path).await? {
            return Ok(None);
        }

        // Descendants disappear with a directory; expect their unlinks too
        if self.fs.stat(path).await?.is_dir {
            for (child, _) in crate::fs::walk(self.fs.as_ref(), path).await? {
                self.register.register_delete(&self.vault_id, &child);
            }
        }
        self.register.register_delete(&self.vault_id, path);

        self.fs.mkdir(TRASH_DIR).await?;
        let target = self.trash_target(file_name(path)).await?;
        self.fs.rename(path, &target).await?;
        info!("Trashed {} -> {}", path, target);
        Ok(Some(target))
    }

    async fn trash_target(&self, name: &str) -> Result<String> {
        let (stem, ext) = split_extension(name);
        let mut candidate = join(TRASH_DIR, name);
        let mut n = 1;
        while self.fs.exists(&candidate).await? {
            let numbered = match ext {
                Some(ext) => format!("{} {}.{}", stem, n, ext),
                None => format!("{} {}", stem, n),
            };
            candidate = join(TRASH_DIR, &numbered);
            n += 1;
        }
        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EventFields, TaskFields};
    use crate::fs::InMemoryFs;

    fn writer() -> (Arc<InMemoryFs>, EntityWriter<InMemoryFs>) {
        let fs = Arc::new(InMemoryFs::new());
        let writer = EntityWriter::new(fs.clone(), ChangeRegister::new(), "v");
        (fs, writer)
    }

    fn doc(title: &str, path: &str) -> Entity {
        let mut e = Entity::document("v", title)
            .with_id(format!("id-{}", title))
            .with_content("hello");
        e.filepath = Some(path.into());
        e.updated_at = 10_000;
        e
    }

    #[tokio::test]
    async fn test_write_registers_and_sets_mtime() {
        let (fs, writer) = writer();
        let entity = doc("Plan", "Work/Plan.md");

        let stat = writer.write(&entity).await.unwrap().unwrap();
        assert_eq!(stat.mtime_millis, 10_000);

        let text = String::from_utf8(fs.read("Work/Plan.md").await.unwrap()).unwrap();
        assert_eq!(text, "---\nid: id-Plan\n---\n\nhello");

        let register = writer.register();
        assert!(register.take_file_write("v", "Work/Plan.md", &stat));
        let dir = fs.stat("Work").await.unwrap();
        assert!(register.take_file_write("v", "Work", &dir));
        assert!(register.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_write_is_skipped() {
        let (_fs, writer) = writer();
        let entity = doc("Plan", "Plan.md");
        let stat = writer.write(&entity).await.unwrap().unwrap();
        assert!(writer.register().take_file_write("v", "Plan.md", &stat));

        writer.write(&entity).await.unwrap();
        assert!(writer.register().is_empty());
    }

    #[tokio::test]
    async fn test_db_only_kinds_are_skipped() {
        let (fs, writer) = writer();
        let mut task = Entity::new(
            "v",
            Payload::Task(TaskFields {
                text: "t".into(),
                ..Default::default()
            }),
        );
        task.filepath = Some("t.md".into());
        assert!(writer.write(&task).await.unwrap().is_none());
        assert!(!fs.exists("t.md").await.unwrap());

        let untracked = Entity::document("v", "x");
        assert!(matches!(
            writer.write(&untracked).await,
            Err(IoError::NoFilepath(_))
        ));
    }

    #[tokio::test]
    async fn test_event_front_matter() {
        let (fs, writer) = writer();
        let mut event = Entity::new(
            "v",
            Payload::Event(EventFields {
                summary: "Standup".into(),
                start: 1,
                end: 2,
                calendar_id: None,
            }),
        )
        .with_id("ev");
        event.filepath = Some(".events/Standup.md".into());
        writer.write(&event).await.unwrap();

        let text = String::from_utf8(fs.read(".events/Standup.md").await.unwrap()).unwrap();
        assert_eq!(text, "---\nend: 2\nid: ev\nstart: 1\n---\n\n");
    }

    #[tokio::test]
    async fn test_update_renames_moved_file() {
        let (fs, writer) = writer();
        let old = doc("Old", "Old.md");
        writer.write(&old).await.unwrap();

        let mut new = old.clone();
        new.set_display_name("New");
        new.filepath = Some("Sub/New.md".into());
        new.updated_at = 20_000;
        writer.update(&new, &old).await.unwrap();

        assert!(!fs.exists("Old.md").await.unwrap());
        assert!(fs.exists("Sub/New.md").await.unwrap());
        assert!(writer.register().is_rename("v", "Old.md", "Sub/New.md"));
    }

    #[tokio::test]
    async fn test_trash_uniquifies() {
        let (fs, writer) = writer();
        let first = doc("A", "A.md");
        writer.write(&first).await.unwrap();
        assert_eq!(
            writer.trash(&first).await.unwrap().as_deref(),
            Some(".trash/A.md")
        );
        assert!(writer.register().is_delete("v", "A.md"));

        writer.write(&first).await.unwrap();
        assert_eq!(
            writer.trash(&first).await.unwrap().as_deref(),
            Some(".trash/A 1.md")
        );
        assert!(!fs.exists("A.md").await.unwrap());
        assert!(writer.trash(&first).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trash_folder_registers_children() {
        let (fs, writer) = writer();
        fs.write("F/a.md", b"").await.unwrap();
        let mut folder = Entity::folder("v", "F");
        folder.filepath = Some("F".into());

        writer.trash(&folder).await.unwrap();
        assert!(writer.register().is_delete("v", "F"));
        assert!(writer.register().is_delete("v", "F/a.md"));
        assert!(fs.exists(".trash/F/a.md").await.unwrap());
    }
}
