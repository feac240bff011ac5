//! Reads vault files into records and walks the vault tree.
//!
//! Filesystem errors at this boundary are logged and turned into `None`;
//! a file that vanished between the event and the read is not an error.

use super::{EVENTS_DIR, FileType, is_ignored};
use crate::entity::{DocumentFields, Entity, EventFields, Payload};
use crate::fs::{FileEntry, FileStat, FileSystem, FsError, file_name, join, parent, split_extension};
use crate::markdown::{self, Frontmatter};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Gap between the `order` of sibling folders.
pub const ORDER_STEP: f64 = 500.0;

/// A file read from disk.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub filepath: String,
    pub file_type: FileType,
    pub frontmatter: Frontmatter,
    pub body: String,
    pub stat: FileStat,
}

impl FileRecord {
    /// File name without extension.
    pub fn name(&self) -> &str {
        split_extension(file_name(&self.filepath)).0
    }

    /// Id persisted in the front matter, if any.
    pub fn front_id(&self) -> Option<String> {
        match self.frontmatter.get("id")? {
            serde_yaml::Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }

    fn properties(&self, skip: &[&str]) -> BTreeMap<String, serde_json::Value> {
        self.frontmatter
            .iter()
            .filter(|(k, _)| !skip.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), markdown::yaml_to_json(v)))
            .collect()
    }

    fn front_i64(&self, key: &str) -> Option<i64> {
        self.frontmatter.get(key).and_then(|v| v.as_i64())
    }

    fn front_str(&self, key: &str) -> Option<String> {
        self.frontmatter
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// Build the entity this file represents. Files under `.events/` are
    /// events, every other markdown file is a document.
    pub fn to_entity(&self, vault_id: &str, fallback_id: &str, parent_id: Option<String>) -> Entity {
        let payload = if self.filepath.starts_with(&format!("{}/", EVENTS_DIR)) {
            Payload::Event(EventFields {
                summary: self.name().to_string(),
                start: self.front_i64("start").unwrap_or_default(),
                end: self.front_i64("end").unwrap_or_default(),
                calendar_id: self.front_str("calendarId"),
            })
        } else {
            Payload::Document(DocumentFields {
                title: self.name().to_string(),
                project_id: parent_id,
                properties: self.properties(&["id"]),
            })
        };
        let mut entity = Entity::new(vault_id, payload)
            .with_id(self.front_id().unwrap_or_else(|| fallback_id.to_string()))
            .with_content(self.body.clone());
        entity.filepath = Some(self.filepath.clone());
        entity.created_at = self.stat.birthtime_millis as i64;
        entity.updated_at = self.stat.mtime_millis as i64;
        entity
    }
}

/// Snapshot of one vault path produced by `list_dir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Fresh UUID, used when the path has no database record yet.
    pub id: String,
    pub filepath: String,
    /// File stem or directory name.
    pub name: String,
    /// Parent directory path.
    pub dir: String,
    /// `None` for directories.
    pub file_type: Option<FileType>,
    pub is_dir: bool,
    pub created_at: i64,
    pub updated_at: i64,
    /// Position among siblings, `index * 500`.
    pub order: f64,
}

impl DirEntry {
    pub fn depth(&self) -> usize {
        self.filepath.split('/').count()
    }
}

/// Result of a directory walk.
#[derive(Debug, Clone)]
pub struct DirListing {
    pub entries: Vec<DirEntry>,
    /// False when some directory or path could not be read. A path missing
    /// from an incomplete listing may still exist.
    pub complete: bool,
}

impl DirListing {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            complete: true,
        }
    }
}

pub struct EntityReader<F: FileSystem> {
    fs: Arc<F>,
}

impl<F: FileSystem> Clone for EntityReader<F> {
    fn clone(&self) -> Self {
        Self {
            fs: self.fs.clone(),
        }
    }
}

impl<F: FileSystem> EntityReader<F> {
    pub fn new(fs: Arc<F>) -> Self {
        Self { fs }
    }

    pub fn fs(&self) -> &Arc<F> {
        &self.fs
    }

    /// Read one file. Markdown is parsed; other types carry only metadata.
    pub async fn read(&self, path: &str) -> Option<FileRecord> {
        let stat = match self.fs.stat(path).await {
            Ok(stat) if !stat.is_dir => stat,
            Ok(_) => return None,
            Err(e) => {
                debug!("stat {} failed: {}", path, e);
                return None;
            }
        };
        let file_type = FileType::from_path(path);
        let parsed = if file_type == FileType::Markdown {
            match self.fs.read(path).await {
                Ok(bytes) => markdown::parse(&String::from_utf8_lossy(&bytes)),
                Err(e) => {
                    warn!("Failed to read {}: {}", path, e);
                    return None;
                }
            }
        } else {
            Default::default()
        };
        Some(FileRecord {
            filepath: path.to_string(),
            file_type,
            frontmatter: parsed.frontmatter,
            body: parsed.body,
            stat,
        })
    }

    /// Walk the vault breadth-first, skipping blacklisted paths.
    pub async fn list_dir(&self) -> DirListing {
        let mut listing = DirListing::new();
        let mut queue = VecDeque::from([String::new()]);

        while let Some(dir) = queue.pop_front() {
            let Some(children) = self.list_children(&dir, &mut listing).await else {
                continue;
            };
            for (index, child) in children.iter().enumerate() {
                let path = join(&dir, &child.name);
                if is_ignored(&path) {
                    continue;
                }
                let Some(entry) = self.snapshot(&path, child, index, &mut listing).await else {
                    continue;
                };
                if entry.is_dir {
                    queue.push_back(path);
                }
                listing.entries.push(entry);
            }
        }
        listing
    }

    /// Markdown files directly under `.events/`. A vault without the
    /// directory has a complete, empty listing.
    pub async fn list_events(&self) -> DirListing {
        let mut listing = DirListing::new();
        match self.fs.exists(EVENTS_DIR).await {
            Ok(true) => {}
            Ok(false) => return listing,
            Err(e) => {
                warn!("Failed to stat {}: {}", EVENTS_DIR, e);
                listing.complete = false;
                return listing;
            }
        }
        let Some(children) = self.list_children(EVENTS_DIR, &mut listing).await else {
            return listing;
        };
        for (index, child) in children.iter().enumerate() {
            if child.is_dir || FileType::from_path(&child.name) != FileType::Markdown {
                continue;
            }
            let path = join(EVENTS_DIR, &child.name);
            if let Some(entry) = self.snapshot(&path, child, index, &mut listing).await {
                listing.entries.push(entry);
            }
        }
        listing
    }

    async fn list_children(&self, dir: &str, listing: &mut DirListing) -> Option<Vec<FileEntry>> {
        match self.fs.list(dir).await {
            Ok(mut children) => {
                children.sort_by(|a, b| a.name.cmp(&b.name));
                Some(children)
            }
            Err(e) => {
                warn!("Failed to list {:?}: {}", dir, e);
                listing.complete = false;
                None
            }
        }
    }

    /// A path that vanished since its parent was listed is skipped; any
    /// other stat failure leaves the listing incomplete.
    async fn snapshot(
        &self,
        path: &str,
        child: &FileEntry,
        index: usize,
        listing: &mut DirListing,
    ) -> Option<DirEntry> {
        let stat = match self.fs.stat(path).await {
            Ok(stat) => stat,
            Err(FsError::NotFound(_)) => return None,
            Err(e) => {
                warn!("Failed to stat {}: {}", path, e);
                listing.complete = false;
                return None;
            }
        };
        let name = if child.is_dir {
            child.name.clone()
        } else {
            split_extension(&child.name).0.to_string()
        };
        Some(DirEntry {
            id: uuid::Uuid::new_v4().to_string(),
            filepath: path.to_string(),
            name,
            dir: parent(path).to_string(),
            file_type: (!child.is_dir).then(|| FileType::from_path(path)),
            is_dir: child.is_dir,
            created_at: stat.birthtime_millis as i64,
            updated_at: stat.mtime_millis as i64,
            order: index as f64 * ORDER_STEP,
        })
    }
}
