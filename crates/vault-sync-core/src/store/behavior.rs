//! Per-kind table behaviour: where an entity lives on disk and which
//! side effects follow a change.

use crate::change::Change;
use crate::entity::{Entity, EntityKind, Payload};
use crate::events::{EventBus, SyncEvent};
use crate::fs::{join, split_extension};
use crate::io::EVENTS_DIR;
use std::sync::Arc;

/// Canonical location of an entity before uniquification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilepathBase {
    /// Path without extension, e.g. `Projects/Plan`.
    pub stem: String,
    /// Extension without the dot, `None` for directories.
    pub ext: Option<String>,
}

impl FilepathBase {
    /// Candidate `n`: `stem.ext`, then `stem 1.ext`, `stem 2.ext`, ...
    pub fn candidate(&self, n: usize) -> String {
        let stem = if n == 0 {
            self.stem.clone()
        } else {
            format!("{} {}", self.stem, n)
        };
        match &self.ext {
            Some(ext) => format!("{}.{}", stem, ext),
            None => stem,
        }
    }
}

/// Replace characters that cannot appear in a file name.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').trim();
    if cleaned.is_empty() {
        "Untitled".to_string()
    } else {
        cleaned.to_string()
    }
}

pub trait TableBehavior: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Whether entities of this kind are materialised in the vault directory.
    fn has_file(&self) -> bool {
        false
    }

    /// Canonical path for `entity` given its parent folder's path.
    fn base_filepath(&self, _entity: &Entity, _parent_dir: &str) -> Option<FilepathBase> {
        None
    }

    /// Whether we may create a file for an entity that has none yet.
    fn creates_files(&self) -> bool {
        self.has_file()
    }

    /// Runs after client or device changes to this table were committed.
    fn after_local_changes(&self, _vault_id: &str, _changes: &[Change], _events: &Arc<EventBus>) {}

    /// Runs after remote changes to this table were committed.
    fn after_remote_changes(&self, _vault_id: &str, _changes: &[Change], _events: &Arc<EventBus>) {
    }
}

struct DocumentBehavior;

impl TableBehavior for DocumentBehavior {
    fn kind(&self) -> EntityKind {
        EntityKind::Document
    }

    fn has_file(&self) -> bool {
        true
    }

    fn base_filepath(&self, entity: &Entity, parent_dir: &str) -> Option<FilepathBase> {
        Some(FilepathBase {
            stem: join(parent_dir, &sanitize_name(entity.display_name())),
            ext: Some("md".into()),
        })
    }
}

struct EventBehavior;

impl EventBehavior {
    fn invalidate(&self, vault_id: &str, changes: &[Change], events: &Arc<EventBus>) {
        if !changes.is_empty() {
            events.emit(SyncEvent::RemindersInvalidated {
                vault_id: vault_id.to_string(),
            });
        }
    }
}

impl TableBehavior for EventBehavior {
    fn kind(&self) -> EntityKind {
        EntityKind::Event
    }

    fn has_file(&self) -> bool {
        true
    }

    fn base_filepath(&self, entity: &Entity, _parent_dir: &str) -> Option<FilepathBase> {
        Some(FilepathBase {
            stem: join(EVENTS_DIR, &sanitize_name(entity.display_name())),
            ext: Some("md".into()),
        })
    }

    fn after_local_changes(&self, vault_id: &str, changes: &[Change], events: &Arc<EventBus>) {
        self.invalidate(vault_id, changes, events);
    }

    fn after_remote_changes(&self, vault_id: &str, changes: &[Change], events: &Arc<EventBus>) {
        self.invalidate(vault_id, changes, events);
    }
}

struct FolderBehavior;

impl TableBehavior for FolderBehavior {
    fn kind(&self) -> EntityKind {
        EntityKind::Folder
    }

    fn has_file(&self) -> bool {
        true
    }

    fn base_filepath(&self, entity: &Entity, parent_dir: &str) -> Option<FilepathBase> {
        Some(FilepathBase {
            stem: join(parent_dir, &sanitize_name(entity.display_name())),
            ext: None,
        })
    }
}

/// Images are files managed outside the database: we only rename them.
struct ImageBehavior;

impl TableBehavior for ImageBehavior {
    fn kind(&self) -> EntityKind {
        EntityKind::Image
    }

    fn has_file(&self) -> bool {
        true
    }

    fn creates_files(&self) -> bool {
        false
    }

    fn base_filepath(&self, entity: &Entity, parent_dir: &str) -> Option<FilepathBase> {
        let current = entity.filepath.as_deref()?;
        let ext = split_extension(crate::fs::file_name(current)).1;
        let name = match &entity.payload {
            Payload::Image(image) => split_extension(&image.name).0.to_string(),
            _ => entity.display_name().to_string(),
        };
        Some(FilepathBase {
            stem: join(parent_dir, &sanitize_name(&name)),
            ext: ext.map(str::to_string),
        })
    }
}

/// Database-only kinds.
struct RecordBehavior(EntityKind);

impl TableBehavior for RecordBehavior {
    fn kind(&self) -> EntityKind {
        self.0
    }
}

pub fn behavior_for(kind: EntityKind) -> Arc<dyn TableBehavior> {
    match kind {
        EntityKind::Document => Arc::new(DocumentBehavior),
        EntityKind::Event => Arc::new(EventBehavior),
        EntityKind::Folder => Arc::new(FolderBehavior),
        EntityKind::Image => Arc::new(ImageBehavior),
        EntityKind::Task | EntityKind::Integration => Arc::new(RecordBehavior(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ImageFields;
    use crate::origin::WriteOrigin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_candidates() {
        let base = FilepathBase {
            stem: "Notes/Plan".into(),
            ext: Some("md".into()),
        };
        assert_eq!(base.candidate(0), "Notes/Plan.md");
        assert_eq!(base.candidate(2), "Notes/Plan 2.md");

        let dir = FilepathBase {
            stem: "Folder".into(),
            ext: None,
        };
        assert_eq!(dir.candidate(1), "Folder 1");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_name("a/b: c?"), "a-b- c-");
        assert_eq!(sanitize_name("  "), "Untitled");
        assert_eq!(sanitize_name(".hidden"), "hidden");
    }

    #[test]
    fn test_base_paths_per_kind() {
        let doc = Entity::document("v", "Plan");
        assert_eq!(
            behavior_for(EntityKind::Document)
                .base_filepath(&doc, "Work")
                .unwrap()
                .candidate(0),
            "Work/Plan.md"
        );

        let folder = Entity::folder("v", "Sub");
        assert_eq!(
            behavior_for(EntityKind::Folder)
                .base_filepath(&folder, "")
                .unwrap()
                .candidate(0),
            "Sub"
        );

        let mut image = Entity::new(
            "v",
            Payload::Image(ImageFields {
                name: "photo.png".into(),
                ..Default::default()
            }),
        );
        assert!(
            behavior_for(EntityKind::Image)
                .base_filepath(&image, "")
                .is_none()
        );
        image.filepath = Some("old.png".into());
        assert_eq!(
            behavior_for(EntityKind::Image)
                .base_filepath(&image, "Pics")
                .unwrap()
                .candidate(0),
            "Pics/photo.png"
        );

        assert!(!behavior_for(EntityKind::Task).has_file());
    }

    #[test]
    fn test_event_changes_invalidate_reminders() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = bus.subscribe(move |e| {
            if matches!(e, SyncEvent::RemindersInvalidated { .. }) {
                c.fetch_add(1, Ordering::Relaxed);
            }
        });

        let behavior = behavior_for(EntityKind::Event);
        behavior.after_remote_changes("v", &[], &bus);
        assert_eq!(count.load(Ordering::Relaxed), 0);

        let change = Change::create(Entity::document("v", "x"), WriteOrigin::Device);
        behavior.after_local_changes("v", &[change], &bus);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
