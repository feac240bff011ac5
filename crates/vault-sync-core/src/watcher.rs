//! Filesystem watcher classifier.
//!
//! Turns raw add/unlink/change notifications into vault-level events:
//! renames are recognised by file identity (`"{inode} {birthtime}"`), a
//! markdown unlink waits `DELETE_TIMEOUT` for a matching add before it
//! becomes a delete, and anything the change register says we caused
//! ourselves is dropped. The platform driver (see vault-sync-daemon) feeds
//! raw events in and calls `poll` at `next_deadline`.

use crate::batch::MicroBatch;
use crate::fs::FileStat;
use crate::io::{ChangeRegister, FileType, is_ignored};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Queue flush interval.
pub const PROCESS_DELAY: Duration = Duration::from_millis(100);
/// How long an unlink waits for the add that would make it a rename.
pub const DELETE_TIMEOUT: Duration = Duration::from_millis(2000);
const QUEUE_LIMIT: usize = 1000;

/// Notification from the platform watcher, already stat'ed where possible.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Add { path: String, stat: FileStat },
    AddDir { path: String, stat: FileStat },
    Change { path: String, stat: FileStat },
    Unlink { path: String },
    UnlinkDir { path: String },
}

impl RawEvent {
    pub fn path(&self) -> &str {
        match self {
            RawEvent::Add { path, .. }
            | RawEvent::AddDir { path, .. }
            | RawEvent::Change { path, .. }
            | RawEvent::Unlink { path }
            | RawEvent::UnlinkDir { path } => path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WatchEventKind {
    Add,
    Change,
    Delete,
    Rename,
    VaultDeleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WatchEntity {
    Document,
    Folder,
    Attachment,
    Config,
    Vault,
}

impl WatchEntity {
    fn for_file(file_type: FileType) -> Option<Self> {
        match file_type {
            FileType::Markdown => Some(WatchEntity::Document),
            FileType::Attachment => Some(WatchEntity::Attachment),
            FileType::Config => Some(WatchEntity::Config),
            FileType::Unsupported => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub entity: WatchEntity,
    /// Current path (the destination for renames).
    pub path: String,
    /// Source path of a rename.
    pub from: Option<String>,
    pub stat: Option<FileStat>,
}

impl WatchEvent {
    fn new(kind: WatchEventKind, entity: WatchEntity, path: &str, stat: Option<FileStat>) -> Self {
        Self {
            kind,
            entity,
            path: path.to_string(),
            from: None,
            stat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Unwatched,
    Watching { ready: bool },
    Closed,
}

#[derive(Debug, Clone)]
struct Known {
    path: String,
    entity: WatchEntity,
}

#[derive(Debug, Clone)]
struct PendingUnlink {
    identity: Option<String>,
    path: String,
    entity: WatchEntity,
    deadline: Instant,
}

pub struct VaultWatcher {
    vault_id: String,
    register: ChangeRegister,
    state: WatcherState,
    /// identity -> last known location
    identities: HashMap<String, Known>,
    /// path -> identity
    paths: HashMap<String, String>,
    pending: Vec<PendingUnlink>,
    queue: MicroBatch<WatchEvent>,
}

impl VaultWatcher {
    pub fn new(vault_id: impl Into<String>, register: ChangeRegister) -> Self {
        Self {
            vault_id: vault_id.into(),
            register,
            state: WatcherState::Unwatched,
            identities: HashMap::new(),
            paths: HashMap::new(),
            pending: Vec::new(),
            queue: MicroBatch::new(PROCESS_DELAY, QUEUE_LIMIT),
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    /// Begin watching; events only populate the identity map until `mark_ready`.
    pub fn start(&mut self) {
        if self.state == WatcherState::Unwatched {
            self.state = WatcherState::Watching { ready: false };
        }
    }

    /// Initial scan finished.
    pub fn mark_ready(&mut self) {
        if let WatcherState::Watching { .. } = self.state {
            self.state = WatcherState::Watching { ready: true };
            info!("Watcher ready for vault {} ({} paths)", self.vault_id, self.paths.len());
        }
    }

    pub fn close(&mut self) {
        self.state = WatcherState::Closed;
        self.pending.clear();
        self.queue.take();
    }

    fn remember(&mut self, path: &str, stat: &FileStat, entity: WatchEntity) {
        let identity = stat.identity();
        if let Some(old) = self.paths.insert(path.to_string(), identity.clone())
            && old != identity
        {
            self.identities.remove(&old);
        }
        if let Some(prev) = self.identities.insert(
            identity,
            Known {
                path: path.to_string(),
                entity,
            },
        ) && prev.path != path
        {
            self.paths.remove(&prev.path);
        }
    }

    fn forget_path(&mut self, path: &str) -> Option<String> {
        self.paths.remove(path)
    }

    fn enqueue(&mut self, event: WatchEvent, now: Instant) -> Option<Vec<WatchEvent>> {
        debug!("watch {:?} {:?} {}", event.kind, event.entity, event.path);
        self.queue.push(event, now).map(finalize)
    }

    /// Feed one raw event. Returns a batch when the queue filled up, or the
    /// terminal `VaultDeleted` batch.
    pub fn handle(&mut self, raw: RawEvent, now: Instant) -> Option<Vec<WatchEvent>> {
        let ready = match self.state {
            WatcherState::Watching { ready } => ready,
            _ => return None,
        };

        if let RawEvent::UnlinkDir { path } = &raw
            && path.is_empty()
        {
            info!("Vault {} root removed", self.vault_id);
            self.close();
            return Some(vec![WatchEvent::new(
                WatchEventKind::VaultDeleted,
                WatchEntity::Vault,
                "",
                None,
            )]);
        }
        if raw.path().is_empty() || is_ignored(raw.path()) {
            return None;
        }

        match raw {
            RawEvent::Add { path, stat } => {
                let entity = WatchEntity::for_file(FileType::from_path(&path))?;
                self.on_add(path, stat, entity, ready, now)
            }
            RawEvent::AddDir { path, stat } => {
                self.on_add(path, stat, WatchEntity::Folder, ready, now)
            }
            RawEvent::Change { path, stat } => {
                let entity = WatchEntity::for_file(FileType::from_path(&path))?;
                self.remember(&path, &stat, entity);
                if !ready || self.register.take_file_write(&self.vault_id, &path, &stat) {
                    return None;
                }
                self.enqueue(
                    WatchEvent::new(WatchEventKind::Change, entity, &path, Some(stat)),
                    now,
                )
            }
            RawEvent::Unlink { path } => {
                let file_type = FileType::from_path(&path);
                let entity = WatchEntity::for_file(file_type)?;
                let identity = self.forget_path(&path);
                if !ready {
                    return None;
                }
                if file_type == FileType::Markdown {
                    self.pending.push(PendingUnlink {
                        identity,
                        path,
                        entity,
                        deadline: now + DELETE_TIMEOUT,
                    });
                    return None;
                }
                if let Some(identity) = identity {
                    self.identities.remove(&identity);
                }
                if self.register.take_delete(&self.vault_id, &path) {
                    return None;
                }
                self.enqueue(WatchEvent::new(WatchEventKind::Delete, entity, &path, None), now)
            }
            RawEvent::UnlinkDir { path } => {
                let identity = self.forget_path(&path);
                if ready {
                    self.pending.push(PendingUnlink {
                        identity,
                        path,
                        entity: WatchEntity::Folder,
                        deadline: now + DELETE_TIMEOUT,
                    });
                }
                None
            }
        }
    }

    fn on_add(
        &mut self,
        path: String,
        stat: FileStat,
        entity: WatchEntity,
        ready: bool,
        now: Instant,
    ) -> Option<Vec<WatchEvent>> {
        let identity = stat.identity();
        self.remember(&path, &stat, entity);
        if !ready {
            return None;
        }

        let matched = self.pending.iter().position(|p| {
            p.identity.as_deref() == Some(identity.as_str()) && p.path != path && now < p.deadline
        });
        if let Some(index) = matched {
            let from = self.pending.remove(index).path;
            if self.register.take_rename(&self.vault_id, &from, &path) {
                // A rewrite right after our own rename lands in the same event
                self.register.take_file_write(&self.vault_id, &path, &stat);
                return None;
            }
            let mut event = WatchEvent::new(WatchEventKind::Rename, entity, &path, Some(stat));
            event.from = Some(from);
            return self.enqueue(event, now);
        }

        if self.register.take_file_write(&self.vault_id, &path, &stat) {
            return None;
        }
        self.enqueue(WatchEvent::new(WatchEventKind::Add, entity, &path, Some(stat)), now)
    }

    /// Expire unlink grace periods and flush the queue when due.
    pub fn poll(&mut self, now: Instant) -> Option<Vec<WatchEvent>> {
        if self.state == WatcherState::Closed {
            return None;
        }
        let (expired, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| now >= p.deadline);
        self.pending = waiting;

        let mut full = None;
        for unlink in expired {
            if let Some(identity) = &unlink.identity {
                self.identities.remove(identity);
            }
            if self.register.take_delete(&self.vault_id, &unlink.path) {
                continue;
            }
            let event = WatchEvent::new(WatchEventKind::Delete, unlink.entity, &unlink.path, None);
            if let Some(batch) = self.enqueue(event, now) {
                full.get_or_insert_with(Vec::new).extend(batch);
            }
        }

        if full.is_some() || self.queue.is_due(now) {
            let mut batch = full.unwrap_or_default();
            batch.extend(self.queue.take());
            return Some(finalize(batch));
        }
        None
    }

    /// Earliest instant at which `poll` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .iter()
            .map(|p| p.deadline)
            .chain(self.queue.deadline())
            .min()
    }

    /// Flush the queue now, regardless of its deadline.
    pub fn flush(&mut self) -> Vec<WatchEvent> {
        finalize(self.queue.take())
    }

    pub fn known_paths(&self) -> usize {
        self.paths.len()
    }
}

/// De-duplicate by (event, entity, path), keeping the latest, and order
/// shortest path first so parents precede children.
fn finalize(events: Vec<WatchEvent>) -> Vec<WatchEvent> {
    let mut seen = HashSet::new();
    let mut out: Vec<WatchEvent> = events
        .into_iter()
        .rev()
        .filter(|e| seen.insert((e.kind, e.entity, e.path.clone())))
        .collect();
    out.reverse();
    out.sort_by_key(|e| e.path.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(ino: u64, mtime: u64) -> FileStat {
        FileStat {
            mtime_millis: mtime,
            birthtime_millis: 7,
            ino,
            size: 1,
            is_dir: false,
        }
    }

    fn dir_stat(ino: u64) -> FileStat {
        FileStat {
            is_dir: true,
            ..stat(ino, 0)
        }
    }

    fn ready_watcher() -> (VaultWatcher, ChangeRegister) {
        let register = ChangeRegister::new();
        let mut watcher = VaultWatcher::new("v", register.clone());
        watcher.start();
        watcher.mark_ready();
        (watcher, register)
    }

    fn add(path: &str, stat: FileStat) -> RawEvent {
        RawEvent::Add {
            path: path.into(),
            stat,
        }
    }

    fn unlink(path: &str) -> RawEvent {
        RawEvent::Unlink { path: path.into() }
    }

    #[test]
    fn test_not_ready_only_populates_identities() {
        let mut watcher = VaultWatcher::new("v", ChangeRegister::new());
        let t0 = Instant::now();
        assert!(watcher.handle(add("a.md", stat(1, 1)), t0).is_none());
        assert_eq!(watcher.known_paths(), 0);

        watcher.start();
        watcher.handle(add("a.md", stat(1, 1)), t0);
        assert_eq!(watcher.known_paths(), 1);
        assert!(watcher.poll(t0 + PROCESS_DELAY).is_none());
        assert!(watcher.next_deadline().is_none());
    }

    #[test]
    fn test_external_add_emitted_after_delay() {
        let (mut watcher, _) = ready_watcher();
        let t0 = Instant::now();
        watcher.handle(add("Notes/a.md", stat(1, 1)), t0);

        assert!(watcher.poll(t0 + Duration::from_millis(99)).is_none());
        let batch = watcher.poll(t0 + PROCESS_DELAY).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, WatchEventKind::Add);
        assert_eq!(batch[0].entity, WatchEntity::Document);
    }

    #[test]
    fn test_own_write_suppressed_exactly_once() {
        let (mut watcher, register) = ready_watcher();
        let t0 = Instant::now();
        register.register_file_write("v", "a.md", &stat(1, 50));

        watcher.handle(RawEvent::Change { path: "a.md".into(), stat: stat(1, 50) }, t0);
        assert!(watcher.poll(t0 + PROCESS_DELAY).is_none());

        // A second event for the same write is an external change
        watcher.handle(RawEvent::Change { path: "a.md".into(), stat: stat(1, 50) }, t0);
        let batch = watcher.poll(t0 + PROCESS_DELAY).unwrap();
        assert_eq!(batch[0].kind, WatchEventKind::Change);
    }

    #[test]
    fn test_rename_within_grace() {
        let (mut watcher, _) = ready_watcher();
        let t0 = Instant::now();
        watcher.handle(add("old.md", stat(3, 1)), t0);
        watcher.poll(t0 + PROCESS_DELAY);

        let t1 = t0 + Duration::from_secs(1);
        watcher.handle(unlink("old.md"), t1);
        watcher.handle(add("new.md", stat(3, 1)), t1 + Duration::from_millis(1999));

        let batch = watcher.poll(t1 + Duration::from_millis(1999) + PROCESS_DELAY).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, WatchEventKind::Rename);
        assert_eq!(batch[0].from.as_deref(), Some("old.md"));
        assert_eq!(batch[0].path, "new.md");
        // No delete follows once the grace would have expired
        assert!(watcher.poll(t1 + Duration::from_secs(5)).is_none());
    }

    #[test]
    fn test_delete_then_create_at_boundary() {
        let (mut watcher, _) = ready_watcher();
        let t0 = Instant::now();
        watcher.handle(add("old.md", stat(3, 1)), t0);
        watcher.poll(t0 + PROCESS_DELAY);

        let t1 = t0 + Duration::from_secs(1);
        watcher.handle(unlink("old.md"), t1);
        assert_eq!(watcher.next_deadline(), Some(t1 + DELETE_TIMEOUT));

        // The expired unlink is queued like any other event
        assert!(watcher.poll(t1 + DELETE_TIMEOUT).is_none());
        watcher.handle(add("new.md", stat(3, 1)), t1 + DELETE_TIMEOUT);

        let batch = watcher.poll(t1 + DELETE_TIMEOUT + PROCESS_DELAY).unwrap();
        let summary: Vec<_> = batch.iter().map(|e| (e.kind, e.path.as_str())).collect();
        assert_eq!(
            summary,
            vec![
                (WatchEventKind::Delete, "old.md"),
                (WatchEventKind::Add, "new.md"),
            ]
        );
    }

    #[test]
    fn test_own_rename_and_delete_suppressed() {
        let (mut watcher, register) = ready_watcher();
        let t0 = Instant::now();
        watcher.handle(add("a.md", stat(4, 1)), t0);
        watcher.handle(add("b.md", stat(5, 1)), t0);
        watcher.poll(t0 + PROCESS_DELAY);

        register.register_rename("v", "a.md", "c.md");
        register.register_delete("v", "b.md");
        let t1 = t0 + Duration::from_secs(1);
        watcher.handle(unlink("a.md"), t1);
        watcher.handle(add("c.md", stat(4, 1)), t1);
        watcher.handle(unlink("b.md"), t1);

        assert!(watcher.poll(t1 + DELETE_TIMEOUT).is_none());
        assert!(register.is_empty());
    }

    #[test]
    fn test_attachment_unlink_is_immediate() {
        let (mut watcher, _) = ready_watcher();
        let t0 = Instant::now();
        watcher.handle(add("pic.png", stat(6, 1)), t0);
        watcher.handle(unlink("pic.png"), t0);

        let batch = watcher.poll(t0 + PROCESS_DELAY).unwrap();
        let kinds: Vec<_> = batch.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![WatchEventKind::Add, WatchEventKind::Delete]);
        assert_eq!(batch[1].entity, WatchEntity::Attachment);
    }

    #[test]
    fn test_unsupported_and_ignored_dropped() {
        let (mut watcher, _) = ready_watcher();
        let t0 = Instant::now();
        watcher.handle(add("doc.pdf", stat(1, 1)), t0);
        watcher.handle(add(".obsidian/app.json", stat(2, 1)), t0);
        watcher.handle(add("My Day/x.md", stat(3, 1)), t0);
        assert!(watcher.next_deadline().is_none());
    }

    #[test]
    fn test_folder_unlink_waits_for_rename() {
        let (mut watcher, _) = ready_watcher();
        let t0 = Instant::now();
        watcher.handle(RawEvent::AddDir { path: "A".into(), stat: dir_stat(9) }, t0);
        watcher.poll(t0 + PROCESS_DELAY);

        watcher.handle(RawEvent::UnlinkDir { path: "A".into() }, t0 + PROCESS_DELAY);
        watcher.handle(RawEvent::AddDir { path: "B".into(), stat: dir_stat(9) }, t0 + PROCESS_DELAY);
        let batch = watcher.poll(t0 + PROCESS_DELAY * 2).unwrap();
        assert_eq!(batch[0].kind, WatchEventKind::Rename);
        assert_eq!(batch[0].entity, WatchEntity::Folder);
    }

    #[test]
    fn test_root_removal_closes_watcher() {
        let (mut watcher, _) = ready_watcher();
        let t0 = Instant::now();
        watcher.handle(add("a.md", stat(1, 1)), t0);

        let batch = watcher.handle(RawEvent::UnlinkDir { path: String::new() }, t0).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, WatchEventKind::VaultDeleted);
        assert_eq!(watcher.state(), WatcherState::Closed);

        assert!(watcher.handle(add("b.md", stat(2, 1)), t0).is_none());
        assert!(watcher.poll(t0 + DELETE_TIMEOUT).is_none());
    }

    #[test]
    fn test_dedup_and_shortest_path_first() {
        let (mut watcher, _) = ready_watcher();
        let t0 = Instant::now();
        watcher.handle(add("Deep/Nested/n.md", stat(1, 1)), t0);
        watcher.handle(RawEvent::AddDir { path: "Deep".into(), stat: dir_stat(2) }, t0);
        watcher.handle(RawEvent::Change { path: "Deep/Nested/n.md".into(), stat: stat(1, 2) }, t0);
        watcher.handle(RawEvent::Change { path: "Deep/Nested/n.md".into(), stat: stat(1, 3) }, t0);

        let batch = watcher.poll(t0 + PROCESS_DELAY).unwrap();
        let summary: Vec<_> = batch.iter().map(|e| (e.kind, e.path.as_str())).collect();
        assert_eq!(
            summary,
            vec![
                (WatchEventKind::Add, "Deep"),
                (WatchEventKind::Add, "Deep/Nested/n.md"),
                (WatchEventKind::Change, "Deep/Nested/n.md"),
            ]
        );
        assert_eq!(batch[2].stat.map(|s| s.mtime_millis), Some(3));
    }
}
