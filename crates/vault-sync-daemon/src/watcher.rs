//! File watcher with debouncing for vault changes.
//!
//! Uses notify-debouncer-mini for change detection. The debouncer only
//! reports paths, so `PathTracker` keeps the last stat of every known path
//! and turns each report into the add/change/unlink events that
//! `VaultWatcher` classifies.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, Debouncer, new_debouncer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};
use vault_sync_core::fs::FileStat;
use vault_sync_core::io::{ChangeRegister, is_ignored};
use vault_sync_core::watcher::{RawEvent, VaultWatcher, WatchEvent, WatchEventKind};

use crate::native_fs::stat_path;

/// Debounce period; long enough to swallow the bursts of a save.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// Vault-relative, `/`-separated path of `path`. `Some("")` for the root.
fn relative(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}

/// Last known stat of every watched path.
#[derive(Debug, Default)]
pub struct PathTracker {
    known: HashMap<String, FileStat>,
}

impl PathTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Walk `dir` (vault-relative) and record everything below it as added.
    pub fn scan(&mut self, root: &Path, dir: &str) -> Vec<RawEvent> {
        let mut out = Vec::new();
        self.scan_into(root, dir, &mut out);
        out
    }

    fn scan_into(&mut self, root: &Path, dir: &str, out: &mut Vec<RawEvent>) {
        let full = if dir.is_empty() { root.to_path_buf() } else { root.join(dir) };
        let Ok(entries) = std::fs::read_dir(&full) else {
            return;
        };
        let mut children: Vec<_> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
        children.sort();

        for child in children {
            let Some(path) = relative(root, &child) else {
                continue;
            };
            if is_ignored(&path) {
                continue;
            }
            let Ok(stat) = stat_path(&child) else {
                continue;
            };
            self.known.insert(path.clone(), stat);
            if stat.is_dir {
                out.push(RawEvent::AddDir { path: path.clone(), stat });
                self.scan_into(root, &path, out);
            } else {
                out.push(RawEvent::Add { path, stat });
            }
        }
    }

    /// Translate one debounced batch. Removals come first so a rename's
    /// unlink precedes its add.
    pub fn translate(&mut self, root: &Path, paths: &[PathBuf]) -> Vec<RawEvent> {
        let mut removed = Vec::new();
        let mut added = Vec::new();

        for full in paths {
            let Some(path) = relative(root, full) else {
                continue;
            };
            if path.is_empty() {
                if !root.exists() {
                    removed.push(RawEvent::UnlinkDir { path });
                }
                continue;
            }
            if is_ignored(&path) {
                continue;
            }

            match stat_path(full) {
                Ok(stat) => match self.known.insert(path.clone(), stat) {
                    None if stat.is_dir => {
                        added.push(RawEvent::AddDir { path: path.clone(), stat });
                        self.scan_into(root, &path, &mut added);
                    }
                    None => added.push(RawEvent::Add { path, stat }),
                    Some(prev) if stat.is_dir || prev.mtime_millis == stat.mtime_millis => {
                        // Spurious report with unchanged mtime
                    }
                    Some(_) => added.push(RawEvent::Change { path, stat }),
                },
                Err(_) => {
                    let Some(prev) = self.known.remove(&path) else {
                        continue;
                    };
                    if prev.is_dir {
                        let prefix = format!("{}/", path);
                        self.known.retain(|p, _| !p.starts_with(&prefix));
                        removed.push(RawEvent::UnlinkDir { path });
                    } else {
                        removed.push(RawEvent::Unlink { path });
                    }
                }
            }
        }

        removed.extend(added);
        removed
    }
}

/// Running watcher of one vault directory.
pub struct VaultWatch {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
    task: JoinHandle<()>,
}

impl VaultWatch {
    pub fn stop(self) {
        self.task.abort();
    }
}

/// Watch `vault_path` and send classified event batches. The channel
/// closes after a `VaultDeleted` batch.
pub fn spawn_vault_watcher(
    vault_id: String,
    vault_path: PathBuf,
    register: ChangeRegister,
) -> Result<(VaultWatch, mpsc::UnboundedReceiver<Vec<WatchEvent>>)> {
    // Canonicalize the path to resolve symlinks. On macOS, /var/folders/...
    // is actually /private/var/folders/..., and FSEvents needs the real path.
    let root = vault_path.canonicalize().unwrap_or(vault_path);

    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();
    let mut debouncer = new_debouncer(
        DEBOUNCE,
        move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
            Ok(events) => {
                let _ = raw_tx.send(events.into_iter().map(|e| e.path).collect());
            }
            Err(e) => error!("File watcher error: {}", e),
        },
    )?;
    debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let mut tracker = PathTracker::new();
        let mut watcher = VaultWatcher::new(vault_id, register);
        watcher.start();
        for raw in tracker.scan(&root, "") {
            watcher.handle(raw, Instant::now());
        }
        watcher.mark_ready();
        info!("Watching {} ({} paths)", root.display(), tracker.len());

        loop {
            let deadline = watcher.next_deadline();
            let batch = tokio::select! {
                paths = raw_rx.recv() => {
                    let Some(paths) = paths else { break };
                    let mut out = Vec::new();
                    for raw in tracker.translate(&root, &paths) {
                        debug!("raw {:?}", raw);
                        if let Some(batch) = watcher.handle(raw, Instant::now()) {
                            out.extend(batch);
                        }
                    }
                    out
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    watcher.poll(Instant::now()).unwrap_or_default()
                }
            };
            if batch.is_empty() {
                continue;
            }

            let deleted = batch.iter().any(|e| e.kind == WatchEventKind::VaultDeleted);
            if tx.send(batch).is_err() || deleted {
                break;
            }
        }
    });

    Ok((
        VaultWatch {
            _debouncer: debouncer,
            task,
        },
        rx,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_skips_hidden_paths() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("notes")).unwrap();
        std::fs::create_dir_all(dir.path().join(".sync")).unwrap();
        std::fs::write(dir.path().join("notes/a.md"), "a").unwrap();
        std::fs::write(dir.path().join(".sync/state.json"), "{}").unwrap();

        let mut tracker = PathTracker::new();
        let events = tracker.scan(dir.path(), "");
        let paths: Vec<_> = events.iter().map(|e| e.path().to_string()).collect();
        assert_eq!(paths, vec!["notes", "notes/a.md"]);
    }

    #[test]
    fn test_translate_add_change_and_unlink() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let mut tracker = PathTracker::new();

        std::fs::write(root.join("a.md"), "a").unwrap();
        let events = tracker.translate(root, &[root.join("a.md")]);
        assert!(matches!(&events[..], [RawEvent::Add { path, .. }] if path == "a.md"));

        // Same mtime reported again
        assert!(tracker.translate(root, &[root.join("a.md")]).is_empty());

        let file = std::fs::File::options().write(true).open(root.join("a.md")).unwrap();
        file.set_modified(std::time::UNIX_EPOCH + Duration::from_secs(1_000)).unwrap();
        let events = tracker.translate(root, &[root.join("a.md")]);
        assert!(matches!(&events[..], [RawEvent::Change { .. }]));

        std::fs::remove_file(root.join("a.md")).unwrap();
        let events = tracker.translate(root, &[root.join("a.md")]);
        assert!(matches!(&events[..], [RawEvent::Unlink { path }] if path == "a.md"));
    }

    #[test]
    fn test_translate_directory_rename_orders_unlink_first() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("old")).unwrap();
        std::fs::write(root.join("old/n.md"), "n").unwrap();

        let mut tracker = PathTracker::new();
        tracker.scan(root, "");
        std::fs::rename(root.join("old"), root.join("new")).unwrap();

        let events = tracker.translate(root, &[root.join("new"), root.join("old")]);
        let shape: Vec<_> = events
            .iter()
            .map(|e| match e {
                RawEvent::UnlinkDir { path } => format!("-{}/", path),
                RawEvent::AddDir { path, .. } => format!("+{}/", path),
                RawEvent::Add { path, .. } => format!("+{}", path),
                other => format!("?{}", other.path()),
            })
            .collect();
        assert_eq!(shape, vec!["-old/", "+new/", "+new/n.md"]);
        assert_eq!(tracker.len(), 2);
    }
}
