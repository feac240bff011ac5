//! Change register: expected filesystem events caused by our own writes.
//!
//! The writer records every write, delete and rename it performs *before*
//! the OS can report it; the watcher consumes the matching entry and drops
//! the event. Write keys include the inode and (for files) the truncated
//! mtime, so deleting a file and recreating it at the same path is never
//! mistaken for our own write. Unobserved entries expire after `ENTRY_TTL`.

use crate::fs::FileStat;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use web_time::Instant;

/// Lifetime of an entry that was never observed by the watcher.
pub const ENTRY_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct RegisterState {
    writes: HashMap<String, Instant>,
    deletes: HashMap<String, Instant>,
    /// `to` key -> (`from` path, registered at)
    renames: HashMap<String, (String, Instant)>,
}

/// Shared handle; clones see the same entries.
#[derive(Debug, Clone)]
pub struct ChangeRegister {
    state: Arc<Mutex<RegisterState>>,
    ttl: Duration,
}

impl Default for ChangeRegister {
    fn default() -> Self {
        Self::with_ttl(ENTRY_TTL)
    }
}

fn write_key(vault_id: &str, path: &str, stat: &FileStat) -> String {
    if stat.is_dir {
        format!("{}\0{} {}", vault_id, path, stat.ino)
    } else {
        format!("{}\0{} {} {}", vault_id, path, stat.ino, stat.mtime_millis)
    }
}

fn path_key(vault_id: &str, path: &str) -> String {
    format!("{}\0{}", vault_id, path)
}

impl ChangeRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegisterState::default())),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegisterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fresh(&self, at: &Instant) -> bool {
        at.elapsed() < self.ttl
    }

    // ========== Registration ==========

    pub fn register_file_write(&self, vault_id: &str, path: &str, stat: &FileStat) {
        let key = write_key(vault_id, path, stat);
        tracing::trace!("register write {}", key);
        self.lock().writes.insert(key, Instant::now());
    }

    pub fn register_delete(&self, vault_id: &str, path: &str) {
        self.lock()
            .deletes
            .insert(path_key(vault_id, path), Instant::now());
    }

    pub fn register_rename(&self, vault_id: &str, from: &str, to: &str) {
        self.lock()
            .renames
            .insert(path_key(vault_id, to), (from.to_string(), Instant::now()));
    }

    // ========== Non-destructive checks ==========

    pub fn is_file_write(&self, vault_id: &str, path: &str, stat: &FileStat) -> bool {
        let key = write_key(vault_id, path, stat);
        self.lock().writes.get(&key).is_some_and(|at| self.fresh(at))
    }

    pub fn is_delete(&self, vault_id: &str, path: &str) -> bool {
        let key = path_key(vault_id, path);
        self.lock().deletes.get(&key).is_some_and(|at| self.fresh(at))
    }

    pub fn is_rename(&self, vault_id: &str, from: &str, to: &str) -> bool {
        let key = path_key(vault_id, to);
        self.lock()
            .renames
            .get(&key)
            .is_some_and(|(f, at)| f == from && self.fresh(at))
    }

    /// True when any write to `path` is still expected, whatever its stat.
    pub fn has_pending_write(&self, vault_id: &str, path: &str) -> bool {
        let prefix = format!("{} ", path_key(vault_id, path));
        self.lock()
            .writes
            .iter()
            .any(|(key, at)| key.starts_with(&prefix) && self.fresh(at))
    }

    // ========== Removal ==========

    pub fn delete_file_write(&self, vault_id: &str, path: &str, stat: &FileStat) {
        self.lock().writes.remove(&write_key(vault_id, path, stat));
    }

    pub fn delete_file_delete(&self, vault_id: &str, path: &str) {
        self.lock().deletes.remove(&path_key(vault_id, path));
    }

    pub fn delete_rename(&self, vault_id: &str, to: &str) {
        self.lock().renames.remove(&path_key(vault_id, to));
    }

    // ========== Check and consume ==========

    /// Consume a matching write entry. Returns true exactly once per registration.
    pub fn take_file_write(&self, vault_id: &str, path: &str, stat: &FileStat) -> bool {
        let key = write_key(vault_id, path, stat);
        let taken = self.lock().writes.remove(&key);
        taken.is_some_and(|at| self.fresh(&at))
    }

    pub fn take_delete(&self, vault_id: &str, path: &str) -> bool {
        let taken = self.lock().deletes.remove(&path_key(vault_id, path));
        taken.is_some_and(|at| self.fresh(&at))
    }

    pub fn take_rename(&self, vault_id: &str, from: &str, to: &str) -> bool {
        let key = path_key(vault_id, to);
        let mut state = self.lock();
        match state.renames.get(&key) {
            Some((f, _)) if f == from => {}
            _ => return false,
        }
        state
            .renames
            .remove(&key)
            .is_some_and(|(_, at)| self.fresh(&at))
    }

    /// Drop entries older than the TTL.
    pub fn prune_expired(&self) {
        let ttl = self.ttl;
        let mut state = self.lock();
        state.writes.retain(|_, at| at.elapsed() < ttl);
        state.deletes.retain(|_, at| at.elapsed() < ttl);
        state.renames.retain(|_, (_, at)| at.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        let state = self.lock();
        state.writes.len() + state.deletes.len() + state.renames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
