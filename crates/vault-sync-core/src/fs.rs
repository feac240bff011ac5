//! FileSystem trait abstraction for vault directory access.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in vault-sync-daemon) - Uses tokio::fs
//!
//! Paths are vault-relative and `/`-separated; the empty string is the root.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// Creation time in milliseconds since epoch
    pub birthtime_millis: u64,
    /// Inode number (0 where the platform has none)
    pub ino: u64,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

impl FileStat {
    /// Key identifying the physical file across renames.
    pub fn identity(&self) -> String {
        format!("{} {}", self.ino, self.birthtime_millis)
    }
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Filesystem abstraction used by the reader, writer and importer.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Move a file or directory. Inode and birthtime are preserved.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Overwrite the modification time.
    async fn set_mtime(&self, path: &str, mtime_millis: u64) -> Result<()>;
}

/// Join a vault-relative directory and a name.
pub fn join(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Parent directory of a vault-relative path (`""` for top-level entries).
pub fn parent(path: &str) -> &str {
    let path = path.trim_matches('/');
    match path.rfind('/') {
        Some(pos) => &path[..pos],
        None => "",
    }
}

/// Last segment of a vault-relative path.
pub fn file_name(path: &str) -> &str {
    let path = path.trim_matches('/');
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Split `name.ext` into (`name`, `Some("ext")`). Dotfiles have no extension.
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], Some(&name[pos + 1..])),
        _ => (name, None),
    }
}

#[derive(Debug, Clone)]
struct Node {
    content: Option<Vec<u8>>,
    ino: u64,
    birthtime: u64,
    mtime: u64,
}

impl Node {
    fn is_dir(&self) -> bool {
        self.content.is_none()
    }
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    nodes: RwLock<HashMap<String, Node>>,
    next_ino: AtomicU64,
    /// Directories whose listing fails with an I/O error.
    unlistable: RwLock<HashSet<String>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            String::new(),
            Node {
                content: None,
                ino: 1,
                birthtime: 0,
                mtime: 0,
            },
        );
        Self {
            nodes: RwLock::new(nodes),
            next_ino: AtomicU64::new(2),
            unlistable: RwLock::new(HashSet::new()),
        }
    }

    /// Make every later `list(path)` fail, as an unreadable directory would.
    pub fn fail_list(&self, path: &str) {
        self.unlistable
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(Self::normalize_path(path));
    }

    fn current_time_ms() -> u64 {
        crate::entity::now_millis().max(0) as u64
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn new_node(&self, content: Option<Vec<u8>>) -> Node {
        let now = Self::current_time_ms();
        Node {
            content,
            ino: self.next_ino.fetch_add(1, Ordering::Relaxed),
            birthtime: now,
            mtime: now,
        }
    }

    fn read_nodes(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Node>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_nodes(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Node>> {
        self.nodes.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create `path` and its missing ancestors as directories.
    fn ensure_dirs(&self, nodes: &mut HashMap<String, Node>, path: &str) -> Result<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = join(&current, segment);
            match nodes.get(&current) {
                Some(node) if !node.is_dir() => return Err(FsError::NotDirectory(current)),
                Some(_) => {}
                None => {
                    let node = self.new_node(None);
                    nodes.insert(current.clone(), node);
                }
            }
        }
        Ok(())
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        match self.read_nodes().get(&path) {
            Some(Node {
                content: Some(bytes),
                ..
            }) => Ok(bytes.clone()),
            Some(_) => Err(FsError::IsDirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        let mut nodes = self.write_nodes();
        self.ensure_dirs(&mut nodes, parent(&path))?;

        let now = Self::current_time_ms();
        match nodes.get_mut(&path) {
            Some(node) if node.is_dir() => Err(FsError::IsDirectory(path)),
            Some(node) => {
                node.content = Some(content.to_vec());
                node.mtime = now;
                Ok(())
            }
            None => {
                let node = self.new_node(Some(content.to_vec()));
                nodes.insert(path, node);
                Ok(())
            }
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        if self.unlistable.read().unwrap_or_else(|e| e.into_inner()).contains(&path) {
            return Err(FsError::Io(format!("permission denied: {}", path)));
        }
        let nodes = self.read_nodes();
        match nodes.get(&path) {
            Some(node) if !node.is_dir() => return Err(FsError::NotDirectory(path)),
            None => return Err(FsError::NotFound(path)),
            _ => {}
        }

        let mut entries: Vec<FileEntry> = nodes
            .iter()
            .filter(|(p, _)| !p.is_empty() && p.as_str() != path && parent(p) == path)
            .map(|(p, node)| FileEntry {
                name: file_name(p).to_string(),
                is_dir: node.is_dir(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        let mut nodes = self.write_nodes();
        let node = nodes
            .get(&path)
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        if node.is_dir() && nodes.keys().any(|p| !p.is_empty() && parent(p) == path && *p != path)
        {
            return Err(FsError::NotEmpty(path));
        }
        nodes.remove(&path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        Ok(self.read_nodes().contains_key(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = Self::normalize_path(path);
        let nodes = self.read_nodes();
        let node = nodes.get(&path).ok_or(FsError::NotFound(path))?;
        Ok(FileStat {
            mtime_millis: node.mtime,
            birthtime_millis: node.birthtime,
            ino: node.ino,
            size: node.content.as_ref().map(|c| c.len() as u64).unwrap_or(0),
            is_dir: node.is_dir(),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        let mut nodes = self.write_nodes();
        self.ensure_dirs(&mut nodes, &path)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = Self::normalize_path(from);
        let to = Self::normalize_path(to);
        if from == to {
            return Ok(());
        }
        let mut nodes = self.write_nodes();
        if !nodes.contains_key(&from) {
            return Err(FsError::NotFound(from));
        }
        if nodes.contains_key(&to) {
            return Err(FsError::AlreadyExists(to));
        }
        self.ensure_dirs(&mut nodes, parent(&to))?;

        let prefix = format!("{}/", from);
        let moved: Vec<String> = nodes
            .keys()
            .filter(|p| **p == from || p.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = nodes.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                nodes.insert(new, node);
            }
        }
        Ok(())
    }

    async fn set_mtime(&self, path: &str, mtime_millis: u64) -> Result<()> {
        let path = Self::normalize_path(path);
        let mut nodes = self.write_nodes();
        let node = nodes.get_mut(&path).ok_or(FsError::NotFound(path))?;
        node.mtime = mtime_millis;
        Ok(())
    }
}

// Lets the reader, writer and tests share one filesystem
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        (**self).rename(from, to).await
    }

    async fn set_mtime(&self, path: &str, mtime_millis: u64) -> Result<()> {
        (**self).set_mtime(path, mtime_millis).await
    }
}

/// Recursively collect every path below `dir` (files and directories).
pub async fn walk<F: FileSystem + ?Sized>(fs: &F, dir: &str) -> Result<Vec<(String, bool)>> {
    let mut out = Vec::new();
    let mut pending = vec![dir.to_string()];
    let mut seen = HashSet::new();
    while let Some(current) = pending.pop() {
        if !seen.insert(current.clone()) {
            continue;
        }
        for entry in fs.list(&current).await? {
            let path = join(&current, &entry.name);
            if entry.is_dir {
                pending.push(path.clone());
            }
            out.push((path, entry.is_dir));
        }
    }
    Ok(out)
}
