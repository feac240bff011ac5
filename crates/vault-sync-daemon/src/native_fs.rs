//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use vault_sync_core::fs::{FileEntry, FileStat, FileSystem, FsError, Result};

/// Native filesystem rooted at a vault directory.
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let path = path.trim_matches('/');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

fn map_err(path: &str, e: std::io::Error) -> FsError {
    match e.kind() {
        ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
        ErrorKind::IsADirectory => FsError::IsDirectory(path.to_string()),
        ErrorKind::NotADirectory => FsError::NotDirectory(path.to_string()),
        ErrorKind::DirectoryNotEmpty => FsError::NotEmpty(path.to_string()),
        _ => FsError::Io(e.to_string()),
    }
}

fn millis(time: std::io::Result<SystemTime>) -> u64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn inode(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn inode(_metadata: &std::fs::Metadata) -> u64 {
    0
}

/// Stat of an absolute path, used by the watcher for events outside the
/// `FileSystem` surface.
pub fn stat_path(path: &Path) -> std::io::Result<FileStat> {
    let metadata = std::fs::metadata(path)?;
    Ok(to_stat(&metadata))
}

fn to_stat(metadata: &std::fs::Metadata) -> FileStat {
    let mtime_millis = millis(metadata.modified());
    // Filesystems without birthtime fall back to mtime
    let birthtime_millis = match millis(metadata.created()) {
        0 => mtime_millis,
        b => b,
    };
    FileStat {
        mtime_millis,
        birthtime_millis,
        ino: inode(metadata),
        size: metadata.len(),
        is_dir: metadata.is_dir(),
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        // Create parent directories if needed
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_err(path, e))?;
        }

        fs::write(&full_path, content)
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| map_err(path, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = entry.metadata().await.map_err(|e| map_err(path, e))?;

            entries.push(FileEntry {
                name,
                is_dir: metadata.is_dir(),
            });
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_err(path, e))?;

        let removed = if metadata.is_dir() {
            fs::remove_dir(&full_path).await
        } else {
            fs::remove_file(&full_path).await
        };
        removed.map_err(|e| map_err(path, e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let metadata = fs::metadata(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))?;
        Ok(to_stat(&metadata))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let target = self.full_path(to);
        if fs::try_exists(&target).await.map_err(|e| map_err(to, e))? {
            return Err(FsError::AlreadyExists(to.to_string()));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_err(to, e))?;
        }
        fs::rename(self.full_path(from), target)
            .await
            .map_err(|e| map_err(from, e))
    }

    async fn set_mtime(&self, path: &str, mtime_millis: u64) -> Result<()> {
        let full_path = self.full_path(path);
        let owned = path.to_string();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::options().write(true).open(&full_path)?;
            file.set_modified(UNIX_EPOCH + Duration::from_millis(mtime_millis))
        })
        .await
        .map_err(|e| FsError::Io(e.to_string()))?
        .map_err(|e| map_err(&owned, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_and_list() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        fs.write("notes/a.md", b"hello").await.unwrap();
        assert_eq!(fs.read("notes/a.md").await.unwrap(), b"hello");

        let entries = fs.list("notes").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.md");
        assert!(fs.stat("notes").await.unwrap().is_dir);
    }

    #[tokio::test]
    async fn test_rename_keeps_inode() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        fs.write("a.md", b"x").await.unwrap();
        let before = fs.stat("a.md").await.unwrap();
        fs.rename("a.md", "sub/b.md").await.unwrap();
        let after = fs.stat("sub/b.md").await.unwrap();

        assert!(!fs.exists("a.md").await.unwrap());
        assert_eq!(before.ino, after.ino);

        fs.write("c.md", b"y").await.unwrap();
        assert!(matches!(
            fs.rename("c.md", "sub/b.md").await,
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_set_mtime_and_missing_paths() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        fs.write("a.md", b"x").await.unwrap();
        fs.set_mtime("a.md", 1_600_000_000_000).await.unwrap();
        assert_eq!(fs.stat("a.md").await.unwrap().mtime_millis, 1_600_000_000_000);

        assert!(matches!(fs.read("missing.md").await, Err(FsError::NotFound(_))));
        assert!(!fs.exists("missing.md").await.unwrap());
    }
}
