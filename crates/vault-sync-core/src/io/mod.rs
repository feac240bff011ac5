//! Vault directory I/O: reading files into records, writing entities back,
//! and the register of writes we expect the watcher to report.

pub mod reader;
pub mod register;
pub mod writer;

pub use reader::{DirEntry, DirListing, EntityReader, FileRecord};
pub use register::ChangeRegister;
pub use writer::EntityWriter;

use crate::fs::{FsError, split_extension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Entity {0} has no filepath")]
    NoFilepath(String),
}

pub type Result<T> = std::result::Result<T, IoError>;

/// Path segments never watched, imported or listed.
pub const BLACKLIST: [&str; 8] = [
    ".DS_Store",
    ".git",
    ".obsidian",
    ".trash",
    ".tasks",
    ".events",
    "My Day",
    ".sync",
];

pub const TRASH_DIR: &str = ".trash";
pub const EVENTS_DIR: &str = ".events";

/// True when any segment of `path` is blacklisted or dot-prefixed.
pub fn is_ignored(path: &str) -> bool {
    path.split('/')
        .filter(|s| !s.is_empty())
        .any(|segment| segment.starts_with('.') || BLACKLIST.contains(&segment))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileType {
    Markdown,
    Attachment,
    Config,
    Unsupported,
}

const ATTACHMENT_EXTENSIONS: [&str; 12] = [
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "mp4", "avi", "mkv", "mov", "mp3", "wav",
];
const CONFIG_EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

impl FileType {
    pub fn from_path(path: &str) -> Self {
        let name = crate::fs::file_name(path);
        let Some(ext) = split_extension(name).1 else {
            return FileType::Unsupported;
        };
        let ext = ext.to_ascii_lowercase();
        if ext == "md" {
            FileType::Markdown
        } else if ATTACHMENT_EXTENSIONS.contains(&ext.as_str()) {
            FileType::Attachment
        } else if CONFIG_EXTENSIONS.contains(&ext.as_str()) {
            FileType::Config
        } else {
            FileType::Unsupported
        }
    }

    pub fn is_supported(self) -> bool {
        self != FileType::Unsupported
    }
}
