//! Vault descriptor.

use serde::{Deserialize, Serialize};

/// Whether the vault replicates to the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VaultKind {
    /// Disk is authoritative; records missing on disk are deleted.
    #[default]
    Local,
    /// Replicated; records missing on disk are parked as local conflicts.
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vault {
    pub id: String,
    pub name: String,
    pub kind: VaultKind,
    /// Absolute root on the host. `None` for vaults with no directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,
}

impl Vault {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: VaultKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            filepath: None,
        }
    }

    pub fn with_filepath(mut self, filepath: impl Into<String>) -> Self {
        self.filepath = Some(filepath.into());
        self
    }

    pub fn is_remote(&self) -> bool {
        self.kind == VaultKind::Remote
    }

    pub fn has_directory(&self) -> bool {
        self.filepath.is_some()
    }
}
