//! Daemon state kept inside the vault.
//!
//! Everything lives in `.sync/` within the vault directory, which the
//! watcher and importer ignore:
//! - `identity.json`: this client's id and the vault id, fixed on first run
//! - `config.json`: relay address, sync interval, batch size and timeouts
//! - `vault.redb`: the embedded database

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use vault_sync_core::ClientId;
use vault_sync_core::entity::now_millis;

pub const SYNC_DIR: &str = ".sync";
const IDENTITY_FILE: &str = "identity.json";
const CONFIG_FILE: &str = "config.json";
const DATABASE_FILE: &str = "vault.redb";

pub fn sync_dir(vault_path: &Path) -> PathBuf {
    vault_path.join(SYNC_DIR)
}

pub fn database_path(vault_path: &Path) -> PathBuf {
    sync_dir(vault_path).join(DATABASE_FILE)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&contents)?))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    // Ensure directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Who this daemon is, per vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub client_id: ClientId,
    pub vault_id: String,
    pub created_at: i64,
}

impl Identity {
    /// Load the vault's identity, creating it on first run. `vault_id`
    /// is only used when no identity exists yet.
    pub fn load_or_create(vault_path: &Path, vault_id: Option<&str>) -> Result<Self> {
        let path = sync_dir(vault_path).join(IDENTITY_FILE);
        if let Some(identity) = read_json::<Self>(&path)? {
            return Ok(identity);
        }

        let identity = Self {
            client_id: ClientId::generate(),
            vault_id: vault_id
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            created_at: now_millis(),
        };
        write_json(&path, &identity)?;
        info!("Created identity for vault {} (client {})", identity.vault_id, identity.client_id);
        Ok(identity)
    }
}

/// Persisted sync settings. Command-line flags override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Relay WebSocket URL; `None` keeps the vault local.
    pub remote: Option<String>,
    /// Vault display name
    pub name: Option<String>,
    /// Seconds between sync rounds while connected
    pub interval_secs: u64,
    /// Outbox entries per push request
    pub push_chunk: usize,
    /// Resends of a throttled push
    pub max_retries: u32,
    /// Seconds to wait for one relay response
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote: None,
            name: None,
            interval_secs: 30,
            push_chunk: 100,
            max_retries: 5,
            request_timeout_secs: 30,
        }
    }
}

impl SyncConfig {
    /// Load `config.json`, writing the defaults on first run.
    pub fn load(vault_path: &Path) -> Result<Self> {
        let path = sync_dir(vault_path).join(CONFIG_FILE);
        match read_json(&path)? {
            Some(config) => Ok(config),
            None => {
                let config = Self::default();
                write_json(&path, &config)?;
                Ok(config)
            }
        }
    }

    pub fn save(&self, vault_path: &Path) -> Result<()> {
        write_json(&sync_dir(vault_path).join(CONFIG_FILE), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_identity_is_stable_across_restarts() {
        let temp_dir = TempDir::new().unwrap();
        let vault_path = temp_dir.path();

        let first = Identity::load_or_create(vault_path, Some("vault-1")).unwrap();
        assert_eq!(first.vault_id, "vault-1");
        assert!(vault_path.join(".sync/identity.json").exists());

        // The override only applies on first run
        let second = Identity::load_or_create(vault_path, Some("other")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_identity_generates_vault_id() {
        let temp_dir = TempDir::new().unwrap();
        let identity = Identity::load_or_create(temp_dir.path(), None).unwrap();
        assert!(uuid::Uuid::parse_str(&identity.vault_id).is_ok());
    }

    #[test]
    fn test_config_defaults_and_persists() {
        let temp_dir = TempDir::new().unwrap();
        let vault_path = temp_dir.path();

        let config = SyncConfig::load(vault_path).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert!(vault_path.join(".sync/config.json").exists());

        let config = SyncConfig {
            remote: Some("ws://relay:8080".into()),
            ..Default::default()
        };
        config.save(vault_path).unwrap();
        assert_eq!(SyncConfig::load(vault_path).unwrap(), config);

        // Partial files fill in defaults
        fs::write(vault_path.join(".sync/config.json"), r#"{"name": "Notes"}"#).unwrap();
        let loaded = SyncConfig::load(vault_path).unwrap();
        assert_eq!(loaded.name.as_deref(), Some("Notes"));
        assert_eq!(loaded.interval_secs, 30);
    }
}
