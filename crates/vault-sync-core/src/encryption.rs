//! Content encryption gate.
//!
//! The cipher itself lives outside this crate; the sync engine and tables
//! only decide *when* to encrypt or decrypt. Any error aborts the operation
//! that asked for it: plaintext is never pushed in place of ciphertext.

use crate::entity::{Entity, EntityKind};
use crate::vault::Vault;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("No key available for vault {0}")]
    MissingKey(String),

    #[error("Cipher failure: {0}")]
    Cipher(String),
}

pub type Result<T> = std::result::Result<T, EncryptionError>;

#[async_trait]
pub trait Encryption: Send + Sync {
    /// Whether pushes for this vault must carry ciphertext.
    fn should_encrypt(&self, vault: &Vault) -> bool;

    /// Kinds whose `content` is encrypted.
    fn is_encryptable(&self, kind: EntityKind) -> bool {
        matches!(
            kind,
            EntityKind::Document | EntityKind::Task | EntityKind::Event
        )
    }

    /// Produce `encryptedData` for `entity`. `previous` is the last pushed
    /// version, letting implementations reuse ciphertext when content is unchanged.
    async fn encrypt_content(
        &self,
        vault: &Vault,
        entity: &Entity,
        previous: Option<&Entity>,
    ) -> Result<String>;

    /// Restore `content` for every entity that carries `encryptedData`.
    async fn decrypt_data(&self, vault: &Vault, entities: Vec<Entity>) -> Result<Vec<Entity>>;

    /// Mint a per-entity key.
    async fn create_encryption_key(&self) -> Result<String>;
}

/// Pass-through implementation for unencrypted vaults.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEncryption;

#[async_trait]
impl Encryption for NoEncryption {
    fn should_encrypt(&self, _vault: &Vault) -> bool {
        false
    }

    async fn encrypt_content(
        &self,
        _vault: &Vault,
        entity: &Entity,
        _previous: Option<&Entity>,
    ) -> Result<String> {
        Ok(entity.content.clone())
    }

    async fn decrypt_data(&self, _vault: &Vault, entities: Vec<Entity>) -> Result<Vec<Entity>> {
        Ok(entities)
    }

    async fn create_encryption_key(&self) -> Result<String> {
        Ok(uuid::Uuid::new_v4().to_string())
    }
}

/// Whether `entity` should be sent as ciphertext.
pub fn needs_encryption(enc: &dyn Encryption, vault: &Vault, entity: &Entity) -> bool {
    enc.should_encrypt(vault) && entity.encryption_key.is_some() && enc.is_encryptable(entity.kind())
}


#[cfg(test)]
mod tests {
    use super::testing::ReverseEncryption;
    use super::*;
    use crate::vault::VaultKind;

    #[tokio::test]
    async fn test_gate_requires_key() {
        let vault = Vault::new("v", "V", VaultKind::Remote);
        let enc = ReverseEncryption::default();
        let mut doc = Entity::document("v", "d");
        assert!(!needs_encryption(&enc, &vault, &doc));

        doc.encryption_key = Some("k".into());
        assert!(needs_encryption(&enc, &vault, &doc));
        assert!(!needs_encryption(&NoEncryption, &vault, &doc));

        let folder = Entity {
            encryption_key: Some("k".into()),
            ..Entity::folder("v", "f")
        };
        assert!(!needs_encryption(&enc, &vault, &folder));
    }

    #[tokio::test]
    async fn test_roundtrip_through_toy_cipher() {
        let vault = Vault::new("v", "V", VaultKind::Remote);
        let enc = ReverseEncryption::default();
        let doc = Entity::document("v", "d").with_content("secret");

        let mut sealed = doc.clone();
        sealed.encrypted_data = Some(enc.encrypt_content(&vault, &doc, None).await.unwrap());
        sealed.content = String::new();

        let opened = enc.decrypt_data(&vault, vec![sealed]).await.unwrap();
        assert_eq!(opened[0].content, "secret");
        assert!(opened[0].encrypted_data.is_none());
    }
}
