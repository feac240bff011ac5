//! Change records emitted by the store's change feed.

use crate::entity::{Entity, EntityKind, Mods, is_bookkeeping_only, is_updated_at_only};
use crate::origin::WriteOrigin;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// One committed record-level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub kind: ChangeKind,
    pub table: EntityKind,
    pub key: String,
    /// New value (create/update).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obj: Option<Entity>,
    /// Previous value (update/delete).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_obj: Option<Entity>,
    /// Fields that differ between `old_obj` and `obj`. Empty for creates and deletes.
    #[serde(default)]
    pub mods: Mods,
    pub origin: WriteOrigin,
}

impl Change {
    pub fn create(entity: Entity, origin: WriteOrigin) -> Self {
        Self {
            kind: ChangeKind::Create,
            table: entity.kind(),
            key: entity.id.clone(),
            obj: Some(entity),
            old_obj: None,
            mods: Mods::new(),
            origin,
        }
    }

    pub fn update(old: Entity, new: Entity, origin: WriteOrigin) -> Self {
        Self {
            kind: ChangeKind::Update,
            table: new.kind(),
            key: new.id.clone(),
            mods: Entity::diff(&old, &new),
            obj: Some(new),
            old_obj: Some(old),
            origin,
        }
    }

    pub fn delete(old: Entity, origin: WriteOrigin) -> Self {
        Self {
            kind: ChangeKind::Delete,
            table: old.kind(),
            key: old.id.clone(),
            obj: None,
            old_obj: Some(old),
            mods: Mods::new(),
            origin,
        }
    }

    /// The entity this change is about: the new value, or the old one for deletes.
    pub fn entity(&self) -> Option<&Entity> {
        self.obj.as_ref().or(self.old_obj.as_ref())
    }

    pub fn is_updated_at_only(&self) -> bool {
        self.kind == ChangeKind::Update && is_updated_at_only(&self.mods)
    }

    /// Update touching only local bookkeeping fields (`updatedAt`, `filepath`, `clientId`).
    pub fn is_bookkeeping_only(&self) -> bool {
        self.kind == ChangeKind::Update && is_bookkeeping_only(&self.mods)
    }

    pub fn moved_filepath(&self) -> bool {
        self.kind == ChangeKind::Update && self.mods.contains_key("filepath")
    }
}

/// Changes committed by one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBatch {
    pub vault_id: String,
    pub origin: WriteOrigin,
    pub changes: Vec<Change>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn for_table(&self, table: EntityKind) -> impl Iterator<Item = &Change> {
        self.changes.iter().filter(move |c| c.table == table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::ClientId;

    #[test]
    fn test_update_computes_mods() {
        let old = Entity::document("v", "A").with_id("1");
        let mut new = old.clone();
        new.updated_at += 10;

        let change = Change::update(old.clone(), new.clone(), WriteOrigin::Device);
        assert!(change.is_updated_at_only());
        assert!(change.is_bookkeeping_only());
        assert!(!change.moved_filepath());

        new.filepath = Some("A.md".into());
        let change = Change::update(old, new, WriteOrigin::Device);
        assert!(!change.is_updated_at_only());
        assert!(change.is_bookkeeping_only());
        assert!(change.moved_filepath());
    }

    #[test]
    fn test_delete_keeps_old_value() {
        let old = Entity::folder("v", "F").with_id("f");
        let change = Change::delete(old, WriteOrigin::Client(ClientId::from("c")));
        assert_eq!(change.table, EntityKind::Folder);
        assert_eq!(change.entity().map(|e| e.id.as_str()), Some("f"));
        assert!(!change.is_bookkeeping_only());
    }
}
