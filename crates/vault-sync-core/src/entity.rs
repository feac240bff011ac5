//! Entity model shared by every store.
//!
//! An entity is a base record (`id`, `vaultId`, `filepath`, timestamps,
//! content) plus a kind-specific payload. Entities serialize to one flat
//! camelCase JSON object with a `kind` discriminator, which is also the
//! shape field-level diffs (`Mods`) are expressed against.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Field-level modifications: top-level field name to new value.
/// A `null` value clears an optional field.
pub type Mods = BTreeMap<String, Value>;

/// Fields that only describe local bookkeeping and never justify
/// propagating a change on their own.
pub const LOCAL_ONLY_FIELDS: [&str; 3] = ["updatedAt", "filepath", "clientId"];

/// Fields carried by file timestamps rather than front matter.
pub const TIMESTAMP_FIELDS: [&str; 3] = ["createdAt", "updatedAt", "sequence"];

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    use web_time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Folder,
    Document,
    Task,
    Event,
    Image,
    Integration,
}

impl EntityKind {
    /// All kinds, parents (folders) first.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Folder,
        EntityKind::Document,
        EntityKind::Task,
        EntityKind::Event,
        EntityKind::Image,
        EntityKind::Integration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Folder => "folder",
            EntityKind::Document => "document",
            EntityKind::Task => "task",
            EntityKind::Event => "event",
            EntityKind::Image => "image",
            EntityKind::Integration => "integration",
        }
    }

    /// Name of the database table holding this kind.
    pub fn table_name(self) -> &'static str {
        match self {
            EntityKind::Folder => "folders",
            EntityKind::Document => "documents",
            EntityKind::Task => "tasks",
            EntityKind::Event => "events",
            EntityKind::Image => "images",
            EntityKind::Integration => "integrations",
        }
    }

    pub fn from_table_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.table_name() == name)
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentFields {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Front-matter keys without a dedicated field.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFields {
    pub text: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFields {
    pub summary: String,
    pub start: i64,
    pub end: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFields {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub order: f64,
    #[serde(default)]
    pub is_project: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageFields {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationFields {
    pub provider: String,
    #[serde(default)]
    pub settings: Value,
}

/// Kind-specific part of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Payload {
    Folder(FolderFields),
    Document(DocumentFields),
    Task(TaskFields),
    Event(EventFields),
    Image(ImageFields),
    Integration(IntegrationFields),
}

impl Payload {
    pub fn kind(&self) -> EntityKind {
        match self {
            Payload::Folder(_) => EntityKind::Folder,
            Payload::Document(_) => EntityKind::Document,
            Payload::Task(_) => EntityKind::Task,
            Payload::Event(_) => EntityKind::Event,
            Payload::Image(_) => EntityKind::Image,
            Payload::Integration(_) => EntityKind::Integration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub vault_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,
    #[serde(default)]
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_data: Option<String>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Entity {
    /// New entity with a fresh UUID and both timestamps set to now.
    pub fn new(vault_id: impl Into<String>, payload: Payload) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            vault_id: vault_id.into(),
            filepath: None,
            content: String::new(),
            created_at: now,
            updated_at: now,
            encryption_key: None,
            encrypted_data: None,
            payload,
        }
    }

    pub fn document(vault_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self::new(
            vault_id,
            Payload::Document(DocumentFields {
                title: title.into(),
                ..Default::default()
            }),
        )
    }

    pub fn folder(vault_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(
            vault_id,
            Payload::Folder(FolderFields {
                name: name.into(),
                ..Default::default()
            }),
        )
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.set_parent_id(parent_id);
        self
    }

    pub fn kind(&self) -> EntityKind {
        self.payload.kind()
    }

    /// Human-readable name; documents and events derive their file name from it.
    pub fn display_name(&self) -> &str {
        match &self.payload {
            Payload::Folder(f) => &f.name,
            Payload::Document(d) => &d.title,
            Payload::Task(t) => &t.text,
            Payload::Event(e) => &e.summary,
            Payload::Image(i) => &i.name,
            Payload::Integration(i) => &i.provider,
        }
    }

    pub fn set_display_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        match &mut self.payload {
            Payload::Folder(f) => f.name = name,
            Payload::Document(d) => d.title = name,
            Payload::Task(t) => t.text = name,
            Payload::Event(e) => e.summary = name,
            Payload::Image(i) => i.name = name,
            Payload::Integration(i) => i.provider = name,
        }
    }

    /// Id of the folder this entity lives in, if the kind has one.
    pub fn parent_id(&self) -> Option<&str> {
        match &self.payload {
            Payload::Folder(f) => f.parent_id.as_deref(),
            Payload::Document(d) => d.project_id.as_deref(),
            Payload::Image(i) => i.parent_id.as_deref(),
            _ => None,
        }
    }

    pub fn set_parent_id(&mut self, parent_id: Option<String>) {
        match &mut self.payload {
            Payload::Folder(f) => f.parent_id = parent_id,
            Payload::Document(d) => d.project_id = parent_id,
            Payload::Image(i) => i.parent_id = parent_id,
            _ => {}
        }
    }

    /// Flat JSON object view of the entity.
    pub fn to_fields(&self) -> serde_json::Result<serde_json::Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Ok(serde_json::Map::new()),
        }
    }

    pub fn from_fields(fields: serde_json::Map<String, Value>) -> serde_json::Result<Self> {
        serde_json::from_value(Value::Object(fields))
    }

    /// Copy of this entity with `mods` applied. `null` removes the field.
    pub fn apply_mods(&self, mods: &Mods) -> serde_json::Result<Self> {
        let mut fields = self.to_fields()?;
        for (key, value) in mods {
            // The discriminator is fixed for the lifetime of an entity
            if key == "kind" {
                continue;
            }
            if value.is_null() {
                fields.remove(key);
            } else {
                fields.insert(key.clone(), value.clone());
            }
        }
        Self::from_fields(fields)
    }

    /// Field-level difference turning `old` into `new`.
    pub fn diff(old: &Entity, new: &Entity) -> Mods {
        let (Ok(old_fields), Ok(new_fields)) = (old.to_fields(), new.to_fields()) else {
            return Mods::new();
        };
        let mut mods = Mods::new();
        for (key, value) in &new_fields {
            if old_fields.get(key) != Some(value) {
                mods.insert(key.clone(), value.clone());
            }
        }
        for key in old_fields.keys() {
            if !new_fields.contains_key(key) {
                mods.insert(key.clone(), Value::Null);
            }
        }
        mods
    }
}

/// True when every modified field is local bookkeeping.
pub fn is_bookkeeping_only(mods: &Mods) -> bool {
    mods.keys().all(|k| LOCAL_ONLY_FIELDS.contains(&k.as_str()))
}

/// True when the only modified field is `updatedAt`.
pub fn is_updated_at_only(mods: &Mods) -> bool {
    !mods.is_empty() && mods.keys().all(|k| k == "updatedAt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_flat_serialization() {
        let doc = Entity::document("v1", "Hello")
            .with_id("abc")
            .with_content("body");
        let fields = doc.to_fields().unwrap();

        assert_eq!(fields.get("kind"), Some(&json!("document")));
        assert_eq!(fields.get("id"), Some(&json!("abc")));
        assert_eq!(fields.get("title"), Some(&json!("Hello")));
        assert_eq!(fields.get("vaultId"), Some(&json!("v1")));
        assert!(!fields.contains_key("filepath"));

        let back = Entity::from_fields(fields).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_diff_and_apply_mods() {
        let old = Entity::document("v1", "Old").with_id("a");
        let mut new = old.clone();
        new.set_display_name("New");
        new.filepath = Some("New.md".into());
        new.set_parent_id(Some("folder-1".into()));

        let mods = Entity::diff(&old, &new);
        assert_eq!(mods.get("title"), Some(&json!("New")));
        assert_eq!(mods.get("filepath"), Some(&json!("New.md")));
        assert_eq!(mods.get("projectId"), Some(&json!("folder-1")));
        assert_eq!(mods.len(), 3);

        assert_eq!(old.apply_mods(&mods).unwrap(), new);
    }

    #[test]
    fn test_null_mod_clears_optional_field() {
        let entity = Entity::document("v1", "Doc").with_parent(Some("p".into()));
        let mut mods = Mods::new();
        mods.insert("projectId".into(), Value::Null);

        let cleared = entity.apply_mods(&mods).unwrap();
        assert_eq!(cleared.parent_id(), None);
        assert_eq!(Entity::diff(&entity, &cleared), mods);
    }

    #[test]
    fn test_kind_cannot_be_modified() {
        let entity = Entity::document("v1", "Doc");
        let mut mods = Mods::new();
        mods.insert("kind".into(), json!("folder"));
        assert_eq!(entity.apply_mods(&mods).unwrap().kind(), EntityKind::Document);
    }

    #[test]
    fn test_bookkeeping_predicates() {
        let mut mods = Mods::new();
        mods.insert("updatedAt".into(), json!(5));
        assert!(is_updated_at_only(&mods));
        assert!(is_bookkeeping_only(&mods));

        mods.insert("filepath".into(), json!("a.md"));
        assert!(!is_updated_at_only(&mods));
        assert!(is_bookkeeping_only(&mods));

        mods.insert("content".into(), json!("x"));
        assert!(!is_bookkeeping_only(&mods));
    }

    #[test]
    fn test_table_names() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_table_name(kind.table_name()), Some(kind));
        }
        assert_eq!(EntityKind::from_table_name("_outbox"), None);
    }
}
