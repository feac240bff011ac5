//! Outbound sinks for committed changes: the batched UI feed and the
//! optional search index.

use crate::batch::spawn_batcher;
use crate::entity::{Entity, EntityKind};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;

pub const UI_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
pub const UI_MAX_ITEMS: usize = 200;

/// Receives upserts and deletes for full-text indexing.
pub trait SearchIndex: Send + Sync {
    fn index(&self, kind: EntityKind, upserts: &[Entity], deletes: &[String]);
}

#[derive(Debug, Clone)]
pub enum UiItem {
    Update(Entity),
    Delete { kind: EntityKind, id: String },
}

/// Grouped notification for one table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UiBatch {
    pub kind: Option<EntityKind>,
    pub updates: Vec<Entity>,
    pub deletes: Vec<String>,
}

/// Sender half of the UI feed. Cloning shares the same batcher.
#[derive(Debug, Clone)]
pub struct UiFeed {
    tx: mpsc::UnboundedSender<UiItem>,
}

impl UiFeed {
    /// Start the batcher. Batches close after 100 ms or 200 items.
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<Vec<UiBatch>>) {
        let (tx, mut items) = spawn_batcher::<UiItem>(UI_FLUSH_INTERVAL, UI_MAX_ITEMS);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(batch) = items.recv().await {
                if out_tx.send(group(batch)).is_err() {
                    break;
                }
            }
        });
        (Self { tx }, out_rx)
    }

    pub fn push(&self, item: UiItem) {
        let _ = self.tx.send(item);
    }
}

fn group(items: Vec<UiItem>) -> Vec<UiBatch> {
    let mut by_kind: BTreeMap<EntityKind, UiBatch> = BTreeMap::new();
    for item in items {
        match item {
            UiItem::Update(entity) => {
                let kind = entity.kind();
                let batch = by_kind.entry(kind).or_default();
                batch.kind = Some(kind);
                batch.updates.push(entity);
            }
            UiItem::Delete { kind, id } => {
                let batch = by_kind.entry(kind).or_default();
                batch.kind = Some(kind);
                batch.deletes.push(id);
            }
        }
    }
    by_kind.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_items_grouped_by_kind() {
        let (feed, mut rx) = UiFeed::spawn();
        feed.push(UiItem::Update(Entity::document("v", "a")));
        feed.push(UiItem::Delete {
            kind: EntityKind::Folder,
            id: "f".into(),
        });
        feed.push(UiItem::Update(Entity::document("v", "b")));

        let batches = rx.recv().await.unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].kind, Some(EntityKind::Folder));
        assert_eq!(batches[0].deletes, vec!["f".to_string()]);
        assert_eq!(batches[1].kind, Some(EntityKind::Document));
        assert_eq!(batches[1].updates.len(), 2);
    }
}
