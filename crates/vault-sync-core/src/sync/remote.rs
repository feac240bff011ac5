//! In-process remote with the server's merge rules.
//!
//! Each vault has a revision counter and an append-only change log. Every
//! record keeps the revision at which each field was last written, so a push
//! can be checked field by field: it is accepted when none of its fields
//! changed on the server after the push's base revision (or they already
//! hold the pushed values). Deletes always win.

use super::service::{OutgoingChange, PullResponse, PushResult, RemoteChange, RemoteError, RemoteService};
use crate::change::ChangeKind;
use crate::entity::{EntityKind, Mods};
use crate::node_id::NodeId;
use crate::origin::ClientId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Record {
    fields: Mods,
    field_revisions: BTreeMap<String, u64>,
    revision: u64,
    deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogEntry {
    table: EntityKind,
    change: RemoteChange,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VaultLog {
    head: u64,
    /// "{table}/{key}" -> record
    records: BTreeMap<String, Record>,
    log: Vec<LogEntry>,
}

impl VaultLog {
    fn append(&mut self, table: EntityKind, kind: ChangeKind, key: &str, fields: Mods, author: &ClientId) -> u64 {
        self.head += 1;
        self.log.push(LogEntry {
            table,
            change: RemoteChange {
                revision: self.head,
                kind,
                key: key.to_string(),
                fields,
                author: Some(author.clone()),
            },
        });
        self.head
    }

    fn apply(&mut self, table: EntityKind, change: OutgoingChange) -> PushResult {
        let record_key = format!("{}/{}", table.table_name(), change.key);
        let key = change.key.clone();
        let existing = self.records.get(&record_key).cloned();

        match (change.kind, existing) {
            (_, Some(record)) if record.deleted => match change.kind {
                ChangeKind::Delete => PushResult::Accepted {
                    key,
                    revision: record.revision,
                },
                _ => PushResult::Gone { key },
            },
            (ChangeKind::Delete, None) => PushResult::Gone { key },
            (ChangeKind::Delete, Some(mut record)) => {
                let revision = self.append(table, ChangeKind::Delete, &key, Mods::new(), &change.client);
                record.deleted = true;
                record.revision = revision;
                self.records.insert(record_key, record);
                PushResult::Accepted { key, revision }
            }
            (ChangeKind::Create, None) => {
                let revision = self.append(
                    table,
                    ChangeKind::Create,
                    &key,
                    change.fields.clone(),
                    &change.client,
                );
                let field_revisions = change.fields.keys().map(|f| (f.clone(), revision)).collect();
                self.records.insert(
                    record_key,
                    Record {
                        fields: change.fields,
                        field_revisions,
                        revision,
                        deleted: false,
                    },
                );
                PushResult::Accepted { key, revision }
            }
            (ChangeKind::Update, None) => PushResult::Gone { key },
            // A create for an existing record merges like an update
            (ChangeKind::Create | ChangeKind::Update, Some(mut record)) => {
                let conflicting = change.fields.iter().any(|(field, value)| {
                    record.field_revisions.get(field).copied().unwrap_or(0) > change.base_revision
                        && record.fields.get(field) != Some(value)
                });
                if conflicting {
                    return PushResult::Conflict {
                        key,
                        fields: record.fields,
                        revision: record.revision,
                    };
                }

                let changed: Mods = change
                    .fields
                    .into_iter()
                    .filter(|(field, value)| record.fields.get(field) != Some(value))
                    .collect();
                if changed.is_empty() {
                    return PushResult::Accepted {
                        key,
                        revision: record.revision,
                    };
                }
                let revision = self.append(table, ChangeKind::Update, &key, changed.clone(), &change.client);
                for (field, value) in changed {
                    record.field_revisions.insert(field.clone(), revision);
                    record.fields.insert(field, value);
                }
                record.revision = revision;
                self.records.insert(record_key, record);
                PushResult::Accepted { key, revision }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    node: NodeId,
    vaults: BTreeMap<String, VaultLog>,
}

pub struct InMemoryRemote {
    node: NodeId,
    vaults: Mutex<BTreeMap<String, VaultLog>>,
    /// Errors returned by the next calls, for exercising retry paths.
    failures: Mutex<VecDeque<RemoteError>>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new(NodeId::generate())
    }
}

impl InMemoryRemote {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            vaults: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, VaultLog>> {
        self.vaults.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next call fail with `error`.
    pub fn fail_next(&self, error: RemoteError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    fn take_failure(&self) -> Option<RemoteError> {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn head(&self, vault_id: &str) -> u64 {
        self.lock().get(vault_id).map_or(0, |v| v.head)
    }

    /// Current server fields of a live record.
    pub fn fields(&self, vault_id: &str, table: EntityKind, key: &str) -> Option<Mods> {
        let vaults = self.lock();
        let record = vaults
            .get(vault_id)?
            .records
            .get(&format!("{}/{}", table.table_name(), key))?;
        (!record.deleted).then(|| record.fields.clone())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let snapshot = Snapshot {
            node: self.node,
            vaults: self.lock().clone(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, json)
    }

    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&json)?;
        info!("Loaded remote snapshot with {} vault(s)", snapshot.vaults.len());
        Ok(Self {
            node: snapshot.node,
            vaults: Mutex::new(snapshot.vaults),
            failures: Mutex::new(VecDeque::new()),
        })
    }
}

#[async_trait]
impl RemoteService for InMemoryRemote {
    async fn pull(&self, vault_id: &str, table: EntityKind, since: u64) -> Result<PullResponse, RemoteError> {
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        let vaults = self.lock();
        let Some(vault) = vaults.get(vault_id) else {
            return Ok(PullResponse {
                node: self.node,
                head: 0,
                changes: Vec::new(),
            });
        };
        let changes = vault
            .log
            .iter()
            .filter(|e| e.table == table && e.change.revision > since)
            .map(|e| e.change.clone())
            .collect();
        Ok(PullResponse {
            node: self.node,
            head: vault.head,
            changes,
        })
    }

    async fn push(
        &self,
        vault_id: &str,
        table: EntityKind,
        changes: Vec<OutgoingChange>,
    ) -> Result<Vec<PushResult>, RemoteError> {
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        let mut vaults = self.lock();
        let vault = vaults.entry(vault_id.to_string()).or_default();
        let results: Vec<PushResult> = changes
            .into_iter()
            .map(|change| vault.apply(table, change))
            .collect();
        debug!("{}: {} push result(s), head {}", vault_id, results.len(), vault.head);
        Ok(results)
    }
}
