//! Pull/push replication of one vault against a `RemoteService`.
//!
//! Local changes reach the remote through the outbox: `record_local` queues
//! every local-origin change a syncable service accepts, `push` drains the
//! queue. `pull` applies remote log entries in one transaction with origin
//! `Remote(node)`, which the change feed then materialises on disk. Fields
//! still pending in the outbox are left alone by a pull; the push that
//! follows carries them to the server, rebased when the server reports a
//! conflict.

use super::outbox::{DEVICE_FIELDS, Outbox, OutboxEntry, entry_key};
use super::service::{OutgoingChange, PushResult, RemoteError, RemoteService, SyncableService};
use super::supervisor::compute_backoff_with;
use crate::change::{ChangeBatch, ChangeKind};
use crate::encryption::{EncryptionError, needs_encryption};
use crate::entity::{Entity, EntityKind, Mods};
use crate::events::SyncEvent;
use crate::fs::FileSystem;
use crate::origin::WriteOrigin;
use crate::store::{Bookkeeping, Op, StoreError, TableError, VaultDatabase};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Table error: {0}")]
    Table(#[from] TableError),

    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Invalid record: {0}")]
    Record(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether the supervisor should drop the connection and back off.
    pub fn should_disconnect(&self) -> bool {
        matches!(self, SyncError::Remote(e) if e.should_disconnect() || e.is_retryable())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Outbox entries per push request.
    pub push_chunk: usize,
    /// Pull-rebase-retry rounds after a conflict before the entry is left for the next sync.
    pub max_rebase_attempts: u32,
    /// Resends of a throttled or timed-out push.
    pub max_retries: u32,
    /// Backoff unit for resends.
    pub retry_base: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            push_chunk: 100,
            max_rebase_attempts: 3,
            max_retries: 5,
            retry_base: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Records changed locally by pulls.
    pub pulled: usize,
    /// Outbox entries accepted by the remote.
    pub pushed: usize,
    /// Conflicts reported by the remote (each is rebased and retried).
    pub conflicts: usize,
    /// Entries dropped because the record was deleted remotely.
    pub gone: usize,
    /// Entries left in the outbox for a later sync.
    pub deferred: usize,
}

fn cursor_key(table: EntityKind) -> String {
    format!("cursor/{}", table.table_name())
}

pub struct SyncEngine<F: FileSystem> {
    db: Arc<VaultDatabase<F>>,
    remote: Arc<dyn RemoteService>,
    outbox: Outbox,
    services: Vec<SyncableService>,
    config: EngineConfig,
}

impl<F: FileSystem + 'static> SyncEngine<F> {
    pub fn new(db: Arc<VaultDatabase<F>>, remote: Arc<dyn RemoteService>) -> Self {
        Self {
            outbox: Outbox::new(db.store().clone()),
            db,
            remote,
            services: SyncableService::defaults(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_services(mut self, services: Vec<SyncableService>) -> Self {
        self.services = services;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn database(&self) -> &Arc<VaultDatabase<F>> {
        &self.db
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    fn vault_id(&self) -> &str {
        &self.db.context().vault.id
    }

    // ========== Outbox ==========

    /// Queue the local-origin changes of `batch` that some service accepts.
    pub fn record_local(&self, batch: &ChangeBatch) -> Result<usize> {
        Ok(self
            .outbox
            .record(batch, |change| self.services.iter().any(|s| s.accepts(change)))?)
    }

    /// Record every committed batch until the store side closes.
    pub fn spawn_outbox_recorder(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.db.store().subscribe();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                if let Err(e) = engine.record_local(&batch) {
                    error!("Failed to queue local changes: {}", e);
                }
            }
        })
    }

    // ========== Pull ==========

    pub async fn pull(&self) -> Result<usize> {
        let mut pulled = 0;
        for service in &self.services {
            pulled += self.pull_table(service).await?;
        }
        Ok(pulled)
    }

    /// Apply remote changes of one table since the stored cursor.
    pub async fn pull_table(&self, service: &SyncableService) -> Result<usize> {
        let table = service.table;
        let ctx = self.db.context();
        let store = self.db.store();
        let since: u64 = store.book_get(Bookkeeping::Meta, &cursor_key(table))?.unwrap_or(0);

        let response = self.remote.pull(self.vault_id(), table, since).await?;
        if response.head == since && response.changes.is_empty() {
            return Ok(0);
        }
        store.register_sync_node(response.node)?;

        let mut ops = Vec::new();
        // Latest state per key; `None` is a delete
        let mut view: BTreeMap<String, Option<Entity>> = BTreeMap::new();

        for change in response.changes {
            ops.push(Outbox::revision_op(table, &change.key, change.revision)?);
            if change.author.as_ref() == Some(&ctx.client_id) {
                continue;
            }
            let pending = self.outbox.get(table, &change.key)?;
            let current = match view.get(&change.key) {
                Some(state) => state.clone(),
                None => store.get(table, &change.key)?,
            };

            match change.kind {
                ChangeKind::Delete => {
                    if pending.is_some() {
                        ops.push(Op::book_delete(Bookkeeping::Outbox, entry_key(table, &change.key)));
                    }
                    view.insert(change.key, None);
                }
                ChangeKind::Create | ChangeKind::Update => {
                    if matches!(pending, Some(OutboxEntry { kind: ChangeKind::Delete, .. })) {
                        continue;
                    }
                    let mut fields = change.fields;
                    for field in DEVICE_FIELDS {
                        fields.remove(field);
                    }
                    if let Some(entry) = &pending {
                        fields.retain(|field, _| !entry.fields.contains_key(field));
                    }

                    let next = match current {
                        Some(current) => current.apply_mods(&fields)?,
                        None if change.kind == ChangeKind::Update => {
                            debug!("update for unknown {} {}", table, change.key);
                            continue;
                        }
                        None => {
                            let mut map: serde_json::Map<String, Value> = fields.into_iter().collect();
                            map.insert("id".into(), Value::String(change.key.clone()));
                            map.insert("vaultId".into(), Value::String(self.vault_id().to_string()));
                            match Entity::from_fields(map) {
                                Ok(entity) => entity,
                                Err(e) => {
                                    warn!("Skipping malformed {} {}: {}", table, change.key, e);
                                    continue;
                                }
                            }
                        }
                    };
                    view.insert(change.key, Some(next));
                }
            }
        }

        // Ciphertext never reaches the store
        let sealed: Vec<String> = view
            .iter()
            .filter(|(_, e)| e.as_ref().is_some_and(|e| e.encrypted_data.is_some()))
            .map(|(key, _)| key.clone())
            .collect();
        if !sealed.is_empty() {
            let entities = sealed
                .iter()
                .filter_map(|key| view.get(key).cloned().flatten())
                .collect();
            let opened = ctx.encryption.decrypt_data(&ctx.vault, entities).await?;
            for entity in opened {
                view.insert(entity.id.clone(), Some(entity));
            }
        }

        let mut fetched = Vec::new();
        for (key, state) in view {
            match state {
                Some(entity) => {
                    fetched.push(entity.clone());
                    ops.push(Op::Put(entity));
                }
                None => ops.push(Op::delete(table, key)),
            }
        }
        ops.push(Op::book_put(Bookkeeping::Meta, cursor_key(table), &response.head)?);

        let batch = store.transact(WriteOrigin::Remote(response.node), ops)?;
        let count = batch.changes.len();
        if count > 0 {
            debug!("pulled {} {} change(s) from {}", count, table, response.node);
            ctx.events.emit(SyncEvent::RemoteFetched {
                vault_id: self.vault_id().to_string(),
                table: table.table_name().to_string(),
                count,
            });
            service.remote_fetched(&fetched);
        }
        Ok(count)
    }

    // ========== Push ==========

    pub async fn push(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        for service in &self.services {
            let entries = self.outbox.pending(service.table)?;
            for chunk in entries.chunks(self.config.push_chunk.max(1)) {
                self.push_entries(service, chunk.to_vec(), &mut report).await?;
            }
        }
        Ok(report)
    }

    async fn push_entries(
        &self,
        service: &SyncableService,
        entries: Vec<OutboxEntry>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let table = service.table;
        let mut entries = entries;
        let mut attempt = 0;

        loop {
            let conflicted = match self.send(table, &entries).await {
                Ok(results) => self.settle(table, entries, results, report)?,
                Err(SyncError::Remote(e)) if e.is_batch_issue() && entries.len() > 1 => {
                    warn!("{} batch rejected ({}), resending one by one", table, e);
                    let mut conflicted = Vec::new();
                    for entry in entries {
                        match self.send(table, std::slice::from_ref(&entry)).await {
                            Ok(results) => conflicted.extend(self.settle(table, vec![entry], results, report)?),
                            Err(SyncError::Remote(e)) if e.is_batch_issue() => {
                                warn!("{} {} rejected: {}", table, entry.key, e);
                                report.deferred += 1;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    conflicted
                }
                Err(SyncError::Remote(e)) if e.is_batch_issue() => {
                    warn!("{} {} rejected: {}", table, entries[0].key, e);
                    report.deferred += entries.len();
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            if conflicted.is_empty() {
                return Ok(());
            }
            attempt += 1;
            if attempt > self.config.max_rebase_attempts {
                warn!("{} {} change(s) still conflicting, deferring", conflicted.len(), table);
                report.deferred += conflicted.len();
                return Ok(());
            }

            // Bring in the server's other fields before rebasing
            self.pull_table(service).await?;
            entries = Vec::new();
            for (key, fields, revision) in conflicted {
                if let Some(entry) = self.rebase(table, &key, &fields, revision)? {
                    entries.push(entry);
                }
            }
            if entries.is_empty() {
                return Ok(());
            }
        }
    }

    /// Apply push results. Returns the conflicts as `(key, server fields, revision)`.
    fn settle(
        &self,
        table: EntityKind,
        entries: Vec<OutboxEntry>,
        results: Vec<PushResult>,
        report: &mut SyncReport,
    ) -> Result<Vec<(String, Mods, u64)>> {
        if results.len() != entries.len() {
            return Err(RemoteError::protocol(format!(
                "{} result(s) for {} change(s)",
                results.len(),
                entries.len()
            ))
            .into());
        }
        let mut conflicted = Vec::new();
        for (entry, result) in entries.into_iter().zip(results) {
            match result {
                PushResult::Accepted { revision, .. } => {
                    self.outbox.ack(table, &entry.key, revision)?;
                    report.pushed += 1;
                }
                PushResult::Gone { .. } => {
                    debug!("{} {} is gone remotely", table, entry.key);
                    self.outbox.remove(table, &entry.key)?;
                    report.gone += 1;
                }
                PushResult::Conflict { fields, revision, .. } => {
                    report.conflicts += 1;
                    conflicted.push((entry.key, fields, revision));
                }
            }
        }
        Ok(conflicted)
    }

    /// Drop fields the server already holds and move the base forward.
    fn rebase(&self, table: EntityKind, key: &str, server: &Mods, revision: u64) -> Result<Option<OutboxEntry>> {
        // A pull in between may have removed the entry
        let Some(mut entry) = self.outbox.get(table, key)? else {
            return Ok(None);
        };
        entry.fields.retain(|field, value| server.get(field) != Some(value));
        entry.base_revision = revision;
        if entry.kind == ChangeKind::Update && entry.fields.is_empty() {
            self.outbox.ack(table, key, revision)?;
            return Ok(None);
        }
        self.outbox.replace(&entry)?;
        Ok(Some(entry))
    }

    /// Build the request and send it, resending throttled requests.
    async fn send(&self, table: EntityKind, entries: &[OutboxEntry]) -> Result<Vec<PushResult>> {
        let outgoing = self.prepare(table, entries).await?;
        let mut retry = 0;
        loop {
            match self.remote.push(self.vault_id(), table, outgoing.clone()).await {
                Err(e) if e.is_retryable() && retry < self.config.max_retries => {
                    retry += 1;
                    let delay = compute_backoff_with(retry, rand::random::<f64>(), self.config.retry_base);
                    debug!("push throttled ({}), retry {} in {:?}", e, retry, delay);
                    tokio::time::sleep(delay).await;
                }
                result => return Ok(result?),
            }
        }
    }

    /// Outgoing changes for `entries`. Content is replaced by ciphertext
    /// when the vault requires it; a cipher failure aborts the push.
    async fn prepare(&self, table: EntityKind, entries: &[OutboxEntry]) -> Result<Vec<OutgoingChange>> {
        let ctx = self.db.context();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut fields = entry.fields.clone();
            if entry.kind != ChangeKind::Delete
                && fields.contains_key("content")
                && let Some(entity) = ctx.store.get(table, &entry.key)?
                && needs_encryption(ctx.encryption.as_ref(), &ctx.vault, &entity)
            {
                let sealed = ctx.encryption.encrypt_content(&ctx.vault, &entity, None).await?;
                fields.insert("content".into(), Value::String(String::new()));
                fields.insert("encryptedData".into(), Value::String(sealed));
            }
            out.push(OutgoingChange {
                kind: entry.kind,
                key: entry.key.clone(),
                fields,
                base_revision: entry.base_revision,
                client: ctx.client_id.clone(),
            });
        }
        Ok(out)
    }

    // ========== Round ==========

    /// Pull, then push.
    pub async fn sync_once(&self) -> Result<SyncReport> {
        let pulled = self.pull().await?;
        let mut report = self.push().await?;
        report.pulled = pulled;
        if report != SyncReport::default() {
            info!(
                "Synced {}: {} pulled, {} pushed, {} conflict(s), {} deferred",
                self.db.context().vault.name,
                report.pulled,
                report.pushed,
                report.conflicts,
                report.deferred
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::testing::ReverseEncryption;
    use crate::fs::InMemoryFs;
    use crate::io::ChangeRegister;
    use crate::node_id::NodeId;
    use crate::origin::ClientId;
    use crate::store::{SaveOptions, TableContext, VaultStore};
    use crate::sync::remote::InMemoryRemote;
    use crate::vault::{Vault, VaultKind};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Device {
        fs: Arc<InMemoryFs>,
        db: Arc<VaultDatabase<InMemoryFs>>,
        engine: SyncEngine<InMemoryFs>,
        feed: UnboundedReceiver<Arc<ChangeBatch>>,
    }

    impl Device {
        fn new(client: &str, remote: &Arc<InMemoryRemote>) -> Self {
            Self::with_encryption(client, remote, None)
        }

        fn with_encryption(client: &str, remote: &Arc<InMemoryRemote>, enc: Option<ReverseEncryption>) -> Self {
            let fs = Arc::new(InMemoryFs::new());
            let store = Arc::new(VaultStore::in_memory("v").unwrap());
            let vault = Vault::new("v", "Vault", VaultKind::Remote).with_filepath("/vault");
            let mut ctx = TableContext::new(vault, store, fs.clone(), ChangeRegister::new(), ClientId::from(client));
            if let Some(enc) = enc {
                ctx = ctx.with_encryption(Arc::new(enc));
            }
            let db = Arc::new(VaultDatabase::new(ctx));
            let feed = db.store().subscribe();
            let config = EngineConfig {
                retry_base: Duration::ZERO,
                ..Default::default()
            };
            let engine = SyncEngine::new(db.clone(), remote.clone()).with_config(config);
            Self { fs, db, engine, feed }
        }

        /// Queue and materialise everything committed so far.
        async fn settle(&mut self) {
            while let Ok(batch) = self.feed.try_recv() {
                self.engine.record_local(&batch).unwrap();
                self.db.apply_batch(&batch).await.unwrap();
            }
        }

        async fn sync(&mut self) -> SyncReport {
            self.settle().await;
            let report = self.engine.sync_once().await.unwrap();
            self.settle().await;
            report
        }

        fn doc(&self, id: &str) -> Entity {
            self.db.documents().retrieve(id).unwrap().unwrap()
        }

        async fn retitle(&mut self, id: &str, title: &str) {
            let mut mods = Mods::new();
            mods.insert("title".into(), json!(title));
            self.db
                .documents()
                .modify(id, mods, SaveOptions::default())
                .await
                .unwrap();
            self.settle().await;
        }
    }

    fn remote() -> Arc<InMemoryRemote> {
        Arc::new(InMemoryRemote::new(NodeId::from(0xfeed)))
    }

    #[tokio::test]
    async fn test_document_replicates_to_other_device() {
        let remote = remote();
        let mut a = Device::new("a", &remote);
        let mut b = Device::new("b", &remote);

        a.db.documents()
            .save(Entity::document("v", "Hello").with_id("abc").with_content("hi"), SaveOptions::default())
            .await
            .unwrap();
        assert_eq!(a.sync().await.pushed, 1);

        let report = b.sync().await;
        assert_eq!(report.pulled, 1);
        let text = String::from_utf8(b.fs.read("Hello.md").await.unwrap()).unwrap();
        assert!(text.ends_with("hi"));
        assert_eq!(b.doc("abc").filepath.as_deref(), Some("Hello.md"));
        // Recording the allocated path stays local
        assert!(b.engine.outbox().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_own_changes_are_not_reapplied() {
        let remote = remote();
        let mut a = Device::new("a", &remote);
        a.db.documents()
            .save(Entity::document("v", "Mine").with_id("m"), SaveOptions::default())
            .await
            .unwrap();
        a.sync().await;

        let report = a.sync().await;
        assert_eq!(report.pulled, 0);
        assert_eq!(a.engine.outbox().revision(EntityKind::Document, "m").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_title_edits_resolve_in_server_order() {
        let remote = remote();
        let mut a = Device::new("a", &remote);
        let mut b = Device::new("b", &remote);
        a.db.documents()
            .save(Entity::document("v", "Start").with_id("abc"), SaveOptions::default())
            .await
            .unwrap();
        a.sync().await;
        b.sync().await;

        // A edits offline while B's edit reaches the server first
        a.retitle("abc", "From A").await;
        b.retitle("abc", "From B").await;
        b.sync().await;

        let report = a.sync().await;
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.pushed, 1);
        assert!(a.engine.outbox().is_empty().unwrap());
        assert_eq!(a.doc("abc").display_name(), "From A");

        b.sync().await;
        assert_eq!(b.doc("abc").display_name(), "From A");
        let fields = remote.fields("v", EntityKind::Document, "abc").unwrap();
        assert_eq!(fields["title"], json!("From A"));
        assert_eq!(b.db.documents().list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_delete_beats_pending_update() {
        let remote = remote();
        let mut a = Device::new("a", &remote);
        let mut b = Device::new("b", &remote);
        a.db.documents()
            .save(Entity::document("v", "Doomed").with_id("d"), SaveOptions::default())
            .await
            .unwrap();
        a.sync().await;
        b.sync().await;

        b.db.documents().delete("d", SaveOptions::default()).await.unwrap();
        b.sync().await;
        a.retitle("d", "Edited").await;

        a.sync().await;
        assert!(a.db.documents().retrieve("d").unwrap().is_none());
        assert!(a.engine.outbox().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_batch_issue_resends_singly() {
        let remote = remote();
        let mut a = Device::new("a", &remote);
        for title in ["One", "Two"] {
            a.db.documents()
                .save(Entity::document("v", title), SaveOptions::default())
                .await
                .unwrap();
        }
        a.settle().await;
        a.engine.pull().await.unwrap();
        remote.fail_next(RemoteError::status(413, "too large"));

        let report = a.engine.push().await.unwrap();
        assert_eq!(report.pushed, 2);
        assert_eq!(remote.head("v"), 2);
    }

    #[tokio::test]
    async fn test_conflict_in_split_batch_is_rebased() {
        let remote = remote();
        let mut a = Device::new("a", &remote);
        let mut b = Device::new("b", &remote);
        a.db.documents()
            .save(Entity::document("v", "Start").with_id("abc"), SaveOptions::default())
            .await
            .unwrap();
        a.sync().await;
        b.sync().await;

        b.retitle("abc", "From B").await;
        b.sync().await;
        a.retitle("abc", "From A").await;
        a.db.documents()
            .save(Entity::document("v", "Fresh"), SaveOptions::default())
            .await
            .unwrap();
        a.settle().await;
        a.engine.pull().await.unwrap();
        remote.fail_next(RemoteError::status(413, "too large"));

        let report = a.engine.push().await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.pushed, 2);
        assert_eq!(report.deferred, 0);
        assert!(a.engine.outbox().is_empty().unwrap());
        let fields = remote.fields("v", EntityKind::Document, "abc").unwrap();
        assert_eq!(fields["title"], json!("From A"));
    }

    #[tokio::test]
    async fn test_throttled_push_is_retried() {
        let remote = remote();
        let mut a = Device::new("a", &remote);
        a.db.documents()
            .save(Entity::document("v", "Slow"), SaveOptions::default())
            .await
            .unwrap();
        a.settle().await;
        a.engine.pull().await.unwrap();
        remote.fail_next(RemoteError::status(429, "slow down"));

        let report = a.engine.push().await.unwrap();
        assert_eq!(report.pushed, 1);
    }

    #[tokio::test]
    async fn test_unreachable_remote_keeps_outbox() {
        let remote = remote();
        let mut a = Device::new("a", &remote);
        a.db.documents()
            .save(Entity::document("v", "Offline"), SaveOptions::default())
            .await
            .unwrap();
        a.settle().await;
        remote.fail_next(RemoteError::network("connection refused"));

        let err = a.engine.sync_once().await.unwrap_err();
        assert!(err.should_disconnect());
        assert_eq!(a.engine.outbox().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_encrypted_content_round_trip() {
        let remote = remote();
        let mut a = Device::with_encryption("a", &remote, Some(ReverseEncryption::default()));
        let mut b = Device::with_encryption("b", &remote, Some(ReverseEncryption::default()));

        let mut doc = Entity::document("v", "Secret").with_id("s").with_content("hidden");
        doc.encryption_key = Some("key".into());
        a.db.documents().save(doc, SaveOptions::default()).await.unwrap();
        a.sync().await;

        let fields = remote.fields("v", EntityKind::Document, "s").unwrap();
        assert_eq!(fields["content"], json!(""));
        assert_eq!(fields["encryptedData"], json!("enc:neddih"));

        b.sync().await;
        let pulled = b.doc("s");
        assert_eq!(pulled.content, "hidden");
        assert!(pulled.encrypted_data.is_none());
    }

    #[tokio::test]
    async fn test_encryption_failure_pushes_nothing() {
        let remote = remote();
        let mut a = Device::with_encryption("a", &remote, Some(ReverseEncryption { fail: true }));
        let mut doc = Entity::document("v", "Secret").with_content("hidden");
        doc.encryption_key = Some("key".into());
        a.db.documents().save(doc, SaveOptions::default()).await.unwrap();
        a.settle().await;

        let err = a.engine.sync_once().await.unwrap_err();
        assert!(matches!(err, SyncError::Encryption(_)));
        assert_eq!(remote.head("v"), 0);
        assert_eq!(a.engine.outbox().len().unwrap(), 1);
    }
}
