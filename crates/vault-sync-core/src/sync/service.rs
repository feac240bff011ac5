//! Contract between the sync engine and a remote endpoint.

use crate::change::{Change, ChangeKind};
use crate::entity::{Entity, EntityKind, Mods};
use crate::node_id::NodeId;
use crate::origin::ClientId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RemoteError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Remote returned {code}: {message}")]
    Status { code: u16, message: String },

    #[error("Not authorized")]
    Unauthorized,

    #[error("Protocol error: {message}")]
    Protocol { message: String },
}

impl RemoteError {
    pub fn network(message: impl Into<String>) -> Self {
        RemoteError::Network {
            message: message.into(),
        }
    }

    pub fn status(code: u16, message: impl Into<String>) -> Self {
        RemoteError::Status {
            code,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        RemoteError::Protocol {
            message: message.into(),
        }
    }

    /// Resend the same request after a short backoff (timeouts, throttling).
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Status { code: 408 | 429, .. })
    }

    /// The connection is unusable; the supervisor reconnects later.
    pub fn should_disconnect(&self) -> bool {
        matches!(
            self,
            RemoteError::Network { .. } | RemoteError::Status { code: 502..=504, .. }
        )
    }

    /// Something in the batch was rejected; resend its changes one by one.
    pub fn is_batch_issue(&self) -> bool {
        matches!(
            self,
            RemoteError::Status {
                code: 400 | 404 | 413 | 500,
                ..
            }
        )
    }
}

/// One entry of the remote change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub revision: u64,
    pub kind: ChangeKind,
    pub key: String,
    /// Full fields for creates, changed fields for updates.
    #[serde(default)]
    pub fields: Mods,
    /// Client that pushed the change.
    pub author: Option<ClientId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Identity of the remote endpoint; its writes are applied as `Remote(node)`.
    pub node: NodeId,
    /// Latest revision of the vault; the next pull starts here.
    pub head: u64,
    pub changes: Vec<RemoteChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingChange {
    pub kind: ChangeKind,
    pub key: String,
    #[serde(default)]
    pub fields: Mods,
    pub base_revision: u64,
    pub client: ClientId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum PushResult {
    Accepted {
        key: String,
        revision: u64,
    },
    /// Fields changed on the server since the change's base revision.
    /// Carries the server's current fields.
    Conflict {
        key: String,
        fields: Mods,
        revision: u64,
    },
    /// The record was deleted on the server.
    Gone {
        key: String,
    },
}

impl PushResult {
    pub fn key(&self) -> &str {
        match self {
            PushResult::Accepted { key, .. }
            | PushResult::Conflict { key, .. }
            | PushResult::Gone { key } => key,
        }
    }
}

#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Changes of `table` after revision `since`.
    async fn pull(&self, vault_id: &str, table: EntityKind, since: u64) -> Result<PullResponse, RemoteError>;

    /// Push changes; one result per change, in order.
    async fn push(
        &self,
        vault_id: &str,
        table: EntityKind,
        changes: Vec<OutgoingChange>,
    ) -> Result<Vec<PushResult>, RemoteError>;
}

#[async_trait]
impl<T: RemoteService + ?Sized> RemoteService for Arc<T> {
    async fn pull(&self, vault_id: &str, table: EntityKind, since: u64) -> Result<PullResponse, RemoteError> {
        (**self).pull(vault_id, table, since).await
    }

    async fn push(
        &self,
        vault_id: &str,
        table: EntityKind,
        changes: Vec<OutgoingChange>,
    ) -> Result<Vec<PushResult>, RemoteError> {
        (**self).push(vault_id, table, changes).await
    }
}

type ChangeFilter = Arc<dyn Fn(&Change) -> bool + Send + Sync>;
type FetchHook = Arc<dyn Fn(&[Entity]) + Send + Sync>;

/// A table taking part in sync.
#[derive(Clone)]
pub struct SyncableService {
    pub event_name: String,
    pub table: EntityKind,
    filter: ChangeFilter,
    on_remote_fetch: Option<FetchHook>,
}

impl std::fmt::Debug for SyncableService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncableService")
            .field("event_name", &self.event_name)
            .field("table", &self.table)
            .finish()
    }
}

impl SyncableService {
    /// Service with the default filter: changes touching only
    /// `updatedAt`, `filepath` or `clientId` stay local.
    pub fn new(table: EntityKind) -> Self {
        Self {
            event_name: table.table_name().to_string(),
            table,
            filter: Arc::new(|change: &Change| !change.is_bookkeeping_only()),
            on_remote_fetch: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Fn(&Change) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    pub fn with_remote_fetch(mut self, hook: impl Fn(&[Entity]) + Send + Sync + 'static) -> Self {
        self.on_remote_fetch = Some(Arc::new(hook));
        self
    }

    pub fn accepts(&self, change: &Change) -> bool {
        change.table == self.table && (self.filter)(change)
    }

    pub fn remote_fetched(&self, entities: &[Entity]) {
        if let Some(hook) = &self.on_remote_fetch {
            hook(entities);
        }
    }

    /// One service per entity kind, folders first.
    pub fn defaults() -> Vec<Self> {
        EntityKind::ALL.into_iter().map(Self::new).collect()
    }
}
