//! Client side of the relay protocol.
//!
//! `WsRemote` implements `RemoteService` over one lazily opened WebSocket.
//! Requests carry an id; a dispatch task routes each `Response` to the
//! waiting caller and forwards `Notify` frames to the daemon. A dropped
//! connection fails every pending request with a network error and the
//! next request reconnects.

use crate::connection::{Connection, ConnectionEvent};
use crate::message::{Call, Frame, Reply};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, connect_async};
use tracing::{debug, info, warn};
use vault_sync_core::sync::{OutgoingChange, PullResponse, PushResult, RemoteError, RemoteService};
use vault_sync_core::{ClientId, EntityKind, NodeId};

/// Timeouts for talking to the relay.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Connect plus `Hello`/`Welcome` exchange
    pub connect_timeout: Duration,
    /// Wait for one response
    pub request_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Another client pushed to a vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub vault_id: String,
    pub table: EntityKind,
    pub head: u64,
}

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<Reply>>>>;

struct Link {
    conn: Connection<MaybeTlsStream<TcpStream>>,
    pending: Pending,
    node: NodeId,
    dispatch: JoinHandle<()>,
}

impl Link {
    fn is_open(&self) -> bool {
        self.conn.is_open() && !self.dispatch.is_finished()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

pub struct WsRemote {
    url: String,
    client: ClientId,
    config: RemoteConfig,
    link: Mutex<Option<Link>>,
    next_id: AtomicU64,
    notices: mpsc::UnboundedSender<Notice>,
}

impl WsRemote {
    /// Remote for the relay at `url`. Notices arrive on the returned channel.
    pub fn new(url: impl Into<String>, client: ClientId) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let remote = Self {
            url: url.into(),
            client,
            config: RemoteConfig::default(),
            link: Mutex::new(None),
            next_id: AtomicU64::new(1),
            notices,
        };
        (remote, rx)
    }

    pub fn with_config(mut self, config: RemoteConfig) -> Self {
        self.config = config;
        self
    }

    /// Node id of the relay, once connected.
    pub async fn node(&self) -> Option<NodeId> {
        self.link.lock().await.as_ref().map(|l| l.node)
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.as_ref().is_some_and(Link::is_open)
    }

    pub async fn disconnect(&self) {
        if let Some(mut link) = self.link.lock().await.take() {
            link.conn.close().await;
        }
    }

    async fn connect(&self) -> Result<Link, RemoteError> {
        let (ws_stream, _) = timeout(self.config.connect_timeout, connect_async(&self.url))
            .await
            .map_err(|_| RemoteError::network(format!("connect to {} timed out", self.url)))?
            .map_err(|e| RemoteError::network(e.to_string()))?;

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let conn = Connection::new("relay".to_string(), ws_stream, event_tx);
        conn.send(&Frame::Hello {
            client: self.client.clone(),
        })
        .await
        .map_err(|e| RemoteError::network(e.to_string()))?;

        let node = timeout(self.config.connect_timeout, async {
            while let Some(event) = event_rx.recv().await {
                match event {
                    ConnectionEvent::Frame {
                        frame: Frame::Welcome { node },
                        ..
                    } => return Ok(node),
                    ConnectionEvent::Frame { frame, .. } => {
                        debug!("Ignoring {:?} before welcome", frame);
                    }
                    ConnectionEvent::Closed { .. } => break,
                }
            }
            Err(RemoteError::network("relay closed during handshake"))
        })
        .await
        .map_err(|_| RemoteError::network("handshake timed out"))??;

        let pending: Pending = Arc::default();
        let dispatch = tokio::spawn(dispatch_loop(event_rx, pending.clone(), self.notices.clone()));
        info!("Connected to relay {} (node {})", self.url, node);

        Ok(Link {
            conn,
            pending,
            node,
            dispatch,
        })
    }

    async fn call(&self, call: Call) -> Result<Reply, RemoteError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut link = self.link.lock().await;
            if !link.as_ref().is_some_and(Link::is_open) {
                *link = Some(self.connect().await?);
            }
            let Some(current) = link.as_ref() else {
                return Err(RemoteError::network("not connected"));
            };
            current
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id, tx);
            let sent = current.conn.send(&Frame::Request { id, call }).await;
            if let Err(e) = sent {
                *link = None;
                return Err(RemoteError::network(e.to_string()));
            }
        }

        match timeout(self.config.request_timeout, rx).await {
            Err(_) => Err(RemoteError::status(408, "request timed out")),
            Ok(Err(_)) => Err(RemoteError::network("connection closed")),
            Ok(Ok(Reply::Failed(e))) => Err(e),
            Ok(Ok(reply)) => Ok(reply),
        }
    }
}

async fn dispatch_loop(
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    pending: Pending,
    notices: mpsc::UnboundedSender<Notice>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Frame {
                frame: Frame::Response { id, reply },
                ..
            } => {
                let waiter = pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => debug!("Response {} has no waiter", id),
                }
            }
            ConnectionEvent::Frame {
                frame: Frame::Notify { vault_id, table, head },
                ..
            } => {
                let _ = notices.send(Notice { vault_id, table, head });
            }
            ConnectionEvent::Frame { frame, .. } => warn!("Unexpected frame from relay: {:?}", frame),
            ConnectionEvent::Closed { .. } => break,
        }
    }
    // Dropping the senders fails every waiting call
    pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    info!("Relay connection closed");
}

#[async_trait]
impl RemoteService for WsRemote {
    async fn pull(&self, vault_id: &str, table: EntityKind, since: u64) -> Result<PullResponse, RemoteError> {
        let call = Call::Pull {
            vault_id: vault_id.to_string(),
            table,
            since,
        };
        match self.call(call).await? {
            Reply::Pulled(response) => Ok(response),
            other => Err(RemoteError::protocol(format!("unexpected reply to pull: {:?}", other))),
        }
    }

    async fn push(
        &self,
        vault_id: &str,
        table: EntityKind,
        changes: Vec<OutgoingChange>,
    ) -> Result<Vec<PushResult>, RemoteError> {
        let call = Call::Push {
            vault_id: vault_id.to_string(),
            table,
            changes,
        };
        match self.call(call).await? {
            Reply::Pushed(results) => Ok(results),
            other => Err(RemoteError::protocol(format!("unexpected reply to push: {:?}", other))),
        }
    }
}
