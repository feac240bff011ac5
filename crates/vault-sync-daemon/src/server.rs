//! WebSocket relay: the remote endpoint vault daemons sync against.
//!
//! Hosts an `InMemoryRemote` change log, answers pull/push requests, and
//! notifies the other connected clients when a push was accepted. The log
//! is snapshotted to disk after every accepted push when a snapshot path is
//! configured.

use crate::connection::{Connection, ConnectionEvent};
use crate::message::{Call, Frame, Reply};
use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use vault_sync_core::ClientId;
use vault_sync_core::sync::{InMemoryRemote, PushResult, RemoteError, RemoteService};

pub struct RelayServer {
    remote: Arc<InMemoryRemote>,
    snapshot: Option<PathBuf>,
    connections: HashMap<String, Connection<TcpStream>>,
    /// conn_id -> client, after `Hello`
    clients: HashMap<String, ClientId>,
    next_conn_id: u64,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl RelayServer {
    pub fn new(remote: Arc<InMemoryRemote>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            remote,
            snapshot: None,
            connections: HashMap::new(),
            clients: HashMap::new(),
            next_conn_id: 1,
            event_tx,
            event_rx,
        }
    }

    /// Persist the change log to `path` after accepted pushes.
    pub fn with_snapshot(mut self, path: PathBuf) -> Self {
        self.snapshot = Some(path);
        self
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Upgrade an accepted TCP stream to a WebSocket connection.
    pub async fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks (like `nc -z`) connect and immediately close without
                // completing the WebSocket handshake. Log these as debug, not error.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before handshake from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        let conn_id = format!("conn-{}", self.next_conn_id);
        self.next_conn_id += 1;
        info!("New connection from {} ({})", addr, conn_id);

        let conn = Connection::new(conn_id.clone(), ws_stream, self.event_tx.clone());
        self.connections.insert(conn_id, conn);
    }

    /// Serve until the listener fails.
    pub async fn run(mut self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    self.accept_connection(stream, addr).await;
                }
                Some(event) = self.event_rx.recv() => self.on_event(event).await,
            }
        }
    }

    async fn on_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Frame { conn_id, frame } => self.on_frame(&conn_id, frame).await,
            ConnectionEvent::Closed { conn_id } => {
                self.connections.remove(&conn_id);
                if let Some(client) = self.clients.remove(&conn_id) {
                    info!("Client {} disconnected ({})", client, conn_id);
                }
            }
        }
    }

    async fn on_frame(&mut self, conn_id: &str, frame: Frame) {
        match frame {
            Frame::Hello { client } => {
                debug!("{} is client {}", conn_id, client);
                self.clients.insert(conn_id.to_string(), client);
                self.send(conn_id, &Frame::Welcome { node: self.remote.node() }).await;
            }
            Frame::Request { id, call } => {
                let reply = match self.clients.get(conn_id) {
                    Some(_) => self.dispatch(conn_id, call).await,
                    None => Reply::Failed(RemoteError::Unauthorized),
                };
                self.send(conn_id, &Frame::Response { id, reply }).await;
            }
            other => warn!("Unexpected frame from {}: {:?}", conn_id, other),
        }
    }

    async fn dispatch(&self, conn_id: &str, call: Call) -> Reply {
        match call {
            Call::Pull { vault_id, table, since } => {
                match self.remote.pull(&vault_id, table, since).await {
                    Ok(response) => Reply::Pulled(response),
                    Err(e) => Reply::Failed(e),
                }
            }
            Call::Push { vault_id, table, changes } => {
                let results = match self.remote.push(&vault_id, table, changes).await {
                    Ok(results) => results,
                    Err(e) => return Reply::Failed(e),
                };
                if results.iter().any(|r| matches!(r, PushResult::Accepted { .. })) {
                    self.save_snapshot();
                    let notice = Frame::Notify {
                        head: self.remote.head(&vault_id),
                        vault_id,
                        table,
                    };
                    self.broadcast_except(&notice, conn_id).await;
                }
                Reply::Pushed(results)
            }
        }
    }

    fn save_snapshot(&self) {
        if let Some(path) = &self.snapshot
            && let Err(e) = self.remote.save(path)
        {
            warn!("Failed to save relay snapshot to {}: {}", path.display(), e);
        }
    }

    async fn send(&self, conn_id: &str, frame: &Frame) {
        if let Some(conn) = self.connections.get(conn_id)
            && let Err(e) = conn.send(frame).await
        {
            warn!("Failed to send to {}: {}", conn_id, e);
        }
    }

    /// Send to every identified client except one.
    async fn broadcast_except(&self, frame: &Frame, exclude: &str) {
        for conn_id in self.clients.keys() {
            if conn_id != exclude {
                self.send(conn_id, frame).await;
            }
        }
    }
}
