//! End-to-end tests for vault-sync-daemon.
//!
//! Tests the relay protocol over real WebSockets, the client remote, and
//! two daemons replicating a vault through a relay.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use vault_sync_core::sync::{InMemoryRemote, OutgoingChange, PushResult, RemoteError, RemoteService};
use vault_sync_core::{ChangeKind, ClientId, EntityKind, Mods, NodeId};
use vault_sync_daemon::{Call, DaemonOptions, Frame, RelayServer, Reply, VaultDaemon, WsRemote};

/// Start a relay on an ephemeral port.
async fn start_relay(remote: Arc<InMemoryRemote>, snapshot: Option<&Path>) -> SocketAddr {
    let listener = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut server = RelayServer::new(remote);
    if let Some(path) = snapshot {
        server = server.with_snapshot(path.to_path_buf());
    }
    tokio::spawn(server.run(listener));
    addr
}

/// Raw protocol client.
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let url = format!("ws://{}", addr);
        let (ws, _) = connect_async(&url).await.expect("Failed to connect");
        Self { ws }
    }

    async fn send(&mut self, frame: &Frame) {
        self.ws
            .send(Message::Binary(frame.to_binary().unwrap().into()))
            .await
            .expect("Failed to send frame");
    }

    async fn recv(&mut self) -> Frame {
        let next = async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Binary(data))) => return Frame::from_binary(&data).expect("frame"),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(other)) => panic!("Unexpected message: {:?}", other),
                    Some(Err(e)) => panic!("WebSocket error: {}", e),
                    None => panic!("Stream ended unexpectedly"),
                }
            }
        };
        timeout(Duration::from_secs(5), next).await.expect("Timeout waiting for frame")
    }
}

fn create(key: &str, title: &str) -> OutgoingChange {
    let mut fields = Mods::new();
    fields.insert("title".into(), json!(title));
    OutgoingChange {
        kind: ChangeKind::Create,
        key: key.into(),
        fields,
        base_revision: 0,
        client: ClientId::from("tester"),
    }
}

// ==================== Relay protocol ====================

#[tokio::test]
async fn test_hello_is_welcomed_with_relay_node() {
    let remote = Arc::new(InMemoryRemote::new(NodeId::from(0xabc)));
    let addr = start_relay(remote, None).await;

    let mut client = TestClient::connect(addr).await;
    client
        .send(&Frame::Hello {
            client: ClientId::from("c1"),
        })
        .await;

    assert_eq!(
        client.recv().await,
        Frame::Welcome {
            node: NodeId::from(0xabc)
        }
    );
}

#[tokio::test]
async fn test_request_before_hello_is_unauthorized() {
    let addr = start_relay(Arc::new(InMemoryRemote::new(NodeId::from(1))), None).await;

    let mut client = TestClient::connect(addr).await;
    client
        .send(&Frame::Request {
            id: 1,
            call: Call::Pull {
                vault_id: "v".into(),
                table: EntityKind::Document,
                since: 0,
            },
        })
        .await;

    assert_eq!(
        client.recv().await,
        Frame::Response {
            id: 1,
            reply: Reply::Failed(RemoteError::Unauthorized),
        }
    );
}

// ==================== Client remote ====================

#[tokio::test]
async fn test_ws_remote_push_pull_and_notify() {
    let relay = Arc::new(InMemoryRemote::new(NodeId::from(7)));
    let addr = start_relay(relay.clone(), None).await;
    let url = format!("ws://{}", addr);

    let (a, _a_notices) = WsRemote::new(url.clone(), ClientId::from("a"));
    let (b, mut b_notices) = WsRemote::new(url, ClientId::from("b"));
    // Connect b first so it is around for the notice
    b.pull("v", EntityKind::Document, 0).await.unwrap();

    let results = a.push("v", EntityKind::Document, vec![create("n1", "Hello")]).await.unwrap();
    assert!(matches!(&results[..], [PushResult::Accepted { key, revision: 1 }] if key == "n1"));
    assert_eq!(a.node().await, Some(NodeId::from(7)));

    let notice = timeout(Duration::from_secs(5), b_notices.recv())
        .await
        .expect("Timeout waiting for notice")
        .unwrap();
    assert_eq!(notice.vault_id, "v");
    assert_eq!(notice.head, 1);

    let pulled = b.pull("v", EntityKind::Document, 0).await.unwrap();
    assert_eq!(pulled.head, 1);
    assert_eq!(pulled.changes[0].fields["title"], json!("Hello"));
    assert_eq!(pulled.changes[0].author, Some(ClientId::from("tester")));
}

#[tokio::test]
async fn test_ws_remote_reports_unreachable_relay() {
    // Bind and drop to get a port nothing listens on
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (remote, _notices) = WsRemote::new(format!("ws://{}", addr), ClientId::from("a"));

    let err = remote.pull("v", EntityKind::Document, 0).await.unwrap_err();
    assert!(err.should_disconnect());
    assert!(!remote.is_connected().await);
}

#[tokio::test]
async fn test_relay_snapshot_survives_restart() {
    let dir = TempDir::new().unwrap();
    let snapshot = dir.path().join("relay.json");
    let addr = start_relay(Arc::new(InMemoryRemote::new(NodeId::from(3))), Some(&snapshot)).await;

    let (client, _notices) = WsRemote::new(format!("ws://{}", addr), ClientId::from("a"));
    client.push("v", EntityKind::Document, vec![create("n1", "Kept")]).await.unwrap();

    let restored = InMemoryRemote::load(&snapshot).unwrap();
    assert_eq!(restored.node(), NodeId::from(3));
    assert_eq!(restored.head("v"), 1);
}

// ==================== Daemons ====================

/// Find a markdown file under `dir` whose content contains `needle`.
fn find_note(dir: &Path, needle: &str) -> Option<String> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "md")
            && std::fs::read_to_string(&path).is_ok_and(|c| c.contains(needle))
        {
            return Some(path.file_name()?.to_string_lossy().to_string());
        }
    }
    None
}

fn options(dir: &TempDir, remote: Option<String>) -> DaemonOptions {
    DaemonOptions {
        vault_path: dir.path().to_path_buf(),
        vault_id: Some("shared".into()),
        remote,
        interval: Some(Duration::from_secs(1)),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_note_replicates_between_daemons() {
    let addr = start_relay(Arc::new(InMemoryRemote::new(NodeId::from(9))), None).await;
    let url = format!("ws://{}", addr);

    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    std::fs::write(dir_a.path().join("Groceries.md"), "hello world\n").unwrap();

    let a = VaultDaemon::start(options(&dir_a, Some(url.clone()))).await.unwrap();
    let b = VaultDaemon::start(options(&dir_b, Some(url))).await.unwrap();
    assert_ne!(a.identity().client_id, b.identity().client_id);

    let mut found = None;
    for _ in 0..50 {
        let _ = a.sync_now().await;
        let _ = b.sync_now().await;
        found = find_note(dir_b.path(), "hello world");
        if found.is_some() {
            break;
        }
        sleep(Duration::from_millis(200)).await;
    }
    assert_eq!(found.as_deref(), Some("Groceries.md"));

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_local_vault_imports_watched_files() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("First.md"), "one\n").unwrap();

    let daemon = VaultDaemon::start(options(&dir, None)).await.unwrap();
    let docs = daemon.database().documents();
    assert!(docs.find_by_filepath("First.md").unwrap().is_some());
    assert!(daemon.engine().is_none());
    assert!(daemon.sync_now().await.is_none());

    // Give the watcher time to finish its initial scan
    sleep(Duration::from_millis(500)).await;
    std::fs::write(dir.path().join("Second.md"), "two\n").unwrap();

    let mut imported = false;
    for _ in 0..50 {
        if docs.find_by_filepath("Second.md").unwrap().is_some() {
            imported = true;
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(imported, "watched file was not imported");

    daemon.shutdown();
}

#[tokio::test]
async fn test_removed_vault_is_not_recreated() {
    let addr = start_relay(Arc::new(InMemoryRemote::new(NodeId::from(11))), None).await;
    let url = format!("ws://{}", addr);

    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let a = VaultDaemon::start(options(&dir_a, Some(url.clone()))).await.unwrap();
    let b = VaultDaemon::start(options(&dir_b, Some(url))).await.unwrap();
    assert!(a.is_syncing());

    // Give the watcher time to finish its initial scan
    sleep(Duration::from_millis(500)).await;
    std::fs::remove_dir_all(dir_a.path()).unwrap();

    let mut stopped = false;
    for _ in 0..50 {
        if a.database().context().is_deleted() && !a.is_syncing() {
            stopped = true;
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(stopped, "vault removal was not noticed");

    std::fs::write(dir_b.path().join("Later.md"), "written elsewhere\n").unwrap();
    for _ in 0..20 {
        let _ = b.sync_now().await;
        let _ = a.sync_now().await;
        let docs = a.database().documents().list().unwrap();
        if docs.iter().any(|d| d.content.contains("written elsewhere")) {
            break;
        }
        sleep(Duration::from_millis(200)).await;
    }
    sleep(Duration::from_millis(300)).await;
    assert!(!dir_a.path().exists());

    a.shutdown();
    b.shutdown();
}
