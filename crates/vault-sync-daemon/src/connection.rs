//! A WebSocket carrying relay frames.
//!
//! Each connection wraps a WebSocket stream, handling the split between
//! read and write halves for async operation. Used on both ends: the relay
//! wraps accepted TCP streams, the client wraps its outgoing stream.

use crate::message::{Frame, MAX_MESSAGE_SIZE};
use anyhow::{Result, anyhow};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, warn};

/// Event emitted by a connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Received a frame
    Frame { conn_id: String, frame: Frame },
    /// Connection was closed
    Closed { conn_id: String },
}

type Writer<S> = Arc<Mutex<SplitSink<WebSocketStream<S>, Message>>>;

/// A single WebSocket connection.
pub struct Connection<S> {
    /// Connection ID assigned by whoever opened it (e.g., "conn-1")
    pub conn_id: String,
    write: Writer<S>,
    read_task: Option<JoinHandle<()>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a WebSocket stream.
    ///
    /// Spawns a read task that forwards frames to the event channel.
    pub fn new(
        conn_id: String,
        ws_stream: WebSocketStream<S>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();

        let read_conn_id = conn_id.clone();
        let read_task = tokio::spawn(async move {
            Self::read_loop(read_conn_id, read, event_tx).await;
        });

        Self {
            conn_id,
            write: Arc::new(Mutex::new(write)),
            read_task: Some(read_task),
        }
    }

    async fn read_loop(
        conn_id: String,
        mut read: SplitStream<WebSocketStream<S>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data: Vec<u8> = match msg {
                        Message::Binary(data) => data.into(),
                        Message::Text(text) => text.as_bytes().to_vec(),
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", conn_id);
                            break;
                        }
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Message from {} exceeds max size ({} > {}), dropping",
                            conn_id,
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    match Frame::from_binary(&data) {
                        Some(frame) => {
                            if event_tx
                                .send(ConnectionEvent::Frame {
                                    conn_id: conn_id.clone(),
                                    frame,
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                        None => warn!("Unparseable frame from {} ({} bytes)", conn_id, data.len()),
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", conn_id);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", conn_id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", conn_id);
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { conn_id });
    }

    /// Send a frame as a binary WebSocket message.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let data = frame.to_binary()?;
        let mut write = self.write.lock().await;
        write
            .send(Message::Binary(data.into()))
            .await
            .map_err(|e| anyhow!("Failed to send frame: {}", e))
    }

    pub fn is_open(&self) -> bool {
        self.read_task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        {
            let mut write = self.write.lock().await;
            let _ = write.send(Message::Close(None)).await;
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
