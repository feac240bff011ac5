//! Relay protocol frames.
//!
//! Every frame is JSON sent as a binary WebSocket frame (UTF-8 bytes).
//! A client opens with `Hello`, the relay answers `Welcome`, and after that
//! the client issues `Request`s that the relay answers with a `Response`
//! carrying the same id. `Notify` is unsolicited: another client pushed to
//! a vault.

use serde::{Deserialize, Serialize};
use vault_sync_core::sync::{OutgoingChange, PullResponse, PushResult, RemoteError};
use vault_sync_core::{ClientId, EntityKind, NodeId};

/// Largest frame accepted from either side (50MB).
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum Call {
    #[serde(rename_all = "camelCase")]
    Pull {
        vault_id: String,
        table: EntityKind,
        since: u64,
    },
    #[serde(rename_all = "camelCase")]
    Push {
        vault_id: String,
        table: EntityKind,
        changes: Vec<OutgoingChange>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "body", rename_all = "camelCase")]
pub enum Reply {
    Pulled(PullResponse),
    Pushed(Vec<PushResult>),
    Failed(RemoteError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    Hello {
        client: ClientId,
    },
    Welcome {
        node: NodeId,
    },
    Request {
        id: u64,
        call: Call,
    },
    Response {
        id: u64,
        reply: Reply,
    },
    #[serde(rename_all = "camelCase")]
    Notify {
        vault_id: String,
        table: EntityKind,
        head: u64,
    },
}

impl Frame {
    /// Serialize to UTF-8 JSON bytes for sending as binary WebSocket frame.
    pub fn to_binary(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Try to parse a frame from binary data.
    ///
    /// Returns None if the data is not valid UTF-8 JSON or not a known frame.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        if data.len() > MAX_MESSAGE_SIZE {
            return None;
        }
        serde_json::from_slice(data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let frame = Frame::Request {
            id: 7,
            call: Call::Pull {
                vault_id: "v".into(),
                table: EntityKind::Document,
                since: 3,
            },
        };
        let value: serde_json::Value = serde_json::from_slice(&frame.to_binary().unwrap()).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["call"]["method"], "pull");
        assert_eq!(value["call"]["vaultId"], "v");
        assert_eq!(value["call"]["since"], 3);
    }

    #[test]
    fn test_failed_reply_parses() {
        let data = json!({
            "type": "response",
            "id": 1,
            "reply": {"outcome": "failed", "body": {"type": "status", "code": 413, "message": "too large"}}
        });
        let frame = Frame::from_binary(data.to_string().as_bytes()).unwrap();
        assert_eq!(
            frame,
            Frame::Response {
                id: 1,
                reply: Reply::Failed(RemoteError::status(413, "too large")),
            }
        );
    }

    #[test]
    fn test_invalid_json_returns_none() {
        assert!(Frame::from_binary(b"not json at all").is_none());
        assert!(Frame::from_binary(br#"{"type": "other"}"#).is_none());
    }
}
