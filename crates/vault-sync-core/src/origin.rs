//! Write origins.
//!
//! Every transactional call carries a `WriteOrigin`. Downstream consumers
//! (disk writer, sync outbox, UI feed) inspect it to decide whether a change
//! is theirs to process, which is what breaks the disk → db → disk and
//! cloud → db → cloud loops.

use crate::node_id::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Identifier of one running client process (UUID v4 string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who performed a write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum WriteOrigin {
    /// A client process (UI, API, conflict resolution) of this vault.
    Client(ClientId),
    /// Read from the vault directory (importer, watcher).
    Device,
    /// Applied from a replication peer.
    Remote(NodeId),
}

impl WriteOrigin {
    pub fn is_device(&self) -> bool {
        matches!(self, WriteOrigin::Device)
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, WriteOrigin::Remote(_))
    }

    /// Client or device writes: the ones this vault must replicate outwards.
    pub fn is_local(&self) -> bool {
        !self.is_remote()
    }

    pub fn is_client(&self, client_id: &ClientId) -> bool {
        matches!(self, WriteOrigin::Client(id) if id == client_id)
    }
}

impl Display for WriteOrigin {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WriteOrigin::Client(id) => write!(f, "client:{}", id),
            WriteOrigin::Device => f.write_str("device"),
            WriteOrigin::Remote(node) => write!(f, "remote:{}", node),
        }
    }
}
