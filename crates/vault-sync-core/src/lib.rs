//! vault-sync-core: sync and reconciliation engine for markdown vaults.
//!
//! A vault is a directory of markdown notes mirrored into an embedded
//! database. This crate keeps the two in step and replicates the database
//! with a remote endpoint:
//! - `store` holds entities and publishes committed change batches
//! - `io` and `watcher` read, write and observe the vault directory
//! - `importer` reconciles what is on disk with the database
//! - `sync` pushes local changes and pulls remote ones
//! - `conflicts` parks divergences until the user picks a side

pub mod batch;
pub mod change;
pub mod conflicts;
pub mod encryption;
pub mod entity;
pub mod events;
pub mod fs;
pub mod importer;
pub mod io;
pub mod markdown;
pub mod node_id;
pub mod origin;
pub mod store;
pub mod sync;
pub mod vault;
pub mod watcher;

pub use change::{Change, ChangeBatch, ChangeKind};
pub use entity::{Entity, EntityKind, Mods, Payload};
pub use events::{EventBus, Subscription, SyncEvent};
pub use fs::{FileStat, FileSystem, FsError, InMemoryFs};
pub use node_id::{NodeId, NodeIdError};
pub use origin::{ClientId, WriteOrigin};
pub use vault::{Vault, VaultKind};
