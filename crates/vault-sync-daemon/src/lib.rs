//! vault-sync-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod connection;
pub mod daemon;
pub mod message;
pub mod native_fs;
pub mod persistence;
pub mod remote;
pub mod server;
pub mod watcher;

// Re-export key types for convenience
pub use connection::{Connection, ConnectionEvent};
pub use daemon::{DaemonOptions, VaultDaemon};
pub use message::{Call, Frame, MAX_MESSAGE_SIZE, Reply};
pub use native_fs::NativeFs;
pub use persistence::{Identity, SyncConfig};
pub use remote::{Notice, RemoteConfig, WsRemote};
pub use server::RelayServer;
pub use watcher::{PathTracker, VaultWatch, spawn_vault_watcher};
