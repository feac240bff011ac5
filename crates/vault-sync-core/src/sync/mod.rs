//! Replication of a vault's tables with a remote endpoint.

pub mod engine;
pub mod outbox;
pub mod remote;
pub mod service;
pub mod supervisor;

pub use engine::{EngineConfig, SyncEngine, SyncError, SyncReport};
pub use outbox::{Outbox, OutboxEntry};
pub use remote::InMemoryRemote;
pub use service::{
    OutgoingChange, PullResponse, PushResult, RemoteChange, RemoteError, RemoteService, SyncableService,
};
pub use supervisor::{
    Action, SingleFlight, SupervisorHandle, SyncState, Supervisor, Trigger, compute_backoff, spawn_supervisor,
};
