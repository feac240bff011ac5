//! Connection lifecycle of a vault's sync session.
//!
//! `Supervisor` is a pure state machine: triggers go in, the action to take
//! comes out. `spawn_supervisor` drives it with a single task that owns the
//! retry timer and the periodic sync tick.

use super::engine::{SyncEngine, SyncError, SyncReport};
use crate::events::SyncEvent;
use crate::fs::FileSystem;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Backoff unit.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(1);

pub const CONNECT_KEY: &str = "connect-sync";
pub const DISCONNECT_KEY: &str = "disconnect-sync";

/// `round((retry mod 7)^e)` units, minus up to a quarter of that as jitter.
/// `jitter` is clamped to `[0, 1]`.
pub fn compute_backoff_with(retry: u32, jitter: f64, unit: Duration) -> Duration {
    let base = f64::from(retry % 7).powf(std::f64::consts::E).round();
    let jitter = jitter.clamp(0.0, 1.0);
    unit.mul_f64(base * (1.0 - jitter / 4.0))
}

pub fn compute_backoff(retry: u32, jitter: f64) -> Duration {
    compute_backoff_with(retry, jitter, DEFAULT_RETRY_TIMEOUT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Stopped,
    Starting,
    Connected,
    /// Waiting to retry after the n-th consecutive failure.
    Backoff(u32),
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Stopped => f.write_str("stopped"),
            SyncState::Starting => f.write_str("starting"),
            SyncState::Connected => f.write_str("connected"),
            SyncState::Backoff(n) => write!(f, "backoff({})", n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    NetworkOnline,
    WebsocketOnline,
    Resume,
    VaultActivated,
    NetworkOffline,
    WebsocketOffline,
    Pause,
    /// The connect attempt finished.
    Connected,
    /// A connect attempt or a sync round failed.
    Failed,
    RetryElapsed,
}

impl Trigger {
    pub fn is_connect(self) -> bool {
        matches!(
            self,
            Trigger::NetworkOnline | Trigger::WebsocketOnline | Trigger::Resume | Trigger::VaultActivated
        )
    }

    pub fn is_disconnect(self) -> bool {
        matches!(
            self,
            Trigger::NetworkOffline | Trigger::WebsocketOffline | Trigger::Pause
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Connect,
    Disconnect,
    RetryIn(Duration),
    Nothing,
}

#[derive(Debug)]
pub struct Supervisor {
    state: SyncState,
    failures: u32,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            state: SyncState::Stopped,
            failures: 0,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Advance on `trigger`. `jitter` in `[0, 1]` feeds the backoff.
    pub fn handle(&mut self, trigger: Trigger, jitter: f64) -> Action {
        use SyncState::*;

        if trigger.is_connect() {
            return match self.state {
                Stopped | Backoff(_) => {
                    self.state = Starting;
                    Action::Connect
                }
                Starting | Connected => Action::Nothing,
            };
        }
        if trigger.is_disconnect() {
            self.failures = 0;
            return match self.state {
                Stopped => Action::Nothing,
                _ => {
                    self.state = Stopped;
                    Action::Disconnect
                }
            };
        }

        match (trigger, self.state) {
            (Trigger::Connected, Starting) => {
                self.failures = 0;
                self.state = Connected;
                Action::Nothing
            }
            (Trigger::Failed, Starting | Connected) => {
                self.failures += 1;
                self.state = Backoff(self.failures);
                Action::RetryIn(compute_backoff(self.failures, jitter))
            }
            (Trigger::RetryElapsed, Backoff(_)) => {
                self.state = Starting;
                Action::Connect
            }
            _ => Action::Nothing,
        }
    }
}

type Flight<T> = Shared<BoxFuture<'static, T>>;

/// Collapses overlapping operations with the same key into one execution.
pub struct SingleFlight<T: Clone> {
    flights: Mutex<HashMap<String, Flight<T>>>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` unless an operation under `key` is in flight, in which
    /// case its result is awaited instead.
    pub async fn run<Fut>(&self, key: &str, make: impl FnOnce() -> Fut) -> T
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let flight = {
            let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
            match flights.get(key) {
                Some(flight) => flight.clone(),
                None => {
                    let flight = make().boxed().shared();
                    flights.insert(key.to_string(), flight.clone());
                    flight
                }
            }
        };
        let out = flight.clone().await;

        let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
        if flights.get(key).is_some_and(|f| f.ptr_eq(&flight)) {
            flights.remove(key);
        }
        out
    }

    pub fn in_flight(&self, key: &str) -> bool {
        self.flights
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }
}

pub type SyncOutcome = Result<SyncReport, Arc<SyncError>>;

/// Handle to a running supervisor task.
pub struct SupervisorHandle<F: FileSystem> {
    triggers: mpsc::UnboundedSender<Trigger>,
    flights: Arc<SingleFlight<SyncOutcome>>,
    engine: Arc<SyncEngine<F>>,
    task: JoinHandle<()>,
}

impl<F: FileSystem + 'static> SupervisorHandle<F> {
    pub fn trigger(&self, trigger: Trigger) {
        let _ = self.triggers.send(trigger);
    }

    /// Sync now; joins a round already in flight.
    pub async fn sync_now(&self) -> SyncOutcome {
        run_round(&self.flights, &self.engine).await
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }
}

async fn run_round<F: FileSystem + 'static>(
    flights: &SingleFlight<SyncOutcome>,
    engine: &Arc<SyncEngine<F>>,
) -> SyncOutcome {
    let engine = Arc::clone(engine);
    flights
        .run(CONNECT_KEY, move || async move { engine.sync_once().await.map_err(Arc::new) })
        .await
}

/// Drive `engine`: connect on connect triggers, sync every `interval`
/// while connected, back off after failures.
pub fn spawn_supervisor<F: FileSystem + 'static>(
    engine: Arc<SyncEngine<F>>,
    interval: Duration,
) -> SupervisorHandle<F> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let flights = Arc::new(SingleFlight::new());
    let task_engine = engine.clone();
    let task_flights = flights.clone();

    let task = tokio::spawn(async move {
        let engine = task_engine;
        let events = engine.database().context().events.clone();
        let vault_id = engine.database().context().vault.id.clone();
        let mut supervisor = Supervisor::new();
        let mut retry_at: Option<Instant> = None;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let trigger = tokio::select! {
                trigger = rx.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    retry_at = None;
                    Trigger::RetryElapsed
                }
                _ = ticker.tick(), if supervisor.state() == SyncState::Connected => {
                    match run_round(&task_flights, &engine).await {
                        Ok(_) => continue,
                        Err(e) if e.should_disconnect() => {
                            warn!("Sync round failed: {}", e);
                            Trigger::Failed
                        }
                        Err(e) => {
                            warn!("Sync round failed: {}", e);
                            continue;
                        }
                    }
                }
            };

            let mut next = Some(trigger);
            while let Some(trigger) = next.take() {
                let before = supervisor.state();
                let action = supervisor.handle(trigger, rand::random::<f64>());
                if supervisor.state() != before {
                    debug!("sync {} -> {} on {:?}", before, supervisor.state(), trigger);
                    events.emit(SyncEvent::SyncStateChanged {
                        vault_id: vault_id.clone(),
                        state: supervisor.state().to_string(),
                    });
                }

                match action {
                    Action::Connect => {
                        next = Some(match run_round(&task_flights, &engine).await {
                            Ok(_) => Trigger::Connected,
                            Err(e) => {
                                warn!("Connecting sync failed: {}", e);
                                Trigger::Failed
                            }
                        });
                    }
                    Action::Disconnect => {
                        retry_at = None;
                        task_flights.run(DISCONNECT_KEY, || async { Ok(SyncReport::default()) }).await.ok();
                        info!("Sync disconnected for {}", vault_id);
                    }
                    Action::RetryIn(delay) => {
                        info!("Retrying sync in {:?}", delay);
                        retry_at = Some(Instant::now() + delay);
                    }
                    Action::Nothing => {}
                }
            }
        }
    });

    SupervisorHandle {
        triggers: tx,
        flights,
        engine,
        task,
    }
}
