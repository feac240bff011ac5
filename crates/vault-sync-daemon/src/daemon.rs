//! One vault served by the daemon.
//!
//! Startup order matters: the change feed and the outbox recorder subscribe
//! to the store before the initial import, so every imported record is
//! both materialised and queued for push.

use crate::native_fs::NativeFs;
use crate::persistence::{Identity, SyncConfig, database_path};
use crate::remote::{RemoteConfig, WsRemote};
use crate::watcher::{VaultWatch, spawn_vault_watcher};
use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use vault_sync_core::importer::{ImportReport, LocalChangeImporter};
use vault_sync_core::io::ChangeRegister;
use vault_sync_core::store::{TableContext, VaultDatabase, VaultStore};
use vault_sync_core::sync::supervisor::SyncOutcome;
use vault_sync_core::sync::{EngineConfig, SupervisorHandle, SyncEngine, Trigger, spawn_supervisor};
use vault_sync_core::{Vault, VaultKind};

/// How to serve a vault. Unset fields fall back to `.sync/config.json`.
#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub vault_path: PathBuf,
    pub vault_id: Option<String>,
    pub name: Option<String>,
    pub remote: Option<String>,
    pub interval: Option<Duration>,
}

pub struct VaultDaemon {
    identity: Identity,
    db: Arc<VaultDatabase<NativeFs>>,
    importer: Arc<LocalChangeImporter<NativeFs>>,
    engine: Option<Arc<SyncEngine<NativeFs>>>,
    supervisor: Option<Arc<SupervisorHandle<NativeFs>>>,
    watch: Option<VaultWatch>,
    tasks: Vec<JoinHandle<()>>,
}

impl VaultDaemon {
    pub async fn start(options: DaemonOptions) -> Result<Self> {
        let vault_path = options.vault_path;
        if !vault_path.is_dir() {
            bail!("Vault directory {} does not exist", vault_path.display());
        }

        let identity = Identity::load_or_create(&vault_path, options.vault_id.as_deref())?;
        let mut config = SyncConfig::load(&vault_path)?;
        if options.remote.is_some() || options.name.is_some() {
            config.remote = options.remote.or(config.remote);
            config.name = options.name.or(config.name);
            config.save(&vault_path)?;
        }
        let interval = options
            .interval
            .unwrap_or(Duration::from_secs(config.interval_secs));

        let kind = match config.remote {
            Some(_) => VaultKind::Remote,
            None => VaultKind::Local,
        };
        let name = config.name.clone().unwrap_or_else(|| {
            vault_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| identity.vault_id.clone())
        });
        let vault = Vault::new(identity.vault_id.clone(), name, kind)
            .with_filepath(vault_path.to_string_lossy().to_string());

        let store = VaultStore::open(database_path(&vault_path), identity.vault_id.clone())
            .context("opening vault database")?;
        let register = ChangeRegister::new();
        let fs = Arc::new(NativeFs::new(vault_path.clone()));
        let ctx = TableContext::new(
            vault,
            Arc::new(store),
            fs,
            register.clone(),
            identity.client_id.clone(),
        );
        let db = Arc::new(VaultDatabase::new(ctx));
        let mut tasks = vec![db.spawn_change_feed()];

        let mut engine = None;
        let mut supervisor = None;
        if let Some(url) = &config.remote {
            let (remote, mut notices) = WsRemote::new(url.clone(), identity.client_id.clone());
            let remote = remote.with_config(RemoteConfig {
                request_timeout: Duration::from_secs(config.request_timeout_secs),
                ..Default::default()
            });
            let engine_config = EngineConfig {
                push_chunk: config.push_chunk.max(1),
                max_retries: config.max_retries,
                ..Default::default()
            };
            let sync = Arc::new(SyncEngine::new(db.clone(), Arc::new(remote)).with_config(engine_config));
            tasks.push(sync.spawn_outbox_recorder());

            let handle = Arc::new(spawn_supervisor(sync.clone(), interval));
            let vault_id = identity.vault_id.clone();
            let notified = handle.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(notice) = notices.recv().await {
                    if notice.vault_id != vault_id {
                        continue;
                    }
                    if let Err(e) = notified.sync_now().await {
                        warn!("Sync after {} notice failed: {}", notice.table, e);
                    }
                }
            }));

            engine = Some(sync);
            supervisor = Some(handle);
        }

        let importer = Arc::new(LocalChangeImporter::new(db.clone()));
        let report = importer.import_changes().await?;
        log_report("Initial import", &report);

        let (watch, mut batches) =
            spawn_vault_watcher(identity.vault_id.clone(), vault_path, register)?;
        let events_importer = importer.clone();
        let events_db = db.clone();
        let events_supervisor = supervisor.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                match events_importer.import_events(batch).await {
                    Ok(report) => log_report("Imported changes", &report),
                    Err(e) => error!("Importing watcher events failed: {}", e),
                }
                if events_db.context().is_deleted() {
                    if let Some(handle) = &events_supervisor {
                        handle.trigger(Trigger::Pause);
                        handle.shutdown();
                    }
                    warn!("Vault {} was removed, sync stopped", events_db.context().vault.id);
                    break;
                }
            }
        }));

        if let Some(handle) = &supervisor {
            handle.trigger(Trigger::VaultActivated);
        }
        info!("Serving vault {} ({:?})", identity.vault_id, kind);

        Ok(Self {
            identity,
            db,
            importer,
            engine,
            supervisor,
            watch: Some(watch),
            tasks,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn database(&self) -> &Arc<VaultDatabase<NativeFs>> {
        &self.db
    }

    pub fn importer(&self) -> &Arc<LocalChangeImporter<NativeFs>> {
        &self.importer
    }

    pub fn engine(&self) -> Option<&Arc<SyncEngine<NativeFs>>> {
        self.engine.as_ref()
    }

    /// Run a sync round now. `None` for local vaults.
    pub async fn sync_now(&self) -> Option<SyncOutcome> {
        match &self.supervisor {
            Some(handle) => Some(handle.sync_now().await),
            None => None,
        }
    }

    /// Whether the background supervisor is still driving sync rounds.
    pub fn is_syncing(&self) -> bool {
        self.supervisor.as_ref().is_some_and(|h| !h.is_stopped())
    }

    pub fn trigger(&self, trigger: Trigger) {
        if let Some(handle) = &self.supervisor {
            handle.trigger(trigger);
        }
    }

    pub fn shutdown(mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.trigger(Trigger::Pause);
            handle.shutdown();
        }
        if let Some(watch) = self.watch.take() {
            watch.stop();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("Stopped vault {}", self.identity.vault_id);
    }
}

fn log_report(what: &str, report: &ImportReport) {
    if report.writes() > 0 || report.conflicts > 0 {
        info!(
            "{}: {} created, {} updated, {} deleted, {} conflict(s)",
            what, report.created, report.updated, report.deleted, report.conflicts
        );
    }
    for e in &report.errors {
        warn!("{}: {}", what, e);
    }
}
