//! vault-sync-daemon: Headless vault sync for a home server.
//!
//! `run` keeps one vault directory in step with its database and, when a
//! relay is configured, with every other client of that relay. `serve`
//! runs the relay itself.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vault_sync_core::NodeId;
use vault_sync_core::sync::InMemoryRemote;
use vault_sync_daemon::{DaemonOptions, RelayServer, VaultDaemon};

#[derive(Parser, Debug)]
#[command(name = "vault-sync-daemon")]
#[command(about = "Markdown vault sync daemon")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch a vault directory and sync it
    Run {
        /// Path to the vault directory
        #[arg(short, long)]
        vault: PathBuf,

        /// Relay WebSocket URL (e.g. ws://host:8080); stored in .sync/config.json
        #[arg(short, long)]
        remote: Option<String>,

        /// Vault id to use on first run (generated if not provided)
        #[arg(long)]
        vault_id: Option<String>,

        /// Vault display name
        #[arg(long)]
        name: Option<String>,

        /// Seconds between sync rounds
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Run the relay that vaults sync against
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:8080")]
        listen: String,

        /// Snapshot file for the relay's change log
        #[arg(long)]
        data: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,vault_sync_daemon=debug,vault_sync_core=debug"
    } else {
        "info,vault_sync_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::Run {
            vault,
            remote,
            vault_id,
            name,
            interval,
        } => {
            info!("Starting vault-sync-daemon for {:?}", vault);
            let daemon = VaultDaemon::start(DaemonOptions {
                vault_path: vault,
                vault_id,
                name,
                remote,
                interval: interval.map(Duration::from_secs),
            })
            .await?;

            info!("Daemon running. Press Ctrl+C to stop.");
            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");
            daemon.shutdown();
        }
        Command::Serve { listen, data } => {
            let remote = match &data {
                Some(path) if path.exists() => InMemoryRemote::load(path)?,
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    InMemoryRemote::new(NodeId::generate())
                }
                None => InMemoryRemote::new(NodeId::generate()),
            };
            info!("Relay node {}", remote.node());

            let mut server = RelayServer::new(Arc::new(remote));
            if let Some(path) = data {
                server = server.with_snapshot(path);
            }
            let listener = RelayServer::bind(&listen).await?;

            tokio::select! {
                result = server.run(listener) => result?,
                _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
            }
        }
    }

    info!("Shutting down");
    Ok(())
}
