//! apshare - connection sharing for a headless access point
//!
//! Shares one interface's internet connection onto another over NAT. Changes
//! aimed at the management access point must be confirmed, or they revert on
//! their own so the administrator is never locked out.

mod config;
mod error;
mod health;
mod server;
mod sharing;
mod system;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use config::Config;
use server::Server;
use sharing::{JsonFileStore, ManagerOptions, SharingManager};
use system::{DryRunBackend, LinuxBackend, LinuxInventory, NetworkBackend};

#[derive(Parser)]
#[command(name = "apshare")]
#[command(author, version, about = "Connection sharing with confirm-or-revert")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "APSHARE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to serve the HTTP API on (overrides the config file)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log backend steps instead of changing the system
    #[arg(long)]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    // Check for root privileges
    if !cli.dry_run && !is_root() {
        eprintln!("Error: This program must be run as root (sudo).");
        eprintln!("Usage: sudo apshare [--config <path>]");
        std::process::exit(1);
    }

    let mut config = Config::load(cli.config.as_deref());
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let backend: Arc<dyn NetworkBackend> = if cli.dry_run {
        warn!("Dry run: no changes will be made to the system");
        Arc::new(DryRunBackend::new().with_dns(config.fallback_dns.clone()))
    } else {
        Arc::new(LinuxBackend::new(&config))
    };
    let inventory = Arc::new(LinuxInventory::new(config.access_point_interface.clone()));

    let store = JsonFileStore::open(&config.state_dir).with_context(|| {
        format!("Failed to open state directory {}", config.state_dir.display())
    })?;

    info!(state_dir = %store.dir().display(), "Sharing state loaded");

    let manager = SharingManager::new(
        Box::new(store),
        backend,
        inventory,
        ManagerOptions::from_config(&config),
    )
    .context("Failed to load sharing state")?;

    if manager
        .recover()
        .await
        .context("Failed to recover unconfirmed sharing")?
    {
        info!("Reverted connection sharing left unconfirmed by a previous run");
    }

    Server::new(manager, config.listen).run().await
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}
