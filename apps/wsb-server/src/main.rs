use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info, warn};

mod bootstrap;
mod certs;
mod config;
mod crypto;
mod dispatch;
mod engine;
mod filter;
mod logging;
mod pickers;
mod runner;
mod singleflight;
mod site;
mod state;
mod tasks;
mod ws;

use config::Settings;
use engine::ActionCacheEngine;
use site::{HttpSiteClient, SiteClient, StaticSiteClient};
use state::AppState;
use tasks::TaskManager;
use wsb_cache::CommandCache;
use wsb_events::Bus;

#[derive(Parser)]
#[command(name = "wsb-server", about = "Local browser-integration bridge", version)]
struct Cli {
    /// Verbose logging (overridden by WSB_LOG / RUST_LOG).
    #[arg(long, global = true)]
    debug: bool,
    /// Explicit config file; otherwise WSB_CONFIG, then the user config dir.
    #[arg(long, value_name = "PATH")]
    configuration: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Create or remove the loopback TLS certificate and its trust entry.
    Certificates {
        /// Remove the trust-store entry instead of creating the pair.
        #[arg(long)]
        remove: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.debug);

    let mut settings = match Settings::discover(cli.configuration.as_deref()) {
        Some(path) => match Settings::load(&path) {
            Ok(settings) => {
                info!(config = %path.display(), "loaded configuration");
                settings
            }
            Err(err) => {
                error!(%err, config = %path.display(), "could not read configuration");
                std::process::exit(2);
            }
        },
        None => Settings::default(),
    };
    settings.debug |= cli.debug;

    if let Some(Command::Certificates { remove }) = cli.command {
        std::process::exit(run_certificates(&settings, remove));
    }

    if !settings.enabled {
        info!("browser integration is disabled in the configuration; exiting");
        return;
    }

    if let Err(err) = serve(settings).await {
        error!(%err, "startup failed");
        std::process::exit(1);
    }
}

fn run_certificates(settings: &Settings, remove: bool) -> i32 {
    let keys_path = settings.keys_path();
    if remove {
        match certs::unregister(&keys_path) {
            Ok(true) => {
                info!("certificate removed from the trust store");
                0
            }
            Ok(false) => {
                warn!("certificate was not registered");
                0
            }
            Err(err) => {
                error!(%err, "could not unregister the certificate");
                1
            }
        }
    } else {
        if let Err(err) = certs::create(&keys_path) {
            error!(%err, "could not create the key pair");
            return 1;
        }
        match certs::register(&keys_path) {
            Ok(true) => info!(keys_path = %keys_path.display(), "certificate created and trusted"),
            Ok(false) => warn!(
                keys_path = %keys_path.display(),
                "certificate created but the trust store registration failed"
            ),
            Err(err) => {
                error!(%err, "could not register the certificate");
                return 1;
            }
        }
        0
    }
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    let keys_path = settings.keys_path();
    if !certs::exists(&keys_path) {
        info!(keys_path = %keys_path.display(), "no key pair found; creating one");
        certs::create(&keys_path)?;
        if !certs::register(&keys_path).unwrap_or(false) {
            warn!("the new certificate is not trusted yet; run `wsb-server certificates`");
        }
    } else if !certs::is_registered(&keys_path).unwrap_or(false) {
        warn!("the certificate is not in the OS trust store; browsers may refuse to connect");
    }

    let cache_dir = dirs_next::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wsb");
    let store = CommandCache::open(&cache_dir)?;
    let site: Arc<dyn SiteClient> = if settings.site_url.is_empty() {
        warn!("no site_url configured; running against a canned site");
        Arc::new(StaticSiteClient::default())
    } else {
        Arc::new(HttpSiteClient::new(settings.site_url.clone()))
    };
    let engine = Arc::new(ActionCacheEngine::new(
        store,
        site.clone(),
        cache_dir.join("args"),
        json!({ "user_id": settings.user_id }),
    ));
    let bus = Bus::new(256);
    let state = AppState::new(bus, engine, site, Arc::new(settings));

    let mut manager = TaskManager::new();
    manager.push_handle("bus.logger", spawn_bus_logger(state.bus().clone()));

    let endpoint = ws::Endpoint::bind(state.clone()).await?;
    manager.push_handle("ws.accept_loop", tokio::spawn(async move {
        if let Err(err) = endpoint.run().await {
            error!(%err, "accept loop terminated");
        }
    }));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    state.engine().drain_validators().await;
    manager.shutdown_with_grace(Duration::from_secs(3)).await;
    Ok(())
}

/// Mirrors bus notifications into the log so a headless run still surfaces
/// admission and connection events.
fn spawn_bus_logger(bus: Bus) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = bus.subscribe();
        while let Ok(envelope) = rx.recv().await {
            info!(kind = %envelope.kind, payload = %envelope.payload, "bridge event");
        }
    })
}
