use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use guildr::config::Settings;
use guildr::engine::{Engine, Registry};
use guildr::retention;
use guildr::store::{FileStore, LogStore};
use guildr::ws;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "guildr", author, version, about = "Hash-linked guild chat relay")]
struct Cli {
    /// Path to an optional `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Wipe the database directory before starting.
    #[arg(long)]
    clean: bool,
}

/// Wire the store, engine, and maintenance loops, then serve until ctrl-c.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = Settings::from_env(&cli.env)?;
    if cli.clean && cfg.db.exists() {
        std::fs::remove_dir_all(&cfg.db)?;
        info!(db = %cfg.db.display(), "wiped database directory");
    }

    let relay_keys = cfg.relay_keys()?;
    let file_store = FileStore::new(cfg.db.clone());
    file_store.init()?;
    let store: Arc<dyn LogStore> = Arc::new(file_store);
    let engine = Arc::new(
        Engine::new(store, Arc::new(Registry::new()), Some(relay_keys.public_hex()))
            .with_relay_name(cfg.relay_name.clone()),
    );
    retention::spawn(
        engine.clone(),
        relay_keys.clone(),
        cfg.prune_interval,
        cfg.checkpoint_interval,
    );

    let addr: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    info!(%addr, relay = %relay_keys.public_hex(), "relay listening");
    ws::serve_ws(addr, engine, shutdown_signal()).await
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    run(Cli::parse()).await
}
