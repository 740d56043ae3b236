//! Arena - head-to-head quiz battle server
//!
//! Serves battle sessions over TCP until interrupted. The first argument,
//! if given, is the path of the config file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arena_core::{BattleEngine, Config, Database};
use arena_net::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod paths;

/// How often archived sessions past retention are pruned
const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Starting arena server");

    let config_path = match std::env::args_os().nth(1) {
        Some(path) => Ok(PathBuf::from(path)),
        None => paths::default_config_file(),
    };
    let config = match config_path.and_then(|path| Config::load(&path)) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let db = match paths::default_data_dir().and_then(|dir| paths::open_database(&dir)) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(config, db)) {
        tracing::error!("Server failed: {}", e);
        std::process::exit(1);
    }
}

async fn serve(config: Config, db: Database) -> arena_net::Result<()> {
    let engine = Arc::new(BattleEngine::from_config(db, &config));
    let server = Server::start(&config.server, engine.clone()).await?;
    tracing::info!(addr = %server.addr(), "Accepting battles");

    let pruner = tokio::spawn(prune_periodically(engine, config.server.archive_retention()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted, shutting down");
    pruner.abort();
    server.shutdown();
    Ok(())
}

async fn prune_periodically(engine: Arc<BattleEngine>, retention: chrono::Duration) {
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        ticker.tick().await;
        let engine = engine.clone();
        match tokio::task::spawn_blocking(move || engine.prune_archived(retention)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(pruned)) => tracing::info!(pruned, "Pruned archived sessions"),
            Ok(Err(e)) => tracing::warn!("Prune failed: {}", e),
            Err(e) => tracing::warn!("Prune task failed: {}", e),
        }
    }
}
