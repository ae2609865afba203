//! persist-engine - inspect and exercise persisted application state
//!
//! Opens the configured storage backend and either inspects stored
//! envelopes or runs the application shell state end to end.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use persist_engine::app_state::AppStore;
use persist_engine::config::{AppConfig, StorageBackend};
use persist_engine::paths::AppPaths;
use persist_engine::{Envelope, PersistEngine, SledStorage, StorageAdapter};

/// Inspect and exercise persisted application state.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults to the platform data directory).
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// List stored keys.
    #[arg(long)]
    list_keys: bool,

    /// Print the envelope stored under a key.
    #[arg(long, value_name = "KEY")]
    get: Option<String>,

    /// Store a JSON value under a key (requires --value).
    #[arg(long, value_name = "KEY", requires = "value")]
    set: Option<String>,

    /// JSON payload for --set.
    #[arg(long, value_name = "JSON")]
    value: Option<String>,

    /// Envelope version for --set.
    #[arg(long, default_value_t = 1)]
    version: u32,

    /// Hydrate the app state, flip the sidebar, and persist it.
    #[arg(long)]
    toggle_sidebar: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level)?;

    let paths = AppPaths::detect();
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| paths.config.to_string_lossy().into_owned());
    let config = AppConfig::load_or_default(&config_path).await?;
    info!("Configuration: {} ({:?} storage)", config_path, config.storage.backend);

    if args.list_keys {
        return list_keys(&config, &paths);
    }

    let adapter = config.storage.open(paths.sled_db_path())?;

    if let Some(key) = &args.get {
        match adapter.get(key).await {
            Some(envelope) => println!("{}", serde_json::to_string_pretty(&envelope)?),
            None => println!("(no value stored under '{}')", key),
        }
        return Ok(());
    }

    if let Some(key) = &args.set {
        let raw = args.value.as_deref().unwrap_or("null");
        let data: serde_json::Value =
            serde_json::from_str(raw).with_context(|| format!("Invalid JSON value: {}", raw))?;
        adapter
            .set(key, Envelope::new(data, args.version))
            .await
            .with_context(|| format!("Failed to store '{}'", key))?;
        println!("Stored '{}' (version {})", key, args.version);
        return Ok(());
    }

    if args.toggle_sidebar {
        return toggle_sidebar(adapter, &config).await;
    }

    warn!("Nothing to do; see --help");
    Ok(())
}

fn list_keys(config: &AppConfig, paths: &AppPaths) -> Result<()> {
    if config.storage.backend != StorageBackend::Sled {
        println!("(memory storage holds no keys between runs)");
        return Ok(());
    }

    let path = config
        .storage
        .path
        .clone()
        .unwrap_or_else(|| paths.sled_db_path());
    let storage = SledStorage::open(&path)?;
    for key in storage.keys()? {
        println!("{}", key);
    }
    Ok(())
}

async fn toggle_sidebar(adapter: Arc<dyn StorageAdapter>, config: &AppConfig) -> Result<()> {
    let engine = PersistEngine::new(adapter, config.engine.clone());
    let app = AppStore::new(&engine);

    engine.on_hydration_completed(|| info!("App state hydrated"));
    engine.rehydrate().await;
    engine.hydrated().await;

    let before = app.sidebar_visible();
    app.toggle_sidebar();
    engine.shutdown().await?;

    let stats = engine.write_stats();
    println!(
        "Sidebar visible: {} -> {} ({} write(s), {} failed)",
        before,
        app.sidebar_visible(),
        stats.written,
        stats.failed
    );
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}
