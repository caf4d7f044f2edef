mod server;

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use tvrelay_core::source::CatalogResolver;
use tvrelay_core::store::{MemoryStateStore, RedisStateStore, StateStore};
use tvrelay_core::{logging, Config};
use tvrelay_livestream::StreamingInfrastructure;

use server::RelayServer;

/// Shared live-stream relay
#[derive(Debug, Parser)]
#[command(name = "tvrelay", version)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "TVRELAY_CONFIG_PATH")]
    config: Option<String>,
}

/// Generate a unique node ID for this server instance
fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    // Add random suffix for uniqueness
    let suffix = nanoid::nanoid!(6);

    format!("{hostname}-{suffix}")
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli
        .config
        .clone()
        .or_else(|| Path::new("config.yaml").exists().then(|| "config.yaml".to_string()));

    let config = match path {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path)?
        }
        None => Config::from_env()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = load_config(&cli)?;

    // 1.5. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("tvrelay starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Shared state store
    let store: Arc<dyn StateStore> = if config.redis_enabled() {
        info!("Using Redis state store at {}", config.redis.url);
        Arc::new(RedisStateStore::connect(&config.redis.url).await?)
    } else {
        info!("Redis not configured, running single-node with in-memory state");
        Arc::new(MemoryStateStore::new())
    };

    // 4. Source catalog and streaming engine
    let resolver = Arc::new(CatalogResolver::from_config(&config));
    info!("Loaded {} channel(s) from configuration", resolver.len());

    let node_id = generate_node_id();
    info!("Node ID: {}", node_id);
    let streaming = Arc::new(StreamingInfrastructure::new(&config, store, resolver, node_id));

    RelayServer::new(config, streaming).start().await
}
