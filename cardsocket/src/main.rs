mod server;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use cardsocket_cluster::{Broker, MemoryBroker, RedisBroker, Relay, RelayOptions};
use cardsocket_core::{bootstrap::load_config, logging, Config};

use server::CardSocketServer;

/// Generate a unique node ID for this server instance
fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    // Random suffix so replicas sharing a hostname stay distinct
    let suffix = nanoid::nanoid!(6);

    format!("{hostname}-{suffix}")
}

fn build_broker(config: &Config) -> Result<Arc<dyn Broker>> {
    if !config.is_clustered() {
        info!("Redis not configured, running in single-node mode");
        return Ok(Arc::new(MemoryBroker::new()));
    }

    let broker = RedisBroker::new(
        &config.redis.url,
        Duration::from_secs(config.redis.connect_timeout_seconds),
    )
    .context("Failed to create Redis broker")?;
    info!(channel = %config.redis.channel, "Redis broker configured");

    Ok(Arc::new(broker))
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration
    let config = load_config().context("Failed to load configuration")?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("cardsocket starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Broker and relay
    let node_id = generate_node_id();
    info!(node_id = %node_id, "Node identity assigned");
    let broker = build_broker(&config)?;
    let relay = Relay::start(broker, RelayOptions::from_config(&config, node_id));

    // 4. Serve until a shutdown signal arrives
    CardSocketServer::new(config, relay).start().await
}
