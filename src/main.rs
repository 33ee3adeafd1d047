//! chat-relay server binary.
//!
//! Loads configuration, sets up logging, and serves until Ctrl-C.

use chat_relay::config::Config;
use chat_relay::{MemoryUserStore, Server, ServerError};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        framing = ?config.framing,
        max_connections = config.max_connections,
        overflow = ?config.overflow,
        session_ttl = config.session_ttl,
        "Starting chat-relay server"
    );

    let users = MemoryUserStore::new(config.hash_memory_kib, config.hash_iterations)
        .map_err(|e| ServerError::UserStore(e.to_string()))?;
    let server = Server::bind(config, Arc::new(users)).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
