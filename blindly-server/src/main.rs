//! Blindly chat server -- development and test backend.
//!
//! An axum WebSocket server that assigns authoritative message ids and
//! fans chat frames out to conversation participants.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:4000
//! cargo run --bin blindly-server
//!
//! # Run on custom address
//! cargo run --bin blindly-server -- --bind 127.0.0.1:8080
//! ```

use std::sync::Arc;

use clap::Parser;

use blindly_server::config::{ServerCliArgs, ServerConfig};
use blindly_server::server::{self, ServerState};

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting blindly chat server");

    let state = Arc::new(ServerState::with_max_history(config.max_history));

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "chat server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "chat server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start chat server");
            std::process::exit(1);
        }
    }
}
