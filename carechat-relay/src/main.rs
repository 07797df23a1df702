//! `carechat-relay`: development WebSocket server for the `carechat` client.
//!
//! ```bash
//! cargo run --bin carechat-relay
//! cargo run --bin carechat-relay -- --bind 127.0.0.1:8080 --open-rooms
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use carechat_relay::config::{RelayCliArgs, RelayConfig};
use carechat_relay::relay::{self, RelayState};
use clap::Parser;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = RelayCliArgs::parse();
    let config = match RelayConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("carechat-relay: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    let state = Arc::new(RelayState::with_policy(config.policy));
    let (addr, server) = match relay::start_server_with_state(&config.bind_addr, state).await {
        Ok(bound) => bound,
        Err(e) => {
            tracing::error!(addr = %config.bind_addr, error = %e, "cannot listen");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        %addr,
        max_content_len = config.policy.max_content_len,
        open_rooms = config.policy.open_rooms,
        "relay listening"
    );

    match server.await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "relay task failed");
            ExitCode::FAILURE
        }
    }
}
