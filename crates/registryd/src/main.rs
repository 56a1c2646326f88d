//! registryd - gossip-propagated service registry daemon
//!
//! Holds the local view of the service registry and keeps it converged
//! with every other node through gossip and periodic full-state exchange.

use clap::Parser;
use registryd::config::Config;
use registryd::server::Server;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    let level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("registryd={level}").parse().unwrap())
        .add_directive(format!("registry_net={level}").parse().unwrap());

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!(
        "registryd v{} - Gossip Service Registry",
        env!("CARGO_PKG_VERSION")
    );

    let options = match config.options() {
        Ok(options) => options,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Create and run server
    match Server::start(options).await {
        Ok(server) => {
            if let Err(e) = server.run().await {
                error!("Server error: {}", e);
                return ExitCode::FAILURE;
            }
        }
        Err(e) => {
            error!("Failed to start server: {}", e);
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
