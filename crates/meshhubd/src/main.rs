//! meshhubd - LAN Mesh Hub daemon
//!
//! Bridges IoT devices on the LAN into a single hub: discovery, PSK/mTLS
//! authenticated transport, device registry, automation rules, OTA firmware
//! delivery, groups/scenes, and hub-to-hub federation.

use clap::Parser;
use meshhubd::config::Config;
use meshhubd::hub::Hub;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let default_level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env().add_directive(format!("meshhubd={default_level}").parse().unwrap());
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    info!("meshhubd v{} - LAN Mesh Hub daemon", env!("CARGO_PKG_VERSION"));

    let hub = match Hub::new(config).await {
        Ok(hub) => Arc::new(hub),
        Err(e) => {
            error!("failed to initialize hub: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown_hub = hub.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        shutdown_hub.shutdown();
    });

    if let Err(e) = hub.run().await {
        error!("hub error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
