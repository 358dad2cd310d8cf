// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Sunlink device server.
//!
//! Accepts persistent TCP connections from solar data-loggers, identifies
//! each device by probing it with the registered protocols, then polls
//! telemetry and ships it to TimescaleDB and the platform control plane.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (port 8502, config/ and register_maps/ in cwd)
//! sunlink-server
//!
//! # Custom port and config locations
//! sunlink-server --port 9502 --config-dir /etc/sunlink --register-maps-dir /etc/sunlink/maps
//!
//! # One-shot discovery sweep instead of serving
//! sunlink-server --discover 192.168.1.0/24 --discover-ports 502,8502
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use sunlink::config::Settings;
use sunlink::discovery::ScanOptions;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod app;

use app::DeviceServer;

/// Sunlink device server - data-logger gateway for solar fleet telemetry
#[derive(Parser, Debug)]
#[command(name = "sunlink-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (JSON format); environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address for the data-logger listener
    #[arg(long)]
    host: Option<String>,

    /// Listener port
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding protocols.yaml
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Directory holding register-map JSON files
    #[arg(long)]
    register_maps_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run a one-shot discovery scan over this CIDR network and exit
    #[arg(long)]
    discover: Option<String>,

    /// Ports for the discovery scan, comma-separated
    #[arg(long, default_value = "502,8502")]
    discover_ports: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Settings precedence: file < environment < command line.
    let mut settings = match &args.config {
        Some(path) => {
            info!("Loading settings from {}", path.display());
            Settings::from_file(path)?
        }
        None => Settings::default(),
    };
    settings.apply_env();
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(config_dir) = args.config_dir {
        settings.config_dir = config_dir;
    }
    if let Some(register_maps_dir) = args.register_maps_dir {
        settings.register_maps_dir = register_maps_dir;
    }

    let mut server = DeviceServer::build(settings).await?;

    if let Some(network) = args.discover {
        return run_discovery(&server, &network, &args.discover_ports).await;
    }

    // A signal stops the acceptor; the full ordered shutdown runs once the
    // accept loop has returned.
    let signal_task = {
        let acceptor = Arc::clone(server.acceptor());
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received");
            acceptor.shutdown();
        })
    };

    server.run().await?;
    server.stop().await;
    signal_task.abort();
    info!("Device server exited cleanly");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("Cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run_discovery(server: &DeviceServer, network: &str, ports: &str) -> anyhow::Result<()> {
    let ports: Vec<u16> = ports
        .split(',')
        .filter_map(|p| p.trim().parse().ok())
        .collect();
    anyhow::ensure!(!ports.is_empty(), "no valid discovery ports");

    info!("Running discovery scan on {} (ports {:?})", network, ports);
    let result = server
        .discovery
        .scan_network(
            network,
            ScanOptions {
                ports,
                ..Default::default()
            },
            None,
        )
        .await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
