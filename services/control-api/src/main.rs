//! Operator HTTP surface: hosts the command agents and drives a federation run.

mod error;
mod handlers;
mod manager;
mod models;
mod routes;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use fl_core::transport::{ControlFabric, LocalFabric, NatsFabric};
use fl_core::{init_tracing, load_config, ControlTransport};

use manager::AgentManager;

#[derive(Parser, Debug)]
#[command(name = "fl-control-api", about = "Operator API for the federated learning control plane")]
struct Args {
    #[arg(long, default_value = "0.0.0.0", env = "FL_API_HOST")]
    host: String,

    /// Overrides the configured api_port
    #[arg(short, long, env = "FL_API_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = load_config("fl-control-api")?;
    init_tracing("fl-control-api", cfg.log_file.as_deref())?;

    let fabric: Arc<dyn ControlFabric> = match cfg.control_transport {
        ControlTransport::Nats => Arc::new(NatsFabric::connect(&cfg.nats_host, cfg.nats_port).await?),
        ControlTransport::Local => Arc::new(LocalFabric::new()),
    };
    let port = args.port.unwrap_or(cfg.api_port);
    info!(target: "fl-control-api", transport = ?cfg.control_transport, port, "Starting fl-control-api");
    let manager = Arc::new(AgentManager::new(cfg, fabric));
    let app = routes::create_router(manager.clone());

    let addr: SocketAddr = format!("{}:{}", args.host, port).parse().with_context(|| format!("invalid listen address {}:{port}", args.host))?;
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
    info!(%addr, "control_api_listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown_signal_received");
        })
        .await?;

    manager.stop_all().await;
    Ok(())
}
