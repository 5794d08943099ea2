use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};
use fl_core::{clear_ready, init_tracing, load_config, mark_not_live, mark_ready, start_health_server, stdin_closed, Algorithm};

mod federation;

use federation::FederationModule;

#[derive(Parser, Debug)]
#[command(name = "fl-aggregator", about = "Federated learning aggregator: runs the training rounds")]
struct Args {
    /// fedavg or fedprox; defaults to the configured algorithm
    #[arg(long, env = "FL_ALGORITHM")]
    algorithm: Option<Algorithm>,

    /// Started by a command agent: exit when stdin closes
    #[arg(long)]
    supervised: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = load_config("fl-aggregator")?;
    init_tracing("fl-aggregator", cfg.log_file.as_deref())?;
    if let Some(port) = cfg.health_port {
        start_health_server(port).await?;
    }
    let algorithm = args.algorithm.unwrap_or(cfg.default_algorithm);
    info!(target: "fl-aggregator", %algorithm, supervised = args.supervised, "Starting fl-aggregator");

    let mut federation = FederationModule::new(&cfg, algorithm).await?;
    mark_ready();
    let stop_requested = async {
        if args.supervised { stdin_closed().await } else { std::future::pending::<()>().await }
    };
    let outcome = tokio::select! {
        res = federation.run() => res.map(|_| ()),
        _ = stop_requested => { info!("stop_requested_by_supervisor"); Ok(()) }
        _ = tokio::signal::ctrl_c() => { warn!("shutdown_signal_received"); Ok(()) }
    };
    clear_ready();
    if let Err(e) = &outcome {
        mark_not_live();
        error!(error=%e, "aggregator_failed");
    }
    federation.shutdown().await?;
    outcome
}
