use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};
use fl_core::transport::{ControlFabric, NatsFabric};
use fl_core::{init_tracing, load_config, Broadcaster, Command, CommandAgent, ParticipantId};

#[derive(Parser, Debug)]
#[command(name = "fl-agent", about = "Command agent for one federated learning participant")]
struct Cli {
    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Listen on the participant's control channel and supervise its process
    Listen {
        /// "aggregator" or a worker index
        #[arg(long, env = "FL_AGENT_IDENTITY")]
        identity: String,
    },
    /// Publish one command body to an agent
    Send {
        #[arg(long)]
        to: String,
        /// START_FL, STOP_FL, START_SERVER [algorithm] or STOP_SERVER
        #[arg(required = true, num_args = 1..)]
        body: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config("fl-agent")?;
    init_tracing("fl-agent", cfg.log_file.as_deref())?;
    let fabric: Arc<dyn ControlFabric> = Arc::new(NatsFabric::connect(&cfg.nats_host, cfg.nats_port).await?);

    match cli.command {
        Mode::Listen { identity } => {
            let identity = ParticipantId::new(identity);
            let launch = cfg.launch_spec(&identity)?;
            let agent = CommandAgent::connect(identity.clone(), launch, cfg.default_algorithm, fabric, cfg.agent()).await?;
            let flag = agent.shutdown_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("shutdown_signal_received");
                    flag.store(true, Ordering::SeqCst);
                }
            });
            info!(target: "fl-agent", %identity, "Starting fl-agent");
            agent.run().await?;
        }
        Mode::Send { to, body } => {
            let target = ParticipantId::new(to);
            let command = Command::parse(&target, &body.join(" "))?;
            Broadcaster::new(fabric, cfg.agent().broadcast_timeout).send(&command).await?;
            info!(%command, "command_published");
        }
    }
    Ok(())
}
