use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use fl_core::transport::{nats_endpoint, NatsLink};
use fl_core::{clear_ready, init_tracing, load_config, mark_not_live, mark_ready, retry_async, start_health_server, stdin_closed, Dataset, LogisticRegression, ParticipantId, RetryConfig, WorkerRuntime};

#[derive(Parser, Debug)]
#[command(name = "fl-worker", about = "Federated learning worker: trains on one partition of the data")]
struct Args {
    /// 1-based worker index; also selects the data partition
    #[arg(long, env = "FL_WORKER_ID")]
    cid: usize,

    #[arg(long, env = "FL_NUM_WORKERS")]
    num_workers: Option<usize>,

    /// Training CSV; defaults to the configured train_data
    #[arg(long)]
    data: Option<PathBuf>,

    /// Test CSV partitioned like the training data, for federated evaluation
    #[arg(long)]
    test_data: Option<PathBuf>,

    /// Started by a command agent: exit when stdin closes
    #[arg(long)]
    supervised: bool,
}

/// Worker share of the test set. A set too small to split is used whole.
fn load_test_partition(path: &Path, workers: usize, index: usize) -> Result<Dataset> {
    match Dataset::load_partition(path, workers, index) {
        Ok(ds) if !ds.is_empty() => Ok(ds),
        Ok(_) | Err(fl_core::FlError::InvalidPartition { .. }) => {
            warn!(path=%path.display(), "test_partition_unavailable_using_full_set");
            Ok(Dataset::load_csv(path)?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Workers share a host with the aggregator, which keeps the base port.
fn worker_health_port(base: u16, cid: usize) -> Option<u16> {
    u16::try_from(cid).ok().and_then(|offset| base.checked_add(offset))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = load_config("fl-worker")?;
    init_tracing("fl-worker", cfg.log_file.as_deref())?;
    let id = ParticipantId::worker(args.cid);
    if let Some(base) = cfg.health_port {
        match worker_health_port(base, args.cid) {
            Some(port) => start_health_server(port).await?,
            None => warn!(worker=%id, base, "health_port_out_of_range_disabled"),
        }
    }
    let workers = args.num_workers.unwrap_or(cfg.num_workers);
    let train_path = args.data.unwrap_or_else(|| cfg.train_data.clone());
    info!(target: "fl-worker", worker=%id, workers, data=%train_path.display(), "Starting fl-worker");

    let train = Dataset::load_partition(&train_path, workers, id.worker_index()?)
        .with_context(|| format!("loading partition {} of {workers} from {}", args.cid, train_path.display()))?;
    let test = args.test_data.as_deref().map(|p| load_test_partition(p, workers, args.cid)).transpose()?;
    let model = LogisticRegression::new(train.dim(), cfg.sgd());

    let endpoint = nats_endpoint(&cfg.nats_host, cfg.nats_port);
    let connect_retry = RetryConfig { max_retries: Some(10), base_delay: Duration::from_millis(500), max_delay: Duration::from_secs(5), jitter: 0.2 };
    let client = retry_async(&connect_retry, |_| async_nats::connect(endpoint.clone()))
        .await
        .with_context(|| format!("connecting to {endpoint}"))?;
    let link = NatsLink::worker(client, &cfg.experiment).await?;
    let mut runtime = WorkerRuntime::new(id.clone(), link, model, train, test);
    mark_ready();

    let stop_requested = async {
        if args.supervised { stdin_closed().await } else { std::future::pending::<()>().await }
    };
    let outcome = tokio::select! {
        res = runtime.run() => res.map_err(anyhow::Error::from),
        _ = stop_requested => { info!(worker=%id, "stop_requested_by_supervisor"); Ok(()) }
        _ = tokio::signal::ctrl_c() => { warn!(worker=%id, "shutdown_signal_received"); Ok(()) }
    };
    clear_ready();
    match &outcome {
        Ok(()) => info!(worker=%id, "worker_stopped"),
        Err(e) => {
            mark_not_live();
            error!(worker=%id, error=%e, "worker_failed");
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_port_offsets_by_worker_index() {
        assert_eq!(worker_health_port(9100, 3), Some(9103));
        assert_eq!(worker_health_port(65530, 6), None);
        assert_eq!(worker_health_port(9100, 65_536 + 3), None);
    }
}
