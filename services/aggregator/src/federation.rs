use anyhow::{Context, Result};
use std::time::Duration;
use tracing::info;
use fl_core::transport::{nats_endpoint, NatsLink};
use fl_core::{
    retry_async, AggregatorMessage, Algorithm, CentralEvaluator, Dataset, ExperimentConfig, LogisticRegression, ModelParameters, RetryConfig,
    RoundCoordinator, RunSummary, TrainableModel, WorkerMessage,
};

type Coordinator = RoundCoordinator<NatsLink<AggregatorMessage, WorkerMessage>, CentralEvaluator<LogisticRegression>>;

/// Aggregator process: central test set, data link and the round loop for one algorithm.
pub struct FederationModule {
    coordinator: Coordinator,
    initial: ModelParameters,
    algorithm: Algorithm,
}

impl FederationModule {
    pub async fn new(cfg: &ExperimentConfig, algorithm: Algorithm) -> Result<Self> {
        let test = Dataset::load_csv(&cfg.test_data).with_context(|| format!("loading test set {}", cfg.test_data.display()))?;
        let model = LogisticRegression::new(test.dim(), cfg.sgd());
        let initial = model.get_parameters();

        let endpoint = nats_endpoint(&cfg.nats_host, cfg.nats_port);
        let connect_retry = RetryConfig { max_retries: Some(10), base_delay: Duration::from_millis(500), max_delay: Duration::from_secs(5), jitter: 0.2 };
        let client = retry_async(&connect_retry, |_| async_nats::connect(endpoint.clone()))
            .await
            .with_context(|| format!("connecting to {endpoint}"))?;
        let link = NatsLink::aggregator(client, &cfg.experiment).await?;

        let coordinator = RoundCoordinator::new(cfg.coordinator(algorithm), cfg.store(), link, CentralEvaluator::new(model, test))?;
        info!(%algorithm, %endpoint, rounds = cfg.num_rounds, "federation_module_initialized");
        Ok(Self { coordinator, initial, algorithm })
    }

    pub async fn run(&mut self) -> Result<RunSummary> {
        let summary = self.coordinator.run(self.initial.clone()).await?;
        info!(
            algorithm=%self.algorithm,
            resumed_from = ?summary.resumed_from,
            completed = summary.completed_rounds.len(),
            abandoned = summary.abandoned_rounds.len(),
            "federation_finished"
        );
        Ok(summary)
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!(algorithm=%self.algorithm, joined = self.coordinator.joined_workers(), "federation_module_shutdown");
        Ok(())
    }
}
