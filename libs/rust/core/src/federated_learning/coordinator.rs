//! Round coordinator: drives fit → aggregate → evaluate → persist over the data link.
//!
//! Rounds run strictly in sequence. Within a round the order in which worker
//! results arrive does not matter; the round closes when every joined worker
//! replied or `round_timeout` elapsed.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::strategy::{aggregate, aggregate_training_metrics, weighted_metric, Algorithm, RoundConfig, StrategySettings, TrainingMetrics, WorkerResult};
use crate::dataset::Dataset;
use crate::error::FlError;
use crate::model::{EvaluationReport, TrainableModel};
use crate::params::{ModelParameters, ParticipantId};
use crate::protocol::{AggregatorMessage, WorkerMessage};
use crate::resilience::RetryConfig;
use crate::store::{Checkpoint, EvaluationRecord, ExperimentStore};
use crate::telemetry::FL_METRICS;
use crate::transport::Link;

/// Held-out evaluation of the global model.
pub trait Evaluator: Send {
    fn evaluate(&mut self, params: &ModelParameters) -> Result<EvaluationReport, FlError>;
}

/// Evaluates on a test set loaded by the aggregator.
pub struct CentralEvaluator<M> {
    model: M,
    data: Dataset,
}

impl<M: TrainableModel> CentralEvaluator<M> {
    pub fn new(model: M, data: Dataset) -> Self { Self { model, data } }
}

impl<M: TrainableModel> Evaluator for CentralEvaluator<M> {
    fn evaluate(&mut self, params: &ModelParameters) -> Result<EvaluationReport, FlError> {
        self.model.set_parameters(params)?;
        self.model.evaluate(&self.data)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub algorithm: Algorithm,
    pub num_rounds: u64,
    pub min_fit_workers: usize,
    pub min_available_workers: usize,
    pub round_timeout: Duration,
    pub federated_evaluation: bool,
    pub strategy: StrategySettings,
    /// Backoff between attempts of a stalled round. `max_retries: None` waits indefinitely.
    pub retry: RetryConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::FedAvg,
            num_rounds: 50,
            min_fit_workers: 3,
            min_available_workers: 3,
            round_timeout: Duration::from_secs(600),
            federated_evaluation: false,
            strategy: StrategySettings::default(),
            retry: RetryConfig { max_retries: None, base_delay: Duration::from_secs(1), max_delay: Duration::from_secs(30), jitter: 0.2 },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub resumed_from: Option<u64>,
    pub completed_rounds: Vec<u64>,
    /// Rounds whose evaluation failed; nothing was persisted for them.
    pub abandoned_rounds: Vec<u64>,
    pub federated_metrics: Vec<(u64, TrainingMetrics)>,
}

pub struct RoundCoordinator<L, E> {
    config: CoordinatorConfig,
    store: ExperimentStore,
    link: L,
    evaluator: E,
    joined: BTreeMap<ParticipantId, u64>,
    global: ModelParameters,
}

impl<L, E> RoundCoordinator<L, E>
where
    L: Link<AggregatorMessage, WorkerMessage>,
    E: Evaluator,
{
    pub fn new(config: CoordinatorConfig, store: ExperimentStore, link: L, evaluator: E) -> Result<Self, FlError> {
        if config.min_fit_workers == 0 {
            return Err(FlError::Config("min_fit_workers must be at least 1".into()));
        }
        if config.min_available_workers < config.min_fit_workers {
            return Err(FlError::Config(format!(
                "min_available_workers ({}) below min_fit_workers ({})",
                config.min_available_workers, config.min_fit_workers
            )));
        }
        Ok(Self { config, store, link, evaluator, joined: BTreeMap::new(), global: ModelParameters::default() })
    }

    pub fn global(&self) -> &ModelParameters { &self.global }
    pub fn joined_workers(&self) -> usize { self.joined.len() }

    /// Run from the latest checkpoint (or a cold start from `initial`) until `num_rounds`.
    pub async fn run(&mut self, initial: ModelParameters) -> Result<RunSummary, FlError> {
        let algorithm = self.config.algorithm;
        let mut summary = RunSummary::default();
        let first_round = match self.store.latest_checkpoint(algorithm) {
            Some(ckpt) if ckpt.parameters.same_layout(&initial) => {
                info!(%algorithm, round = ckpt.round, "resuming_from_checkpoint");
                summary.resumed_from = Some(ckpt.round);
                self.global = ckpt.parameters;
                ckpt.round + 1
            }
            Some(ckpt) => {
                warn!(%algorithm, round = ckpt.round, "checkpoint_layout_mismatch_cold_start");
                self.cold_start(initial)?;
                1
            }
            None => {
                self.cold_start(initial)?;
                1
            }
        };
        if first_round > self.config.num_rounds {
            info!(%algorithm, num_rounds = self.config.num_rounds, "experiment_already_complete");
        }

        self.link.send(&AggregatorMessage::Discover).await?;
        for round in first_round..=self.config.num_rounds {
            let outcome = self.run_round(round).await?;
            if let Some(m) = outcome.federated { summary.federated_metrics.push((round, m)); }
            if outcome.persisted { summary.completed_rounds.push(round) } else { summary.abandoned_rounds.push(round) }
        }
        self.link.send(&AggregatorMessage::Finished).await?;
        info!(%algorithm, completed = summary.completed_rounds.len(), abandoned = summary.abandoned_rounds.len(), "experiment_finished");
        Ok(summary)
    }

    /// Round 0: evaluate fresh parameters, which also starts a new metrics history.
    /// Checkpoints left from an earlier history are dropped with it.
    fn cold_start(&mut self, initial: ModelParameters) -> Result<(), FlError> {
        let algorithm = self.config.algorithm;
        let cleared = self.store.clear_checkpoints(algorithm)?;
        info!(%algorithm, cleared, "cold_start");
        self.global = initial;
        match self.evaluator.evaluate(&self.global) {
            Ok(report) => self.persist(0, report),
            Err(e) => {
                warn!(error=%e, "initial_evaluation_failed");
                Ok(())
            }
        }
    }

    fn persist(&self, round: u64, report: EvaluationReport) -> Result<(), FlError> {
        let algorithm = self.config.algorithm;
        let record = EvaluationRecord {
            round,
            loss: report.loss,
            accuracy: report.accuracy,
            precision: report.precision,
            recall: report.recall,
            f1: report.f1,
            confusion_matrix: report.confusion_matrix,
        };
        self.store.append_or_replace(algorithm, record)?;
        self.store.save_checkpoint(algorithm, &Checkpoint { round, parameters: self.global.clone() })?;
        Ok(())
    }

    async fn run_round(&mut self, round: u64) -> Result<RoundOutcome, FlError> {
        let config = RoundConfig::for_round(self.config.algorithm, &self.config.strategy, round);
        info!(round, learning_rate = config.learning_rate, mu = config.regularization_strength, "round_started");

        let mut attempt = 0;
        let results = loop {
            match self.fit_phase(round, &config).await {
                Ok(r) => break r,
                Err(e @ FlError::InsufficientParticipants { .. }) if !self.config.retry.exhausted(attempt) => {
                    self.config.retry.backoff(attempt, &e.to_string()).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let started = std::time::Instant::now();
        let weighted: Vec<(u64, &ModelParameters)> = results.values().map(|r| (r.sample_count, &r.parameters)).collect();
        let new_global = aggregate(&weighted)?;
        FL_METRICS.aggregation_latency_ms.observe(started.elapsed().as_secs_f64() * 1000.0);
        if let Some(m) = aggregate_training_metrics(&results.values().collect::<Vec<_>>()) {
            info!(round, participants = results.len(), train_loss = m.loss, train_accuracy = m.accuracy, "round_aggregated");
        }
        self.global = new_global;

        let federated = if self.config.federated_evaluation {
            self.federated_evaluation(round, results.keys().cloned().collect()).await?
        } else {
            None
        };

        match self.evaluator.evaluate(&self.global) {
            Ok(report) => {
                self.persist(round, report)?;
                FL_METRICS.rounds_completed_total.inc();
                info!(round, loss = report.loss, accuracy = report.accuracy, f1 = report.f1, "round_completed");
                Ok(RoundOutcome { persisted: true, federated })
            }
            Err(e) => {
                FL_METRICS.rounds_abandoned_total.inc();
                warn!(round, error=%e, "round_evaluation_failed_not_persisted");
                Ok(RoundOutcome { persisted: false, federated })
            }
        }
    }

    /// One attempt: wait for workers, broadcast `Fit`, collect results.
    async fn fit_phase(&mut self, round: u64, config: &RoundConfig) -> Result<BTreeMap<ParticipantId, WorkerResult>, FlError> {
        self.await_workers().await?;
        let expected: BTreeSet<ParticipantId> = self.joined.keys().cloned().collect();
        self.link.send(&AggregatorMessage::Fit { round, config: *config, parameters: self.global.clone() }).await?;

        let deadline = Instant::now() + self.config.round_timeout;
        let mut results: BTreeMap<ParticipantId, WorkerResult> = BTreeMap::new();
        let mut failed: BTreeSet<ParticipantId> = BTreeSet::new();
        while !expected.iter().all(|w| results.contains_key(w) || failed.contains(w)) {
            let Some(msg) = self.recv_until(deadline).await? else { break };
            match msg {
                WorkerMessage::Join { worker, sample_count } => self.on_join(worker, sample_count),
                WorkerMessage::FitResult { worker, round: r, result } if r == round => {
                    if results.contains_key(&worker) {
                        FL_METRICS.results_rejected_total.inc();
                        debug!(round, %worker, "duplicate_result_dropped");
                    } else if let Err(reason) = self.check_result(&result) {
                        FL_METRICS.results_rejected_total.inc();
                        warn!(round, %worker, samples = result.sample_count, %reason, "worker_result_rejected");
                        failed.insert(worker);
                    } else {
                        FL_METRICS.results_accepted_total.inc();
                        debug!(round, %worker, samples = result.sample_count, "worker_result_accepted");
                        self.joined.entry(worker.clone()).or_insert(result.sample_count);
                        results.insert(worker, result);
                    }
                }
                WorkerMessage::FitResult { worker, round: r, .. } => {
                    FL_METRICS.results_rejected_total.inc();
                    debug!(round, result_round = r, %worker, "stale_result_dropped");
                }
                WorkerMessage::Failure { worker, round: r, reason } if r == round => {
                    FL_METRICS.results_rejected_total.inc();
                    warn!(round, %worker, %reason, "worker_reported_failure");
                    failed.insert(worker);
                }
                other => debug!(round, worker=%other.worker(), "message_ignored"),
            }
        }

        for silent in expected.iter().filter(|w| !results.contains_key(*w) && !failed.contains(*w)) {
            warn!(round, worker=%silent, "worker_timed_out_excluded");
            self.joined.remove(silent);
        }
        if results.len() < self.config.min_fit_workers {
            return Err(FlError::InsufficientParticipants { needed: self.config.min_fit_workers, actual: results.len() });
        }
        Ok(results)
    }

    fn check_result(&self, result: &WorkerResult) -> Result<(), FlError> {
        if result.sample_count == 0 {
            return Err(FlError::Model("result reports zero samples".into()));
        }
        result.parameters.validate()?;
        if !result.parameters.same_layout(&self.global) {
            return Err(FlError::ShapeMismatch(format!("{:?} vs {:?}", result.parameters.shapes(), self.global.shapes())));
        }
        Ok(())
    }

    async fn await_workers(&mut self) -> Result<(), FlError> {
        let needed = self.config.min_available_workers;
        if self.joined.len() >= needed { return Ok(()); }
        self.link.send(&AggregatorMessage::Discover).await?;
        let deadline = Instant::now() + self.config.round_timeout;
        while self.joined.len() < needed {
            match self.recv_until(deadline).await? {
                Some(WorkerMessage::Join { worker, sample_count }) => self.on_join(worker, sample_count),
                Some(other) => debug!(worker=%other.worker(), "message_ignored_while_waiting"),
                None => return Err(FlError::InsufficientParticipants { needed, actual: self.joined.len() }),
            }
        }
        Ok(())
    }

    fn on_join(&mut self, worker: ParticipantId, sample_count: u64) {
        if self.joined.insert(worker.clone(), sample_count).is_none() {
            info!(%worker, sample_count, joined = self.joined.len(), "worker_joined");
        }
    }

    async fn federated_evaluation(&mut self, round: u64, participants: BTreeSet<ParticipantId>) -> Result<Option<TrainingMetrics>, FlError> {
        self.link.send(&AggregatorMessage::Evaluate { round, parameters: self.global.clone() }).await?;
        let deadline = Instant::now() + self.config.round_timeout;
        let mut reports: BTreeMap<ParticipantId, (u64, f64, f64)> = BTreeMap::new();
        let mut failed = BTreeSet::new();
        while !participants.iter().all(|w| reports.contains_key(w) || failed.contains(w)) {
            let Some(msg) = self.recv_until(deadline).await? else { break };
            match msg {
                WorkerMessage::EvaluateResult { worker, round: r, loss, accuracy, sample_count } if r == round => {
                    reports.entry(worker).or_insert((sample_count, loss, accuracy));
                }
                WorkerMessage::Failure { worker, round: r, reason } if r == round => {
                    warn!(round, %worker, %reason, "worker_evaluation_failed");
                    failed.insert(worker);
                }
                WorkerMessage::Join { worker, sample_count } => self.on_join(worker, sample_count),
                other => debug!(round, worker=%other.worker(), "message_ignored"),
            }
        }
        let loss: Vec<(u64, f64)> = reports.values().map(|(n, l, _)| (*n, *l)).collect();
        let acc: Vec<(u64, f64)> = reports.values().map(|(n, _, a)| (*n, *a)).collect();
        match (weighted_metric(&loss), weighted_metric(&acc)) {
            (Some(loss), Some(accuracy)) => {
                info!(round, workers = reports.len(), loss, accuracy, "federated_evaluation");
                Ok(Some(TrainingMetrics { loss, accuracy }))
            }
            _ => {
                warn!(round, "federated_evaluation_no_reports");
                Ok(None)
            }
        }
    }

    async fn recv_until(&mut self, deadline: Instant) -> Result<Option<WorkerMessage>, FlError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() { return Ok(None); }
        Ok(self.link.recv(remaining).await?)
    }
}

struct RoundOutcome {
    persisted: bool,
    federated: Option<TrainingMetrics>,
}
