//! Worker side of the round protocol: train on the local partition when asked.

use std::time::Duration;
use tracing::{debug, info, warn};

use super::strategy::WorkerResult;
use crate::dataset::Dataset;
use crate::error::FlError;
use crate::model::TrainableModel;
use crate::params::ParticipantId;
use crate::protocol::{AggregatorMessage, WorkerMessage};
use crate::transport::Link;

pub struct WorkerRuntime<L, M> {
    id: ParticipantId,
    link: L,
    model: M,
    train: Dataset,
    test: Option<Dataset>,
    poll_interval: Duration,
    /// Last fit answer, resent as-is when the aggregator retries the same round.
    last_fit: Option<(u64, WorkerResult)>,
}

impl<L, M> WorkerRuntime<L, M>
where
    L: Link<WorkerMessage, AggregatorMessage>,
    M: TrainableModel,
{
    pub fn new(id: ParticipantId, link: L, model: M, train: Dataset, test: Option<Dataset>) -> Self {
        Self { id, link, model, train, test, poll_interval: Duration::from_secs(1), last_fit: None }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self { self.poll_interval = poll_interval; self }

    fn join_message(&self) -> WorkerMessage {
        WorkerMessage::Join { worker: self.id.clone(), sample_count: self.train.len() as u64 }
    }

    /// Announce, then serve `Fit`/`Evaluate` until `Finished` or the link closes.
    /// Training runs inline: nothing else is received while a fit is in progress.
    pub async fn run(&mut self) -> Result<(), FlError> {
        self.link.send(&self.join_message()).await?;
        info!(worker=%self.id, samples = self.train.len(), "worker_joined");
        loop {
            let Some(msg) = self.link.recv(self.poll_interval).await? else { continue };
            match msg {
                AggregatorMessage::Discover => self.link.send(&self.join_message()).await?,
                AggregatorMessage::Fit { round, config, parameters } => {
                    let cached = self.last_fit.as_ref().filter(|(r, _)| *r == round).map(|(_, res)| res.clone());
                    let reply = match cached {
                        Some(result) => {
                            debug!(worker=%self.id, round, "fit_result_resent");
                            WorkerMessage::FitResult { worker: self.id.clone(), round, result }
                        }
                        None => match self.fit(&config, &parameters) {
                            Ok(result) => {
                                info!(worker=%self.id, round, loss = result.training_metrics.loss, accuracy = result.training_metrics.accuracy, "local_fit_done");
                                self.last_fit = Some((round, result.clone()));
                                WorkerMessage::FitResult { worker: self.id.clone(), round, result }
                            }
                            Err(e) => {
                                warn!(worker=%self.id, round, error=%e, "local_fit_failed");
                                WorkerMessage::Failure { worker: self.id.clone(), round, reason: e.to_string() }
                            }
                        },
                    };
                    self.link.send(&reply).await?;
                }
                AggregatorMessage::Evaluate { round, parameters } => {
                    let reply = match self.evaluate(&parameters) {
                        Ok((loss, accuracy, sample_count)) => WorkerMessage::EvaluateResult { worker: self.id.clone(), round, loss, accuracy, sample_count },
                        Err(e) => {
                            warn!(worker=%self.id, round, error=%e, "local_evaluation_failed");
                            WorkerMessage::Failure { worker: self.id.clone(), round, reason: e.to_string() }
                        }
                    };
                    self.link.send(&reply).await?;
                }
                AggregatorMessage::Finished => {
                    info!(worker=%self.id, "experiment_finished");
                    return Ok(());
                }
            }
        }
    }

    fn fit(&mut self, config: &super::RoundConfig, global: &crate::params::ModelParameters) -> Result<WorkerResult, FlError> {
        self.model.set_parameters(global)?;
        let training_metrics = self.model.fit(&self.train, config, global)?;
        Ok(WorkerResult { parameters: self.model.get_parameters(), sample_count: self.train.len() as u64, training_metrics })
    }

    fn evaluate(&mut self, params: &crate::params::ModelParameters) -> Result<(f64, f64, u64), FlError> {
        let data = self.test.as_ref().ok_or_else(|| FlError::Evaluation("no local test set".into()))?;
        self.model.set_parameters(params)?;
        let report = self.model.evaluate(data)?;
        Ok((report.loss, report.accuracy, data.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federated_learning::{Algorithm, RoundConfig, StrategySettings};
    use crate::model::{LogisticRegression, SgdSettings};
    use crate::transport::memory_bus;

    fn data() -> Dataset {
        Dataset::new((0..8).map(|i| vec![i as f32 / 8.0]).collect(), (0..8).map(|i| (i % 2) as f32).collect()).unwrap()
    }

    #[tokio::test]
    async fn answers_fit_and_resends_cached_result_for_same_round() {
        let (mut hub, peers) = memory_bus::<AggregatorMessage, WorkerMessage>(16);
        let model = LogisticRegression::new(1, SgdSettings::default());
        let params = model.get_parameters();
        let mut rt = WorkerRuntime::new(ParticipantId::worker(1), peers.connect(), model, data(), None).with_poll_interval(Duration::from_millis(10));
        let task = tokio::spawn(async move { rt.run().await });

        let t = Duration::from_secs(1);
        assert!(matches!(hub.recv(t).await.unwrap(), Some(WorkerMessage::Join { sample_count: 8, .. })));
        let config = RoundConfig::for_round(Algorithm::FedProx, &StrategySettings::default(), 1);
        let fit = AggregatorMessage::Fit { round: 1, config, parameters: params };
        hub.send(&fit).await.unwrap();
        let Some(WorkerMessage::FitResult { round: 1, result: first, .. }) = hub.recv(t).await.unwrap() else { panic!("expected fit result") };
        assert_eq!(first.sample_count, 8);
        hub.send(&fit).await.unwrap();
        let Some(WorkerMessage::FitResult { result: again, .. }) = hub.recv(t).await.unwrap() else { panic!("expected resend") };
        assert_eq!(first, again);

        // no test set: evaluation is reported as a failure, not a crash
        hub.send(&AggregatorMessage::Evaluate { round: 1, parameters: again.parameters }).await.unwrap();
        assert!(matches!(hub.recv(t).await.unwrap(), Some(WorkerMessage::Failure { round: 1, .. })));

        hub.send(&AggregatorMessage::Finished).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bad_global_layout_is_reported_as_failure() {
        let (mut hub, peers) = memory_bus::<AggregatorMessage, WorkerMessage>(16);
        let mut rt = WorkerRuntime::new(ParticipantId::worker(2), peers.connect(), LogisticRegression::new(1, SgdSettings::default()), data(), None)
            .with_poll_interval(Duration::from_millis(10));
        let task = tokio::spawn(async move { rt.run().await });
        let t = Duration::from_secs(1);
        hub.recv(t).await.unwrap();
        let config = RoundConfig::for_round(Algorithm::FedAvg, &StrategySettings::default(), 3);
        hub.send(&AggregatorMessage::Fit { round: 3, config, parameters: crate::params::ModelParameters::default() }).await.unwrap();
        assert!(matches!(hub.recv(t).await.unwrap(), Some(WorkerMessage::Failure { round: 3, .. })));
        hub.send(&AggregatorMessage::Finished).await.unwrap();
        task.await.unwrap().unwrap();
    }
}
