//! Experiment configuration: built-in defaults, then `FL_CONFIG_FILE`, then `FL__*` environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::AgentConfig;
use crate::error::FlError;
use crate::federated_learning::{Algorithm, CoordinatorConfig, StrategySettings};
use crate::model::SgdSettings;
use crate::params::ParticipantId;
use crate::resilience::RetryConfig;
use crate::store::ExperimentStore;
use crate::supervisor::LaunchSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlTransport { Nats, Local }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Names the data-plane subjects so experiments sharing a broker stay apart.
    pub experiment: String,
    pub nats_host: String,
    pub nats_port: u16,
    pub control_transport: ControlTransport,
    pub train_data: PathBuf,
    pub test_data: PathBuf,
    pub num_workers: usize,
    pub num_rounds: u64,
    pub min_fit_workers: usize,
    pub min_available_workers: usize,
    pub round_timeout_secs: u64,
    pub base_lr: f64,
    pub lr_decay: f64,
    pub lr_decay_period: u64,
    pub proximal_mu: f64,
    pub local_epochs: usize,
    pub batch_size: usize,
    pub seed: u64,
    pub federated_evaluation: bool,
    pub metrics_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub log_file: Option<PathBuf>,
    pub grace_period_ms: u64,
    pub kill_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub broadcast_timeout_ms: u64,
    pub settle_delay_secs: u64,
    pub api_port: u16,
    /// Health/metrics listener; `None` disables it (several processes share a host).
    pub health_port: Option<u16>,
    pub worker_bin: PathBuf,
    pub aggregator_bin: PathBuf,
    pub default_algorithm: Algorithm,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        let strategy = StrategySettings::default();
        let sgd = SgdSettings::default();
        Self {
            experiment: "ids".into(),
            nats_host: "127.0.0.1".into(),
            nats_port: 4222,
            control_transport: ControlTransport::Local,
            train_data: "data/train.csv".into(),
            test_data: "data/test.csv".into(),
            num_workers: 3,
            num_rounds: 50,
            min_fit_workers: 3,
            min_available_workers: 3,
            round_timeout_secs: 600,
            base_lr: strategy.base_lr,
            lr_decay: strategy.lr_decay,
            lr_decay_period: strategy.lr_decay_period,
            proximal_mu: strategy.proximal_mu,
            local_epochs: sgd.local_epochs,
            batch_size: sgd.batch_size,
            seed: sgd.seed,
            federated_evaluation: false,
            metrics_dir: "backend".into(),
            checkpoint_dir: "backend/checkpoints".into(),
            backup_dir: "experiment_backups".into(),
            log_file: Some("backend/logs/system.log".into()),
            grace_period_ms: 2000,
            kill_timeout_ms: 5000,
            poll_interval_ms: 1000,
            broadcast_timeout_ms: 2000,
            settle_delay_secs: 5,
            api_port: 8000,
            health_port: None,
            worker_bin: "fl-worker".into(),
            aggregator_bin: "fl-aggregator".into(),
            default_algorithm: Algorithm::FedProx,
        }
    }
}

impl ExperimentConfig {
    pub fn validate(&self) -> Result<(), FlError> {
        if self.num_workers == 0 { return Err(FlError::Config("num_workers must be at least 1".into())); }
        if self.min_fit_workers == 0 || self.min_fit_workers > self.num_workers {
            return Err(FlError::Config(format!("min_fit_workers {} outside 1..={}", self.min_fit_workers, self.num_workers)));
        }
        if self.min_available_workers < self.min_fit_workers || self.min_available_workers > self.num_workers {
            return Err(FlError::Config(format!(
                "min_available_workers {} outside {}..={}",
                self.min_available_workers, self.min_fit_workers, self.num_workers
            )));
        }
        if self.batch_size == 0 { return Err(FlError::Config("batch_size must be positive".into())); }
        if !(self.lr_decay > 0.0 && self.base_lr > 0.0) { return Err(FlError::Config("learning rate schedule must be positive".into())); }
        Ok(())
    }

    pub fn strategy(&self) -> StrategySettings {
        StrategySettings { base_lr: self.base_lr, lr_decay: self.lr_decay, lr_decay_period: self.lr_decay_period, proximal_mu: self.proximal_mu }
    }

    pub fn sgd(&self) -> SgdSettings { SgdSettings { local_epochs: self.local_epochs, batch_size: self.batch_size, seed: self.seed } }

    pub fn coordinator(&self, algorithm: Algorithm) -> CoordinatorConfig {
        CoordinatorConfig {
            algorithm,
            num_rounds: self.num_rounds,
            min_fit_workers: self.min_fit_workers,
            min_available_workers: self.min_available_workers,
            round_timeout: Duration::from_secs(self.round_timeout_secs),
            federated_evaluation: self.federated_evaluation,
            strategy: self.strategy(),
            retry: RetryConfig { max_retries: None, base_delay: Duration::from_secs(1), max_delay: Duration::from_secs(30), jitter: 0.2 },
        }
    }

    pub fn agent(&self) -> AgentConfig {
        AgentConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            grace_period: Duration::from_millis(self.grace_period_ms),
            kill_timeout: Duration::from_millis(self.kill_timeout_ms),
            broadcast_timeout: Duration::from_millis(self.broadcast_timeout_ms),
        }
    }

    pub fn store(&self) -> ExperimentStore { ExperimentStore::new(&self.metrics_dir, &self.checkpoint_dir) }

    pub fn settle_delay(&self) -> Duration { Duration::from_secs(self.settle_delay_secs) }

    /// Command line the agent for `identity` runs on START. The aggregator's
    /// `--algorithm` is appended by the agent itself.
    pub fn launch_spec(&self, identity: &ParticipantId) -> Result<LaunchSpec, FlError> {
        if identity.is_aggregator() {
            return Ok(LaunchSpec::new(resolve_bin(&self.aggregator_bin)).arg("--supervised"));
        }
        let index = identity.worker_index()?;
        if index > self.num_workers {
            return Err(FlError::InvalidIdentity(format!("{identity} (only {} workers configured)", self.num_workers)));
        }
        let mut spec = LaunchSpec::new(resolve_bin(&self.worker_bin))
            .args(["--cid".to_string(), index.to_string(), "--num-workers".to_string(), self.num_workers.to_string()])
            .arg("--data")
            .arg(self.train_data.display().to_string());
        if self.federated_evaluation {
            spec = spec.arg("--test-data").arg(self.test_data.display().to_string());
        }
        Ok(spec.arg("--supervised"))
    }
}

/// Resolve a sibling binary of the running executable, falling back to `PATH` lookup.
pub fn resolve_bin(bin: &Path) -> PathBuf {
    if bin.components().count() > 1 { return bin.to_path_buf(); }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(bin)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| bin.to_path_buf())
}

pub fn load_config(service: &str) -> Result<ExperimentConfig, FlError> {
    let mut builder = config::Config::builder();
    if let Ok(file) = std::env::var("FL_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("FL").separator("__"));
    let cfg: ExperimentConfig = builder
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| FlError::Config(format!("{service}: {e}")))?;
    cfg.validate()?;
    tracing::debug!(service, experiment=%cfg.experiment, "config_loaded");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_and_derive_sub_configs() {
        let cfg = ExperimentConfig::default();
        cfg.validate().unwrap();
        let c = cfg.coordinator(Algorithm::FedAvg);
        assert_eq!(c.num_rounds, 50);
        assert_eq!(c.retry.max_retries, None);
        assert_eq!(cfg.agent().poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.store().metrics_path(Algorithm::FedProx), PathBuf::from("backend/metrics_fedprox.json"));
    }

    #[test]
    fn rejects_inconsistent_thresholds() {
        let cfg = ExperimentConfig { min_fit_workers: 4, ..ExperimentConfig::default() };
        assert!(matches!(cfg.validate(), Err(FlError::Config(_))));
        let cfg = ExperimentConfig { min_available_workers: 2, ..ExperimentConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn launch_specs_per_role() {
        let cfg = ExperimentConfig { worker_bin: "/opt/fl/fl-worker".into(), aggregator_bin: "/opt/fl/fl-aggregator".into(), ..ExperimentConfig::default() };
        let agg = cfg.launch_spec(&ParticipantId::aggregator()).unwrap();
        assert_eq!(agg.program, PathBuf::from("/opt/fl/fl-aggregator"));
        assert_eq!(agg.args, vec!["--supervised"]);
        let w = cfg.launch_spec(&ParticipantId::worker(2)).unwrap();
        assert_eq!(w.args, vec!["--cid", "2", "--num-workers", "3", "--data", "data/train.csv", "--supervised"]);
        assert!(matches!(cfg.launch_spec(&ParticipantId::worker(4)), Err(FlError::InvalidIdentity(_))));
        assert!(cfg.launch_spec(&ParticipantId::new("zero")).is_err());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fl.json");
        std::fs::write(&path, r#"{"num_rounds": 7, "default_algorithm": "fedavg", "federated_evaluation": true}"#).unwrap();
        let cfg: ExperimentConfig = config::Config::builder()
            .add_source(config::File::from(path.as_path()))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.num_rounds, 7);
        assert_eq!(cfg.default_algorithm, Algorithm::FedAvg);
        assert!(cfg.federated_evaluation);
        assert_eq!(cfg.num_workers, 3);
    }
}
