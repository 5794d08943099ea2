//! Aggregation strategies (FedAvg, FedProx) and the per-round configuration schedule.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::FlError;
use crate::params::{ModelParameters, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    FedAvg,
    FedProx,
}

impl Algorithm {
    pub const ALL: [Algorithm; 2] = [Algorithm::FedAvg, Algorithm::FedProx];

    pub fn as_str(&self) -> &'static str {
        match self { Algorithm::FedAvg => "fedavg", Algorithm::FedProx => "fedprox" }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Algorithm {
    type Err = FlError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fedavg" => Ok(Algorithm::FedAvg),
            "fedprox" => Ok(Algorithm::FedProx),
            other => Err(FlError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Learning-rate schedule and proximal strength shared by every round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySettings {
    pub base_lr: f64,
    pub lr_decay: f64,
    pub lr_decay_period: u64,
    pub proximal_mu: f64,
}

impl Default for StrategySettings {
    fn default() -> Self { Self { base_lr: 0.001, lr_decay: 0.9, lr_decay_period: 10, proximal_mu: 0.01 } }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoundConfig {
    pub round: u64,
    pub learning_rate: f64,
    pub regularization_strength: f64,
}

impl RoundConfig {
    /// Pure function of the round number and the strategy.
    pub fn for_round(algorithm: Algorithm, settings: &StrategySettings, round: u64) -> Self {
        let period = settings.lr_decay_period.max(1);
        let steps = round.saturating_sub(1) / period;
        let learning_rate = settings.base_lr * settings.lr_decay.powi(steps as i32);
        let regularization_strength = match algorithm {
            Algorithm::FedProx => settings.proximal_mu,
            Algorithm::FedAvg => 0.0,
        };
        Self { round, learning_rate, regularization_strength }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub parameters: ModelParameters,
    pub sample_count: u64,
    pub training_metrics: TrainingMetrics,
}

/// Sample-count weighted average of every tensor, elementwise.
pub fn aggregate(results: &[(u64, &ModelParameters)]) -> Result<ModelParameters, FlError> {
    let Some((_, first)) = results.first() else {
        return Err(FlError::InsufficientParticipants { needed: 1, actual: 0 });
    };
    let total_samples: u64 = results.iter().map(|(n, _)| *n).sum();
    if total_samples == 0 {
        return Err(FlError::InsufficientParticipants { needed: 1, actual: 0 });
    }
    for (_, params) in results {
        params.validate()?;
        if !params.same_layout(first) {
            return Err(FlError::ShapeMismatch(format!("{:?} vs {:?}", params.shapes(), first.shapes())));
        }
    }
    let mut agg = Vec::with_capacity(first.tensors.len());
    for (t, template) in first.tensors.iter().enumerate() {
        let mut acc = vec![0f64; template.len()];
        for (n, params) in results {
            let w = *n as f64 / total_samples as f64;
            for (i, v) in params.tensors[t].values.iter().enumerate() { acc[i] += *v as f64 * w; }
        }
        agg.push(Tensor { shape: template.shape.clone(), values: acc.into_iter().map(|v| v as f32).collect() });
    }
    Ok(ModelParameters::new(agg))
}

/// `Σ n_k·m_k / Σ n_k`; `None` when there are no samples.
pub fn weighted_metric(samples: &[(u64, f64)]) -> Option<f64> {
    let total: u64 = samples.iter().map(|(n, _)| *n).sum();
    if total == 0 { return None; }
    Some(samples.iter().map(|(n, m)| *n as f64 * m).sum::<f64>() / total as f64)
}

/// Weighted loss/accuracy over worker training reports.
pub fn aggregate_training_metrics(results: &[&WorkerResult]) -> Option<TrainingMetrics> {
    let loss: Vec<(u64, f64)> = results.iter().map(|r| (r.sample_count, r.training_metrics.loss)).collect();
    let acc: Vec<(u64, f64)> = results.iter().map(|r| (r.sample_count, r.training_metrics.accuracy)).collect();
    Some(TrainingMetrics { loss: weighted_metric(&loss)?, accuracy: weighted_metric(&acc)? })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(v: f32) -> ModelParameters { ModelParameters::new(vec![Tensor::new(vec![1], vec![v]).unwrap()]) }

    #[test]
    fn fedavg_round_eleven_decays_once() {
        let cfg = RoundConfig::for_round(Algorithm::FedAvg, &StrategySettings::default(), 11);
        assert!((cfg.learning_rate - 0.0009).abs() < 1e-12);
        assert_eq!(cfg.regularization_strength, 0.0);
        let first = RoundConfig::for_round(Algorithm::FedAvg, &StrategySettings::default(), 10);
        assert!((first.learning_rate - 0.001).abs() < 1e-12);
    }

    #[test]
    fn fedprox_carries_mu_every_round() {
        let s = StrategySettings::default();
        for r in [1, 2, 10, 11, 50, 500] {
            assert_eq!(RoundConfig::for_round(Algorithm::FedProx, &s, r).regularization_strength, 0.01);
        }
    }

    #[test]
    fn round_config_is_pure() {
        let s = StrategySettings::default();
        assert_eq!(RoundConfig::for_round(Algorithm::FedProx, &s, 23), RoundConfig::for_round(Algorithm::FedProx, &s, 23));
    }

    #[test]
    fn aggregates_weighted_by_samples() {
        let a = ModelParameters::new(vec![Tensor::new(vec![3], vec![0.1, 0.2, 0.3]).unwrap()]);
        let b = ModelParameters::new(vec![Tensor::new(vec![3], vec![0.2, 0.4, 0.6]).unwrap()]);
        let model = aggregate(&[(10, &a), (30, &b)]).unwrap();
        // (0.1*10 + 0.2*30)/40 = 0.175
        assert!((model.tensors[0].values[0] - 0.175).abs() < 1e-6);
        assert!((model.tensors[0].values[2] - 0.525).abs() < 1e-6);
    }

    #[test]
    fn aggregate_matches_weighted_mean_for_many_workers() {
        let inputs = [(17u64, 1.5f32), (3, -2.0), (250, 0.25), (1, 100.0)];
        let params: Vec<ModelParameters> = inputs.iter().map(|(_, v)| scalar(*v)).collect();
        let refs: Vec<(u64, &ModelParameters)> = inputs.iter().zip(&params).map(|((n, _), p)| (*n, p)).collect();
        let got = aggregate(&refs).unwrap().tensors[0].values[0] as f64;
        let expected = weighted_metric(&inputs.iter().map(|(n, v)| (*n, *v as f64)).collect::<Vec<_>>()).unwrap();
        assert!((got - expected).abs() < 1e-4);
    }

    #[test]
    fn aggregate_rejects_mismatched_layouts_and_empty_input() {
        let a = scalar(1.0);
        let b = ModelParameters::new(vec![Tensor::zeros(vec![2])]);
        assert!(matches!(aggregate(&[(1, &a), (1, &b)]), Err(FlError::ShapeMismatch(_))));
        assert!(aggregate(&[]).is_err());
    }

    #[test]
    fn aggregate_rejects_values_longer_than_shape() {
        let good = ModelParameters::new(vec![Tensor::new(vec![2], vec![1.0, 2.0]).unwrap()]);
        let long = ModelParameters::new(vec![Tensor { shape: vec![2], values: vec![1.0, 2.0, 3.0] }]);
        assert!(matches!(aggregate(&[(1, &good), (1, &long)]), Err(FlError::ShapeMismatch(_))));
        assert!(matches!(aggregate(&[(1, &long), (1, &good)]), Err(FlError::ShapeMismatch(_))));
    }

    #[test]
    fn weighted_accuracy_scenario() {
        let acc = weighted_metric(&[(600, 0.8), (400, 0.9)]).unwrap();
        assert!((acc - 0.84).abs() < 1e-12);
        assert!(weighted_metric(&[]).is_none());
    }

    #[test]
    fn parses_algorithm_names() {
        assert_eq!("FedProx".parse::<Algorithm>().unwrap(), Algorithm::FedProx);
        assert!(matches!("fednova".parse::<Algorithm>(), Err(FlError::UnknownAlgorithm(_))));
    }
}
