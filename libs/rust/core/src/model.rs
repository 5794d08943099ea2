//! Trainable model boundary and the default binary classifier.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::error::FlError;
use crate::federated_learning::{RoundConfig, TrainingMetrics};
use crate::params::{ModelParameters, Tensor};

/// Held-out evaluation of one parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub loss: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// `[[tn, fp], [fn, tp]]`
    pub confusion_matrix: [[u64; 2]; 2],
}

pub trait TrainableModel: Send {
    fn get_parameters(&self) -> ModelParameters;
    fn set_parameters(&mut self, params: &ModelParameters) -> Result<(), FlError>;
    /// Local training starting from the current parameters. `global` is the
    /// round-start model the proximal term pulls towards.
    fn fit(&mut self, data: &Dataset, config: &RoundConfig, global: &ModelParameters) -> Result<TrainingMetrics, FlError>;
    fn evaluate(&self, data: &Dataset) -> Result<EvaluationReport, FlError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgdSettings {
    pub local_epochs: usize,
    pub batch_size: usize,
    pub seed: u64,
}

impl Default for SgdSettings {
    fn default() -> Self { Self { local_epochs: 3, batch_size: 32, seed: 42 } }
}

/// Logistic regression trained with mini-batch SGD.
/// Parameters are `[weights [dim], bias [1]]`.
#[derive(Debug, Clone)]
pub struct LogisticRegression {
    weights: Vec<f32>,
    bias: f32,
    settings: SgdSettings,
}

const EPS: f64 = 1e-7;

impl LogisticRegression {
    /// Small seeded random init so every process starts from the same model.
    pub fn new(dim: usize, settings: SgdSettings) -> Self {
        let mut rng = StdRng::seed_from_u64(settings.seed);
        let weights = (0..dim).map(|_| rng.gen_range(-0.01f32..0.01)).collect();
        Self { weights, bias: 0.0, settings }
    }

    pub fn dim(&self) -> usize { self.weights.len() }

    fn predict(&self, x: &[f32]) -> f64 {
        let z: f64 = self.weights.iter().zip(x).map(|(w, v)| (*w as f64) * (*v as f64)).sum::<f64>() + self.bias as f64;
        1.0 / (1.0 + (-z).exp())
    }

    fn check_dim(&self, data: &Dataset) -> Result<(), FlError> {
        if data.dim() != self.dim() {
            return Err(FlError::Model(format!("dataset has {} features, model expects {}", data.dim(), self.dim())));
        }
        Ok(())
    }
}

fn bce(p: f64, y: f64) -> f64 {
    let p = p.clamp(EPS, 1.0 - EPS);
    -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
}

impl TrainableModel for LogisticRegression {
    fn get_parameters(&self) -> ModelParameters {
        ModelParameters::new(vec![
            Tensor { shape: vec![self.dim()], values: self.weights.clone() },
            Tensor { shape: vec![1], values: vec![self.bias] },
        ])
    }

    fn set_parameters(&mut self, params: &ModelParameters) -> Result<(), FlError> {
        if !params.same_layout(&self.get_parameters()) {
            return Err(FlError::ShapeMismatch(format!("expected [[{}], [1]], got {:?}", self.dim(), params.shapes())));
        }
        self.weights.clone_from(&params.tensors[0].values);
        self.bias = params.tensors[1].values[0];
        Ok(())
    }

    fn fit(&mut self, data: &Dataset, config: &RoundConfig, global: &ModelParameters) -> Result<TrainingMetrics, FlError> {
        self.check_dim(data)?;
        if data.is_empty() { return Err(FlError::Model("empty training set".into())); }
        if !global.same_layout(&self.get_parameters()) {
            return Err(FlError::ShapeMismatch(format!("global model layout {:?}", global.shapes())));
        }
        let g_weights = &global.tensors[0].values;
        let g_bias = global.tensors[1].values[0];
        let lr = config.learning_rate as f32;
        let mu = config.regularization_strength as f32;
        let mut rng = StdRng::seed_from_u64(self.settings.seed ^ config.round);
        let mut order: Vec<usize> = (0..data.len()).collect();
        let batch = self.settings.batch_size.max(1);
        let mut metrics = TrainingMetrics::default();

        for _ in 0..self.settings.local_epochs.max(1) {
            order.shuffle(&mut rng);
            let (mut loss_sum, mut correct) = (0f64, 0usize);
            for chunk in order.chunks(batch) {
                let mut grad_w = vec![0f32; self.dim()];
                let mut grad_b = 0f32;
                for &i in chunk {
                    let (x, y) = (&data.features[i], data.labels[i] as f64);
                    let p = self.predict(x);
                    loss_sum += bce(p, y);
                    if (p >= 0.5) == (y >= 0.5) { correct += 1; }
                    let err = (p - y) as f32;
                    for (g, v) in grad_w.iter_mut().zip(x) { *g += err * v; }
                    grad_b += err;
                }
                let n = chunk.len() as f32;
                for (j, w) in self.weights.iter_mut().enumerate() {
                    *w -= lr * (grad_w[j] / n + mu * (*w - g_weights[j]));
                }
                self.bias -= lr * (grad_b / n + mu * (self.bias - g_bias));
            }
            let prox = if mu > 0.0 { 0.5 * mu as f64 * self.get_parameters().squared_distance(global)? } else { 0.0 };
            metrics = TrainingMetrics { loss: loss_sum / data.len() as f64 + prox, accuracy: correct as f64 / data.len() as f64 };
        }
        Ok(metrics)
    }

    fn evaluate(&self, data: &Dataset) -> Result<EvaluationReport, FlError> {
        self.check_dim(data)?;
        if data.is_empty() { return Err(FlError::Evaluation("empty evaluation set".into())); }
        let mut cm = [[0u64; 2]; 2];
        let mut loss = 0f64;
        for (x, y) in data.features.iter().zip(&data.labels) {
            let p = self.predict(x);
            if !p.is_finite() { return Err(FlError::Evaluation("non-finite prediction".into())); }
            loss += bce(p, *y as f64);
            cm[usize::from(*y >= 0.5)][usize::from(p >= 0.5)] += 1;
        }
        Ok(report_from_confusion(loss / data.len() as f64, cm))
    }
}

/// Accuracy plus macro-averaged precision, recall and f1 over both classes.
/// A class with no predicted (or no actual) samples scores 0 for that term.
pub fn report_from_confusion(loss: f64, cm: [[u64; 2]; 2]) -> EvaluationReport {
    let total: u64 = cm.iter().flatten().sum();
    let ratio = |num: u64, den: u64| if den == 0 { 0.0 } else { num as f64 / den as f64 };
    let mut precision = 0.0;
    let mut recall = 0.0;
    let mut f1 = 0.0;
    for class in 0..2 {
        let tp = cm[class][class];
        let predicted = cm[0][class] + cm[1][class];
        let actual = cm[class][0] + cm[class][1];
        let p = ratio(tp, predicted);
        let r = ratio(tp, actual);
        precision += p / 2.0;
        recall += r / 2.0;
        f1 += if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) } / 2.0;
    }
    EvaluationReport { loss, accuracy: ratio(cm[0][0] + cm[1][1], total), precision, recall, f1, confusion_matrix: cm }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federated_learning::{Algorithm, StrategySettings};

    fn separable(n: usize) -> Dataset {
        let features = (0..n).map(|i| vec![if i % 2 == 0 { -1.0 } else { 1.0 }, 0.5]).collect();
        let labels = (0..n).map(|i| (i % 2) as f32).collect();
        Dataset::new(features, labels).unwrap()
    }

    fn cfg(round: u64, lr: f64, mu: f64) -> RoundConfig { RoundConfig { round, learning_rate: lr, regularization_strength: mu } }

    #[test]
    fn learns_a_separable_problem() {
        let data = separable(64);
        let mut m = LogisticRegression::new(2, SgdSettings { local_epochs: 20, batch_size: 8, seed: 1 });
        let start = m.get_parameters();
        let before = m.evaluate(&data).unwrap().loss;
        m.fit(&data, &cfg(1, 0.5, 0.0), &start).unwrap();
        let report = m.evaluate(&data).unwrap();
        assert!(report.loss < before);
        assert_eq!(report.accuracy, 1.0);
        assert_eq!(report.confusion_matrix, [[32, 0], [0, 32]]);
    }

    #[test]
    fn proximal_term_keeps_weights_closer_to_global() {
        let data = separable(64);
        let settings = SgdSettings { local_epochs: 5, batch_size: 8, seed: 3 };
        let global = LogisticRegression::new(2, settings.clone()).get_parameters();
        let mut plain = LogisticRegression::new(2, settings.clone());
        let mut prox = LogisticRegression::new(2, settings);
        plain.fit(&data, &cfg(1, 0.5, 0.0), &global).unwrap();
        prox.fit(&data, &cfg(1, 0.5, 1.0), &global).unwrap();
        let d_plain = plain.get_parameters().squared_distance(&global).unwrap();
        let d_prox = prox.get_parameters().squared_distance(&global).unwrap();
        assert!(d_prox < d_plain);
    }

    #[test]
    fn fit_uses_round_config_schedule() {
        let s = StrategySettings::default();
        let data = separable(16);
        let mut m = LogisticRegression::new(2, SgdSettings::default());
        let global = m.get_parameters();
        let metrics = m.fit(&data, &RoundConfig::for_round(Algorithm::FedProx, &s, 1), &global).unwrap();
        assert!(metrics.loss.is_finite());
        assert!((0.0..=1.0).contains(&metrics.accuracy));
    }

    #[test]
    fn macro_metrics_from_confusion() {
        // tn=50 fp=10 fn=5 tp=35
        let r = report_from_confusion(0.3, [[50, 10], [5, 35]]);
        assert!((r.accuracy - 0.85).abs() < 1e-12);
        let p = (50.0 / 55.0 + 35.0 / 45.0) / 2.0;
        let rc = (50.0 / 60.0 + 35.0 / 40.0) / 2.0;
        assert!((r.precision - p).abs() < 1e-12);
        assert!((r.recall - rc).abs() < 1e-12);
        let all_negative = report_from_confusion(0.1, [[10, 0], [0, 0]]);
        assert_eq!(all_negative.precision, 0.5);
    }

    #[test]
    fn rejects_foreign_layouts_and_dims() {
        let mut m = LogisticRegression::new(3, SgdSettings::default());
        assert!(m.set_parameters(&ModelParameters::new(vec![Tensor::zeros(vec![2]), Tensor::zeros(vec![1])])).is_err());
        assert!(matches!(m.evaluate(&separable(4)), Err(FlError::Model(_))));
        assert!(matches!(m.evaluate(&Dataset::default()), Err(FlError::Model(_))));
    }
}
