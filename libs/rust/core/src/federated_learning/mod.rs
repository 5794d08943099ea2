//! Federated learning: aggregation strategies, the aggregator's round coordinator and the worker runtime.

pub mod coordinator;
pub mod participant;
pub mod strategy;

pub use coordinator::{CentralEvaluator, CoordinatorConfig, Evaluator, RoundCoordinator, RunSummary};
pub use participant::WorkerRuntime;
pub use strategy::{
    aggregate,
    aggregate_training_metrics,
    weighted_metric,
    Algorithm,
    RoundConfig,
    StrategySettings,
    TrainingMetrics,
    WorkerResult,
};
