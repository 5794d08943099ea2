//! Error taxonomy shared by the control plane.

use thiserror::Error;

use crate::params::ParticipantId;

#[derive(Debug, Error)]
pub enum FlError {
    #[error("invalid partition: total={total} workers={workers} index={index}")]
    InvalidPartition { total: usize, workers: usize, index: usize },
    #[error("unknown algorithm '{0}' (expected fedavg or fedprox)")]
    UnknownAlgorithm(String),
    #[error("invalid participant identity '{0}'")]
    InvalidIdentity(String),
    #[error("process for {0} is already running")]
    AlreadyRunning(ParticipantId),
    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, #[source] source: std::io::Error },
    #[error("parameter layout mismatch: {0}")]
    ShapeMismatch(String),
    #[error("insufficient participants: needed {needed}, got {actual}")]
    InsufficientParticipants { needed: usize, actual: usize },
    #[error("evaluation failed: {0}")]
    Evaluation(String),
    #[error("model error: {0}")]
    Model(String),
    #[error("dataset error: {0}")]
    Dataset(String),
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Failures of the message fabric (control channel or data link).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },
    #[error("subscribe to {subject} failed: {reason}")]
    Subscribe { subject: String, reason: String },
    #[error("no route to {0}")]
    UnknownTarget(ParticipantId),
    #[error("send timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("channel closed")]
    Closed,
}

pub type FlResult<T> = Result<T, FlError>;
