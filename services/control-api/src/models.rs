//! Request and response bodies of the operator API.

use serde::{Deserialize, Serialize};
use fl_core::{AgentStatus, Algorithm, ParticipantId};

#[derive(Debug, Deserialize)]
pub struct AlgorithmUpdate {
    pub algorithm: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub algorithm: Algorithm,
    /// Worker agents currently hosted.
    pub active_agents: usize,
    pub aggregator: Option<AgentStatus>,
    pub workers: Vec<AgentStatus>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<ParticipantId>,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self { Self { message: message.into(), cid: None } }
}

#[derive(Debug, Serialize)]
pub struct AlgorithmResponse {
    pub algorithm: Algorithm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FederationResponse {
    pub message: String,
    pub algorithm: Algorithm,
    pub workers_signalled: usize,
    pub failed: Vec<ParticipantId>,
}

#[derive(Debug, Serialize)]
pub struct AnalyticsStatus {
    pub fedavg: bool,
    pub fedprox: bool,
    pub comparison: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}
