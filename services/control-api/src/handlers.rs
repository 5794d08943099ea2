use axum::{extract::{Path, State}, http::StatusCode, response::{IntoResponse, Response}, Json};
use std::sync::Arc;
use tracing::info;
use fl_core::{telemetry, Algorithm, EvaluationRecord};

use crate::error::ApiError;
use crate::manager::AgentManager;
use crate::models::*;

type Manager = State<Arc<AgentManager>>;

pub async fn status(State(manager): Manager) -> Json<StatusResponse> {
    let (algorithm, aggregator, workers) = manager.snapshot().await;
    Json(StatusResponse { status: "running", algorithm, active_agents: workers.len(), aggregator, workers })
}

pub async fn start_infrastructure(State(manager): Manager) -> Result<Json<MessageResponse>, ApiError> {
    let started = manager.start_infrastructure().await?;
    Ok(Json(MessageResponse::new(if started { "Infrastructure Started" } else { "Infrastructure Already Running" })))
}

pub async fn add_agent(State(manager): Manager) -> Result<Json<MessageResponse>, ApiError> {
    let cid = manager.add_worker().await?;
    Ok(Json(MessageResponse { message: format!("Agent {cid} Added"), cid: Some(cid) }))
}

pub async fn get_algorithm(State(manager): Manager) -> Json<AlgorithmResponse> {
    Json(AlgorithmResponse { algorithm: manager.algorithm().await, message: None })
}

pub async fn set_algorithm(State(manager): Manager, Json(update): Json<AlgorithmUpdate>) -> Result<Json<AlgorithmResponse>, ApiError> {
    let (algorithm, restarted) = manager.set_algorithm(&update.algorithm).await?;
    let message = if restarted { format!("Algorithm set to {algorithm}; aggregator restarting") } else { format!("Algorithm set to {algorithm}") };
    Ok(Json(AlgorithmResponse { algorithm, message: Some(message) }))
}

pub async fn start_federation(State(manager): Manager) -> Result<Json<FederationResponse>, ApiError> {
    let started = manager.start_federation().await?;
    Ok(Json(FederationResponse {
        message: format!("Federation started with {}", started.algorithm),
        algorithm: started.algorithm,
        workers_signalled: started.workers_signalled,
        failed: started.failed,
    }))
}

pub async fn stop_federation(State(manager): Manager) -> Result<Json<FederationResponse>, ApiError> {
    let stopped = manager.stop_federation().await?;
    Ok(Json(FederationResponse {
        message: "Federation stopped".into(),
        algorithm: stopped.algorithm,
        workers_signalled: stopped.workers_signalled,
        failed: stopped.failed,
    }))
}

pub async fn reset_system(State(manager): Manager) -> Result<Json<MessageResponse>, ApiError> {
    let backup = manager.reset_system().await?;
    Ok(Json(MessageResponse::new(format!("System Reset Complete. Previous experiment data archived to: {}", backup.display()))))
}

pub async fn metrics(State(manager): Manager, Path(algorithm): Path<String>) -> Result<Json<Vec<EvaluationRecord>>, ApiError> {
    let records = manager.metrics(&algorithm)?;
    info!(%algorithm, records = records.len(), "metrics_served");
    Ok(Json(records))
}

pub async fn analytics_status(State(manager): Manager) -> Json<AnalyticsStatus> {
    let store = manager.store();
    let fedavg = store.has_metrics(Algorithm::FedAvg);
    let fedprox = store.has_metrics(Algorithm::FedProx);
    Json(AnalyticsStatus { fedavg, fedprox, comparison: fedavg && fedprox })
}

/// Agent and supervisor counters of the processes this API hosts.
pub async fn prometheus_metrics() -> Response {
    match telemetry::render() {
        Ok(text) => (StatusCode::OK, [("Content-Type", "text/plain; version=0.0.4")], text).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response(),
    }
}
