//! Core shared pieces of the federated learning control plane.

use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use once_cell::sync::OnceCell;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }

/// Stdout (JSON when `FL_JSON_LOG=1`) plus an append-only log file shared by every process.
pub fn init_tracing(service: &str, log_file: Option<&Path>) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("FL_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let stdout_layer = if json {
            tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).boxed()
        } else {
            tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true).boxed()
        };
        let file_layer = match log_file {
            Some(path) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path).with_context(|| format!("opening log file {}", path.display()))?;
                Some(tracing_subscriber::fmt::layer().with_ansi(false).with_target(true).with_writer(Mutex::new(file)))
            }
            None => None,
        };
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry().with(env_filter).with(stdout_layer).with(file_layer).try_init()?;
        Ok(())
    })?;
    info!(target: "fl_core", service, "tracing_initialized");
    Ok(())
}

pub async fn start_health_server(port: u16) -> Result<()> {
    let app = Router::new()
        .route("/live", get(|| async { axum::Json(serde_json::json!({"live": NODE_LIVENESS.load(Ordering::SeqCst)})) }))
        .route("/ready", get(|| async { axum::Json(serde_json::json!({"ready": NODE_READINESS.load(Ordering::SeqCst)})) }))
        .route("/metrics", get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding health server on {addr}"))?;
    tracing::info!(?addr, "health_server_listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error=?e, "health_server_failed");
        }
    });
    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    match telemetry::render() {
        Ok(text) => (StatusCode::OK, [("Content-Type", "text/plain; version=0.0.4")], text).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response(),
    }
}

/// Resolves once stdin reaches EOF: the supervisor's graceful stop request.
pub async fn stdin_closed() {
    use tokio::io::AsyncReadExt;
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 256];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

pub mod agent;
pub mod dataset;
pub mod error;
pub mod federated_learning;
pub mod model;
pub mod params;
pub mod partition;
pub mod protocol;
pub mod resilience;
pub mod settings;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod transport;

pub use agent::{AgentConfig, AgentState, AgentStatus, Broadcaster, CommandAgent};
pub use dataset::Dataset;
pub use error::{FlError, FlResult, TransportError};
pub use federated_learning::{
    Algorithm, CentralEvaluator, CoordinatorConfig, Evaluator, RoundConfig, RoundCoordinator, RunSummary, StrategySettings, TrainingMetrics,
    WorkerResult, WorkerRuntime,
};
pub use model::{EvaluationReport, LogisticRegression, SgdSettings, TrainableModel};
pub use params::{ModelParameters, ParticipantId, Tensor};
pub use partition::partition;
pub use protocol::{AggregatorMessage, Command, Verb, WorkerMessage};
pub use resilience::{retry_async, RetryConfig};
pub use settings::{load_config, resolve_bin, ControlTransport, ExperimentConfig};
pub use store::{Checkpoint, EvaluationRecord, ExperimentStore};
pub use supervisor::{LaunchSpec, RestartReport, StaleProcessWarning, Supervisor, TerminationOutcome};
pub use telemetry::{CONTROL_METRICS, FL_METRICS};
