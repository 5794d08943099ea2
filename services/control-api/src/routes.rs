//! Route table of the operator API.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::manager::AgentManager;

pub fn create_router(manager: Arc<AgentManager>) -> Router {
    Router::new()
        .route("/api/status", get(handlers::status))
        .route("/api/start_infrastructure", post(handlers::start_infrastructure))
        .route("/api/add_agent", post(handlers::add_agent))
        .route("/api/get_algorithm", get(handlers::get_algorithm))
        .route("/api/set_algorithm", post(handlers::set_algorithm))
        .route("/api/start_federation", post(handlers::start_federation))
        .route("/api/stop_federation", post(handlers::stop_federation))
        .route("/api/reset_system", post(handlers::reset_system))
        // Results
        .route("/api/metrics/:algorithm", get(handlers::metrics))
        .route("/api/analytics/status", get(handlers::analytics_status))
        .route("/metrics", get(handlers::prometheus_metrics))
        .with_state(manager)
}
