use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use fl_core::FlError;
use thiserror::Error;
use tracing::error;

use crate::models::ErrorBody;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("all {0} worker partitions are already assigned")]
    WorkersFull(usize),
    #[error("aggregator agent not started; call /api/start_infrastructure first")]
    NoAggregator,
    #[error(transparent)]
    Core(#[from] FlError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::WorkersFull(_) | ApiError::NoAggregator => StatusCode::CONFLICT,
            ApiError::Core(FlError::UnknownAlgorithm(_)) => StatusCode::BAD_REQUEST,
            ApiError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error=%self, "request_failed");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}
