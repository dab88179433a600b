pub mod health;
pub mod ports;
pub mod services;
pub mod summary;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::supervisor::{Supervisor, SupervisorError};

#[derive(Clone)]
pub struct ApiState {
    pub supervisor: Arc<Supervisor>,
}

pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health::controller))
        .route("/api/summary", get(summary::summary))
        .route(
            "/api/services",
            get(services::list_services).post(services::register_service),
        )
        .route(
            "/api/services/{id}",
            get(services::get_service)
                .patch(services::update_service)
                .delete(services::delete_service),
        )
        .route("/api/services/{id}/start", post(services::start_service))
        .route("/api/services/{id}/stop", post(services::stop_service))
        .route("/api/services/{id}/restart", post(services::restart_service))
        .route("/api/services/{id}/logs", get(services::service_logs))
        .route("/api/services/{id}/health", get(health::service))
        .route("/api/ports/map", get(ports::port_map))
        .route("/api/ports/next", get(ports::next_port))
        .route("/api/ports/resolve-conflicts", post(ports::resolve_conflicts))
        .with_state(state)
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A supervisor failure rendered as JSON with the error message verbatim.
pub struct ApiError(pub SupervisorError);

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status_of(error: &SupervisorError) -> StatusCode {
        match error {
            SupervisorError::NotFound(_) => StatusCode::NOT_FOUND,
            SupervisorError::Invalid(_) | SupervisorError::Launch(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            SupervisorError::Port(crate::ports::PortError::NoPortAvailable { .. }) => {
                StatusCode::CONFLICT
            }
            SupervisorError::Registry(crate::registry::RegistryError::Duplicate(_)) => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = Self::status_of(&self.0);
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}
