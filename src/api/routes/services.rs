use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::logs::LogEntry;
use crate::registry::{NewService, Service, ServiceStatus, ServiceUpdate};
use crate::supervisor::{StatusReport, SupervisorError};

use super::{ApiError, ApiState};

const DEFAULT_LOG_LINES: usize = 200;
const MAX_LOG_LINES: usize = 2000;

pub async fn list_services(State(state): State<ApiState>) -> Result<Json<Vec<Service>>, ApiError> {
    Ok(Json(state.supervisor.list().await?))
}

pub async fn get_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Service>, ApiError> {
    Ok(Json(state.supervisor.get(&id).await?))
}

pub async fn register_service(
    State(state): State<ApiState>,
    Json(new): Json<NewService>,
) -> Result<(StatusCode, Json<Service>), ApiError> {
    let svc = state.supervisor.register(new)?;
    Ok((StatusCode::CREATED, Json(svc)))
}

pub async fn update_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(patch): Json<ServiceUpdate>,
) -> Result<Json<Service>, ApiError> {
    Ok(Json(state.supervisor.update(&id, patch).await?))
}

pub async fn delete_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Service>, ApiError> {
    Ok(Json(state.supervisor.delete(&id).await?))
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub ok: bool,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn action_response(state: &ApiState, id: &str, result: Result<StatusReport, SupervisorError>) -> Response {
    match result {
        Ok(report) => Json(ActionResponse {
            ok: true,
            status: report.status,
            pid: report.pid,
            port: report.port,
            error: None,
        })
        .into_response(),
        Err(e @ SupervisorError::NotFound(_)) => ApiError(e).into_response(),
        Err(e) => {
            let code = ApiError::status_of(&e);
            let stored = state.supervisor.registry().get(id).ok();
            (
                code,
                Json(ActionResponse {
                    ok: false,
                    status: stored.as_ref().map_or(ServiceStatus::Error, |s| s.status),
                    pid: stored.as_ref().and_then(|s| s.process_pid),
                    port: stored.as_ref().and_then(|s| s.port),
                    error: Some(e.to_string()),
                }),
            )
                .into_response()
        }
    }
}

pub async fn start_service(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let result = state.supervisor.start(&id).await;
    action_response(&state, &id, result)
}

pub async fn stop_service(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let result = state.supervisor.stop(&id).await;
    action_response(&state, &id, result)
}

pub async fn restart_service(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let result = state.supervisor.restart(&id).await;
    action_response(&state, &id, result)
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
    /// Also return each line parsed into timestamp, stream and level.
    #[serde(default)]
    pub parsed: bool,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub id: String,
    pub lines: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<LogEntry>>,
}

pub async fn service_logs(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let n = query.lines.unwrap_or(DEFAULT_LOG_LINES).min(MAX_LOG_LINES);
    let lines = state.supervisor.tail_logs(&id, n)?;
    let entries = query
        .parsed
        .then(|| lines.iter().map(|l| LogEntry::parse(l)).collect());
    Ok(Json(LogsResponse { id, lines, entries }))
}
