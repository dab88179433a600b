use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::config::model::PortRange;
use crate::ports::PortInfo;
use crate::supervisor::{ConflictReport, SupervisorError};

use super::{ApiError, ApiState};

/// Widest range one port map request may scan.
const MAX_PORT_MAP_SPAN: u32 = 4096;

#[derive(Debug, Deserialize)]
pub struct PortMapQuery {
    pub start: Option<u16>,
    pub end: Option<u16>,
}

pub async fn port_map(
    State(state): State<ApiState>,
    Query(query): Query<PortMapQuery>,
) -> Result<Json<Vec<PortInfo>>, ApiError> {
    let default = state.supervisor.ports().default_range();
    let start = query.start.unwrap_or(default.start());
    let end = query.end.unwrap_or(default.end());
    if start > end {
        return Err(ApiError(SupervisorError::Invalid(format!(
            "invalid port range {}-{}",
            start, end
        ))));
    }
    if u32::from(end - start) + 1 > MAX_PORT_MAP_SPAN {
        return Err(ApiError(SupervisorError::Invalid(format!(
            "port range {}-{} spans more than {} ports",
            start, end, MAX_PORT_MAP_SPAN
        ))));
    }
    Ok(Json(state.supervisor.port_map(Some(PortRange(start, end)))?))
}

#[derive(Debug, Serialize)]
pub struct NextPortResponse {
    pub port: u16,
}

pub async fn next_port(State(state): State<ApiState>) -> Result<Json<NextPortResponse>, ApiError> {
    let port = state.supervisor.next_port()?;
    Ok(Json(NextPortResponse { port }))
}

pub async fn resolve_conflicts(
    State(state): State<ApiState>,
) -> Result<Json<ConflictReport>, ApiError> {
    Ok(Json(
        state
            .supervisor
            .resolve_port_conflicts_and_restart_affected()
            .await?,
    ))
}
