use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::health::{self, ControllerHealth, ServiceHealth};

use super::{ApiError, ApiState};

pub async fn controller(State(state): State<ApiState>) -> (StatusCode, Json<ControllerHealth>) {
    let report = health::controller_health(&state.supervisor);
    let code = if report.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

pub async fn service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceHealth>, ApiError> {
    let svc = state.supervisor.get(&id).await?;
    let host = state.supervisor.ports().host().to_string();
    Ok(Json(health::probe_service(&svc, &host).await))
}
