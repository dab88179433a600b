use axum::extract::State;
use axum::Json;

use crate::supervisor::Summary;

use super::{ApiError, ApiState};

pub async fn summary(State(state): State<ApiState>) -> Result<Json<Summary>, ApiError> {
    Ok(Json(state.supervisor.summary().await?))
}
