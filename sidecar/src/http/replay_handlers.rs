use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use sidecar_core::error::{build_api_error, job_not_found};
use sidecar_core::replay::ReplayRequest;

use super::error::ApiErrorResponse;
use super::state::AppState;

pub async fn run(
    State(state): State<AppState>,
    Json(body): Json<ReplayRequest>,
) -> Result<impl IntoResponse, ApiErrorResponse> {
    let report = state
        .facade
        .run_replay(body)
        .await
        .map_err(|e| build_api_error(&e, None))?;
    Ok((StatusCode::OK, Json(report)))
}

pub async fn report(
    State(state): State<AppState>,
    Path(replay_id): Path<String>,
) -> Result<impl IntoResponse, ApiErrorResponse> {
    match state.facade.get_replay_report(&replay_id).await {
        Some(report) => Ok((StatusCode::OK, Json(report))),
        None => Err(build_api_error(&job_not_found(&replay_id), None).into()),
    }
}
