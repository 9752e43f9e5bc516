//! `/api/async/*` handlers: one handler per route, each a thin
//! JSON<->facade adapter.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use sidecar_core::error::{build_api_error, job_not_found};
use sidecar_core::facade::ResultLookup;
use sidecar_core::queue::manager::SubmitRequest;

use super::error::ApiErrorResponse;
use super::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggressiveBody {
    enabled: bool,
    #[serde(default)]
    fallback_reason: Option<String>,
    #[serde(default)]
    confidence_before: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody {
    payload: Value,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    aggressive: Option<AggressiveBody>,
    #[serde(default)]
    dom_anchor: Option<String>,
    #[serde(default)]
    screenshot_region: Option<String>,
    #[serde(default)]
    reasoning_note: Option<String>,
}

impl From<SubmitBody> for SubmitRequest {
    fn from(body: SubmitBody) -> Self {
        let (aggressive_enabled, fallback_reason, confidence_before) = match body.aggressive {
            Some(a) => (a.enabled, a.fallback_reason, a.confidence_before),
            None => (false, None, None),
        };
        SubmitRequest {
            payload: body.payload,
            priority: body.priority,
            aggressive_enabled,
            fallback_reason,
            confidence_before,
            dom_anchor: body.dom_anchor,
            screenshot_region: body.screenshot_region,
            reasoning_note: body.reasoning_note,
        }
    }
}

pub async fn submit(
    State(state): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> Result<impl IntoResponse, ApiErrorResponse> {
    let response = state
        .facade
        .submit(body.into())
        .await
        .map_err(|e| build_api_error(&e, None))?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiErrorResponse> {
    match state.facade.get_status(&job_id).await {
        Some(snapshot) => Ok((StatusCode::OK, Json(snapshot))),
        None => Err(build_api_error(&job_not_found(&job_id), None).into()),
    }
}

pub async fn result(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiErrorResponse> {
    match state.facade.get_result(&job_id).await {
        ResultLookup::Ready(envelope) => Ok((StatusCode::OK, Json(envelope)).into_response()),
        ResultLookup::Pending(snapshot) => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"job_id": snapshot.job_id, "status": snapshot.status})),
        )
            .into_response()),
        ResultLookup::NotFound => Err(build_api_error(&job_not_found(&job_id), None).into()),
    }
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiErrorResponse> {
    match state.facade.cancel(&job_id).await {
        Some(response) => Ok((StatusCode::OK, Json(response))),
        None => Err(build_api_error(&job_not_found(&job_id), None).into()),
    }
}

pub async fn queue(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.facade.get_queue_snapshot().await)
}

pub async fn state_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.facade.get_state().await)
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.facade.get_metrics().await)
}

pub async fn aggressive_report(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.facade.get_aggressive_report())
}

pub async fn review(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiErrorResponse> {
    match state.facade.get_review_payload(&job_id).await {
        Some(payload) => Ok((StatusCode::OK, Json(payload))),
        None => Err(build_api_error(&job_not_found(&job_id), None).into()),
    }
}
