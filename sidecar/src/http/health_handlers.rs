use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use super::state::AppState;

#[derive(Serialize)]
struct HealthBody {
    healthy: bool,
    components: Vec<String>,
}

pub async fn liveness(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.health.get_status();
    let body = HealthBody {
        healthy: status.healthy,
        components: status.components.keys().cloned().collect(),
    };
    let code = if status.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(body))
}

pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    liveness(State(state)).await
}
