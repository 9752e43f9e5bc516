pub mod async_handlers;
pub mod error;
pub mod health_handlers;
pub mod replay_handlers;
pub mod state;

use axum::routing::{get, post};
use axum::Router;

pub use state::AppState;

pub fn router(app_state: AppState) -> Router {
    let async_routes = Router::new()
        .route("/submit", post(async_handlers::submit))
        .route("/status/:job_id", get(async_handlers::status))
        .route("/result/:job_id", get(async_handlers::result))
        .route("/cancel/:job_id", post(async_handlers::cancel))
        .route("/queue", get(async_handlers::queue))
        .route("/state", get(async_handlers::state_endpoint))
        .route("/metrics", get(async_handlers::metrics))
        .route("/aggressive/report", get(async_handlers::aggressive_report))
        .route("/review/:job_id", get(async_handlers::review));

    let replay_routes = Router::new()
        .route("/run", post(replay_handlers::run))
        .route("/report/:replay_id", get(replay_handlers::report));

    Router::new()
        .nest("/api/async", async_routes)
        .nest("/api/replay", replay_routes)
        .route("/_liveness", get(health_handlers::liveness))
        .route("/_readiness", get(health_handlers::readiness))
        .with_state(app_state)
}
