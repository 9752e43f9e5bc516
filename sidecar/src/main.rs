use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;

use sidecar_core::facade::ControlPlaneFacade;
use sidecar_core::health::HealthRegistry;
use sidecar_core::metrics::MetricsStore;
use sidecar_core::queue::manager::AsyncQueueManager;
use sidecar_core::replay::ReplayHarness;
use sidecar_core::upstream::ChatClient;

mod config;
mod http;
mod metrics_http;
mod upstream_client;

use config::Config;
use upstream_client::ReqwestChatClient;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let liveness = HealthRegistry::new("liveness");
    let queue_liveness = liveness
        .register("queue".to_string(), time::Duration::seconds(60))
        .await;

    let client: Arc<dyn ChatClient> = Arc::new(ReqwestChatClient::new(
        config.upstream_base_url.clone(),
        config.upstream_request_timeout.0,
    ));

    let metrics = Arc::new(MetricsStore::with_sample_cap(config.metrics_sample_cap));
    let queue = AsyncQueueManager::new(config.queue_config(), client.clone(), metrics);

    let reports_dir = config.replay_reports_dir.clone().map(PathBuf::from);
    let replay = ReplayHarness::new(queue.clone(), reports_dir);

    let facade = Arc::new(ControlPlaneFacade::new(client, queue, replay));

    tokio::spawn(async move {
        loop {
            queue_liveness.report_healthy().await;
            tokio::time::sleep(StdDuration::from_secs(20)).await;
        }
    });

    let app_state = http::AppState {
        facade,
        health: liveness,
    };

    let app = http::router(app_state);
    let app = metrics_http::add_metrics_routes(app);

    let bind = config.bind();
    tracing::info!(bind = %bind, "starting sidecar http server");
    listen(app, bind).await
}
