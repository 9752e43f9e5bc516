//! Control plane facade: composes the error classifier, metrics
//! store, envelope builder, state resolver, queue manager, and replay
//! harness into the single surface the HTTP layer calls through.

use std::sync::Arc;

use serde::Serialize;

use crate::envelope::{build_review_payload, JobEnvelope, ReviewPayload};
use crate::error::ClassifiedError;
use crate::metrics::{AggressiveReport, MetricsSnapshot};
use crate::queue::manager::{
    AsyncQueueManager, CancelOutcome, JobStatusSnapshot, QueueSnapshot, SubmitRequest, SubmitResult,
};
use crate::replay::{DriftAlert, ReplayHarness, ReplayReport, ReplayRequest};
use crate::state::{resolve_state, OperationalState, StateInput, StateResolution};
use crate::upstream::ChatClient;

#[derive(Debug, Clone, Serialize)]
pub struct SubmitLinks {
    pub status: String,
    pub result: String,
    pub cancel: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: &'static str,
    pub links: SubmitLinks,
}

pub enum ResultLookup {
    Ready(JobEnvelope),
    Pending(JobStatusSnapshot),
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub ok: bool,
    pub job_id: String,
    pub status: &'static str,
    pub running: bool,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub queue: QueueSnapshot,
    pub metrics: MetricsSnapshot,
    pub replay_drift_alerts: Vec<DriftAlert>,
}

#[derive(Debug, Serialize)]
pub struct AggressiveReportResponse {
    pub aggressive: AggressiveReport,
}

pub struct ControlPlaneFacade {
    client: Arc<dyn ChatClient>,
    queue: Arc<AsyncQueueManager>,
    replay: ReplayHarness,
}

impl ControlPlaneFacade {
    pub fn new(client: Arc<dyn ChatClient>, queue: Arc<AsyncQueueManager>, replay: ReplayHarness) -> Self {
        Self { client, queue, replay }
    }

    pub fn queue(&self) -> &Arc<AsyncQueueManager> {
        &self.queue
    }

    pub async fn submit(&self, req: SubmitRequest) -> Result<SubmitResponse, ClassifiedError> {
        let SubmitResult { job_id, status } = self.queue.submit(req).await?;
        Ok(SubmitResponse {
            links: SubmitLinks {
                status: format!("/api/async/status/{job_id}"),
                result: format!("/api/async/result/{job_id}"),
                cancel: format!("/api/async/cancel/{job_id}"),
            },
            job_id,
            status,
        })
    }

    pub async fn get_status(&self, job_id: &str) -> Option<JobStatusSnapshot> {
        self.queue.status(job_id).await
    }

    pub async fn get_result(&self, job_id: &str) -> ResultLookup {
        if let Some(envelope) = self.queue.result(job_id).await {
            return ResultLookup::Ready(envelope);
        }
        match self.queue.status(job_id).await {
            Some(snapshot) => ResultLookup::Pending(snapshot),
            None => ResultLookup::NotFound,
        }
    }

    pub async fn cancel(&self, job_id: &str) -> Option<CancelResponse> {
        let outcome = self.queue.cancel(job_id).await;
        match outcome {
            CancelOutcome::NotFound => None,
            CancelOutcome::AlreadyFinal => Some(CancelResponse {
                ok: false,
                job_id: job_id.to_owned(),
                status: "already_final",
                running: false,
            }),
            CancelOutcome::RunningCancelRequested => Some(CancelResponse {
                ok: true,
                job_id: job_id.to_owned(),
                status: "cancel_requested",
                running: true,
            }),
            CancelOutcome::Cancelled => Some(CancelResponse {
                ok: true,
                job_id: job_id.to_owned(),
                status: "cancelled",
                running: false,
            }),
        }
    }

    pub async fn get_queue_snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot().await
    }

    pub async fn get_state(&self) -> StateResolution {
        let connectivity_ok = self.client.health().await.is_ok();
        let signals = self.queue.signals().await;
        let queue_depth = self.queue.queue_depth().await;
        let error_rate = self.queue.metrics().error_rate();
        resolve_state(&StateInput {
            now: crate::queue::manager::now_ms(),
            connectivity_ok,
            signals,
            queue_depth,
            error_rate,
        })
    }

    pub async fn get_metrics(&self) -> MetricsResponse {
        MetricsResponse {
            queue: self.queue.snapshot().await,
            metrics: self.queue.metrics().snapshot(),
            replay_drift_alerts: self.replay.drift_alerts().await,
        }
    }

    pub fn get_aggressive_report(&self) -> AggressiveReportResponse {
        AggressiveReportResponse {
            aggressive: self.queue.metrics().aggressive_report(),
        }
    }

    pub async fn get_review_payload(&self, job_id: &str) -> Option<ReviewPayload> {
        let envelope = self.queue.result(job_id).await?;
        Some(build_review_payload(&envelope))
    }

    pub async fn run_replay(&self, req: ReplayRequest) -> Result<ReplayReport, ClassifiedError> {
        self.replay.run(req).await
    }

    pub async fn get_replay_report(&self, replay_id: &str) -> Option<ReplayReport> {
        self.replay.get_report(replay_id).await
    }
}

/// Whether the resolved operational state still accepts new submissions
/// (the resolver never blocks admission outright; this is advisory for
/// clients, not enforced by the queue).
pub fn state_is_ready(resolution: &StateResolution) -> bool {
    resolution.state == OperationalState::Ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamErrorInfo;
    use crate::metrics::MetricsStore;
    use crate::queue::config::QueueConfig;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct AlwaysHealthyClient;

    #[async_trait]
    impl ChatClient for AlwaysHealthyClient {
        async fn chat_completions(
            &self,
            _payload: &Value,
            _timeout: Option<Duration>,
        ) -> Result<Value, UpstreamErrorInfo> {
            Ok(json!({"message": "ok"}))
        }

        async fn health(&self) -> Result<(), UpstreamErrorInfo> {
            Ok(())
        }
    }

    fn facade() -> ControlPlaneFacade {
        let client: Arc<dyn ChatClient> = Arc::new(AlwaysHealthyClient);
        let queue = AsyncQueueManager::new(
            QueueConfig::default(),
            client.clone(),
            Arc::new(MetricsStore::new()),
        );
        let replay = ReplayHarness::new(queue.clone(), None);
        ControlPlaneFacade::new(client, queue, replay)
    }

    #[tokio::test]
    async fn submit_and_await_result() {
        let facade = facade();
        let response = facade
            .submit(SubmitRequest {
                payload: json!({"model": "gpt-5", "messages": []}),
                priority: Some("interactive".to_owned()),
                aggressive_enabled: false,
                fallback_reason: None,
                confidence_before: None,
                dom_anchor: None,
                screenshot_region: None,
                reasoning_note: None,
            })
            .await
            .unwrap();
        assert_eq!(response.status, "queued");

        for _ in 0..50 {
            if let ResultLookup::Ready(envelope) = facade.get_result(&response.job_id).await {
                assert_eq!(envelope.status, "completed");
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job never completed");
    }

    #[tokio::test]
    async fn unknown_job_result_is_not_found() {
        let facade = facade();
        assert!(matches!(
            facade.get_result("job-does-not-exist").await,
            ResultLookup::NotFound
        ));
        assert!(facade.cancel("job-does-not-exist").await.is_none());
    }

    #[tokio::test]
    async fn state_is_ready_when_nothing_degraded() {
        let facade = facade();
        let resolution = facade.get_state().await;
        assert!(state_is_ready(&resolution));
    }
}
