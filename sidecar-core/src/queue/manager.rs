//! The queue manager: lanes, admission control, dispatch, retry timer,
//! cooldown gate, cancel semantics, and waiters. The scheduler core of the
//! whole control plane.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{info, warn};

use crate::envelope::{
    build_envelope, AggressiveRequest, EnvelopeInput, JobEnvelope, Priority, RequestMeta, Timings,
    UpstreamSuccess,
};
use crate::error::{
    classify_upstream_error, internal_error, invalid_request, job_cancelled, queue_backpressure,
    ClassifiedError, UpstreamErrorInfo,
};
use crate::metrics::MetricsStore;
use crate::state::Signals;
use crate::upstream::ChatClient;

use super::config::QueueConfig;
use super::job::{JobRecord, JobStatus, Lanes};

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub payload: Value,
    pub priority: Option<String>,
    pub aggressive_enabled: bool,
    pub fallback_reason: Option<String>,
    pub confidence_before: Option<f64>,
    pub dom_anchor: Option<String>,
    pub screenshot_region: Option<String>,
    pub reasoning_note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResult {
    pub job_id: String,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusSnapshot {
    pub job_id: String,
    pub status: String,
    pub attempts: i32,
    pub queued_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum CancelOutcome {
    NotFound,
    AlreadyFinal,
    RunningCancelRequested,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct DepthByPriority {
    pub interactive: usize,
    pub retry: usize,
    pub batch: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Depth {
    pub total: usize,
    pub by_priority: DepthByPriority,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub max_in_flight: usize,
    pub max_queue_depth: usize,
    pub running: usize,
    pub depth: Depth,
    pub signals: SignalsSnapshot,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SignalsSnapshot {
    pub auth_required_until: i64,
    pub challenge_until: i64,
    pub rate_limited_until: i64,
    pub degraded_until: i64,
}

enum DispatchOutcome {
    Completed(Value),
    Failed(UpstreamErrorInfo),
    Aborted,
}

struct QueueState {
    lanes: Lanes,
    jobs: HashMap<String, JobRecord>,
    running: HashSet<String>,
    results: HashMap<String, JobEnvelope>,
    signals: Signals,
}

pub struct AsyncQueueManager {
    config: QueueConfig,
    client: Arc<dyn ChatClient>,
    metrics: Arc<MetricsStore>,
    state: Mutex<QueueState>,
    notify: Notify,
    seq: AtomicU64,
}

impl AsyncQueueManager {
    pub fn new(config: QueueConfig, client: Arc<dyn ChatClient>, metrics: Arc<MetricsStore>) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            client,
            metrics,
            state: Mutex::new(QueueState {
                lanes: Lanes::default(),
                jobs: HashMap::new(),
                running: HashSet::new(),
                results: HashMap::new(),
                signals: Signals::default(),
            }),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        });
        let loop_handle = manager.clone();
        tokio::spawn(async move { loop_handle.run_dispatch_loop().await });
        manager
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    fn next_job_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("job-{}-{}", now_ms(), seq)
    }

    fn parse_priority(raw: Option<&str>) -> Priority {
        match raw {
            Some("interactive") => Priority::Interactive,
            Some("retry") => Priority::Retry,
            Some("batch") => Priority::Batch,
            _ => Priority::Batch,
        }
    }

    fn validate_payload(payload: &Value) -> Result<(), ClassifiedError> {
        let obj = payload
            .as_object()
            .ok_or_else(|| invalid_request("payload must be a JSON object"))?;
        let has_model = obj.get("model").is_some_and(Value::is_string);
        if !has_model {
            return Err(invalid_request("payload.model is required and must be a string"));
        }
        let has_messages = obj.get("messages").is_some_and(Value::is_array);
        if !has_messages {
            return Err(invalid_request("payload.messages is required and must be an array"));
        }
        Ok(())
    }

    pub async fn submit(self: &Arc<Self>, req: SubmitRequest) -> Result<SubmitResult, ClassifiedError> {
        let job_id = self.submit_internal(req, None).await?;
        Ok(SubmitResult {
            job_id,
            status: "queued",
        })
    }

    pub async fn run_inline(
        self: &Arc<Self>,
        req: SubmitRequest,
        timeout_ms: u64,
    ) -> Result<JobEnvelope, ClassifiedError> {
        let (tx, rx) = oneshot::channel();
        self.submit_internal(req, Some(tx)).await?;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(internal_error("job was dropped before completion")),
            Err(_) => Err(classify_upstream_error(&UpstreamErrorInfo {
                status: None,
                code: None,
                message: "inline run timed out waiting for job completion".to_owned(),
                is_timeout: true,
            })),
        }
    }

    async fn submit_internal(
        self: &Arc<Self>,
        req: SubmitRequest,
        waiter: Option<oneshot::Sender<JobEnvelope>>,
    ) -> Result<String, ClassifiedError> {
        Self::validate_payload(&req.payload)?;

        let mut state = self.state.lock().await;
        if state.running.len() + state.lanes.len() >= self.config.max_queue_depth {
            return Err(queue_backpressure());
        }

        let job_id = self.next_job_id();
        let priority = Self::parse_priority(req.priority.as_deref());
        let now = now_ms();

        let request_meta = RequestMeta {
            model: req
                .payload
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            priority: priority.clone(),
            aggressive: AggressiveRequest {
                enabled: req.aggressive_enabled,
                fallback_reason: req.fallback_reason.clone(),
            },
            confidence_before: req.confidence_before,
            dom_anchor: req.dom_anchor,
            screenshot_region: req.screenshot_region,
            reasoning_note: req.reasoning_note,
        };

        let mut record = JobRecord {
            job_id: job_id.clone(),
            payload: req.payload,
            status: JobStatus::Queued,
            attempts: 0,
            queued_at: now,
            started_at: None,
            completed_at: None,
            cancel_requested: false,
            request_meta,
            waiters: Vec::new(),
            abort: None,
        };
        if let Some(tx) = waiter {
            record.waiters.push(tx);
        }

        state.lanes.push(&priority, job_id.clone());
        state.jobs.insert(job_id.clone(), record);
        drop(state);

        self.metrics
            .record_submitted(req.aggressive_enabled, req.fallback_reason.as_deref());

        info!(job_id = %job_id, priority = ?priority, "job admitted");
        self.notify.notify_one();

        Ok(job_id)
    }

    pub async fn status(&self, job_id: &str) -> Option<JobStatusSnapshot> {
        let state = self.state.lock().await;
        if let Some(job) = state.jobs.get(job_id) {
            return Some(JobStatusSnapshot {
                job_id: job.job_id.clone(),
                status: job.status.as_str().to_owned(),
                attempts: job.attempts,
                queued_at: job.queued_at,
                started_at: job.started_at,
                completed_at: job.completed_at,
            });
        }
        state.results.get(job_id).map(|envelope| JobStatusSnapshot {
            job_id: envelope.job_id.clone(),
            status: envelope.status.clone(),
            attempts: envelope.result.diagnostics.attempts,
            queued_at: envelope.timings.queued_at.unwrap_or_default(),
            started_at: envelope.timings.started_at,
            completed_at: envelope.timings.completed_at,
        })
    }

    pub async fn result(&self, job_id: &str) -> Option<JobEnvelope> {
        let state = self.state.lock().await;
        state.results.get(job_id).cloned()
    }

    pub async fn is_active(&self, job_id: &str) -> bool {
        let state = self.state.lock().await;
        state.jobs.contains_key(job_id)
    }

    pub async fn cancel(self: &Arc<Self>, job_id: &str) -> CancelOutcome {
        let now = now_ms();
        let mut state = self.state.lock().await;
        let status = state.jobs.get(job_id).map(|j| j.status);

        match status {
            None => {
                if state.results.contains_key(job_id) {
                    CancelOutcome::AlreadyFinal
                } else {
                    CancelOutcome::NotFound
                }
            }
            Some(JobStatus::Running) => {
                let job = state.jobs.get_mut(job_id).unwrap();
                job.cancel_requested = true;
                if let Some(abort) = job.abort.clone() {
                    abort.notify_one();
                }
                CancelOutcome::RunningCancelRequested
            }
            Some(JobStatus::Queued) | Some(JobStatus::Retrying) => {
                state.lanes.remove(job_id);
                let mut job = state.jobs.remove(job_id).unwrap();
                let envelope = build_envelope(EnvelopeInput {
                    job_id,
                    status: "cancelled",
                    request_meta: &job.request_meta,
                    success: None,
                    error: Some(&job_cancelled()),
                    timings: Timings {
                        queued_at: Some(job.queued_at),
                        started_at: job.started_at,
                        completed_at: Some(now),
                    },
                    attempts: job.attempts,
                });
                let waiters = job.take_waiters();
                state.results.insert(job_id.to_owned(), envelope.clone());
                drop(state);
                for tx in waiters {
                    let _ = tx.send(envelope.clone());
                }
                CancelOutcome::Cancelled
            }
            Some(JobStatus::Completed) | Some(JobStatus::Failed) | Some(JobStatus::Cancelled) => {
                // Active map never holds terminal jobs; unreachable in practice.
                CancelOutcome::AlreadyFinal
            }
        }
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        let (interactive, retry, batch) = state.lanes.depth_by_priority();
        QueueSnapshot {
            max_in_flight: self.config.max_in_flight,
            max_queue_depth: self.config.max_queue_depth,
            running: state.running.len(),
            depth: Depth {
                total: state.lanes.len() + state.running.len(),
                by_priority: DepthByPriority {
                    interactive,
                    retry,
                    batch,
                },
            },
            signals: SignalsSnapshot {
                auth_required_until: state.signals.auth_required_until,
                challenge_until: state.signals.challenge_until,
                rate_limited_until: state.signals.rate_limited_until,
                degraded_until: state.signals.degraded_until,
            },
        }
    }

    pub async fn signals(&self) -> Signals {
        self.state.lock().await.signals
    }

    pub async fn queue_depth(&self) -> usize {
        let state = self.state.lock().await;
        state.lanes.len() + state.running.len()
    }

    async fn run_dispatch_loop(self: Arc<Self>) {
        loop {
            self.notify.notified().await;
            self.drain().await;
        }
    }

    /// Coalesced dispatch tick: while capacity and the cooldown gate allow
    /// it, start as many jobs as `max_in_flight` permits. If the gate is in
    /// the future, reschedule a single wake-up at the gate deadline (50ms
    /// floor) instead of spinning.
    async fn drain(self: &Arc<Self>) {
        loop {
            let now = now_ms();
            let mut state = self.state.lock().await;
            let gate = state.signals.gate();
            if gate > now {
                drop(state);
                let wait_ms = (gate - now).max(50) as u64;
                let weak = Arc::downgrade(self);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                    if let Some(mgr) = weak.upgrade() {
                        mgr.notify.notify_one();
                    }
                });
                return;
            }

            if state.running.len() >= self.config.max_in_flight {
                return;
            }

            let mut next_job_id = None;
            while let Some(candidate) = state.lanes.pop_next() {
                match state.jobs.get(&candidate) {
                    Some(job) if !job.status.is_terminal() => {
                        next_job_id = Some(candidate);
                        break;
                    }
                    _ => continue, // defensive: already finalized, drop from consideration
                }
            }
            let Some(job_id) = next_job_id else {
                return;
            };

            let abort = Arc::new(Notify::new());
            let payload = {
                let job = state.jobs.get_mut(&job_id).unwrap();
                job.status = JobStatus::Running;
                job.started_at = Some(now);
                job.attempts += 1;
                job.abort = Some(abort.clone());
                job.payload.clone()
            };
            state.running.insert(job_id.clone());
            drop(state);

            let manager = self.clone();
            tokio::spawn(async move {
                manager.run_job(job_id, payload, abort).await;
            });
        }
    }

    async fn run_job(self: Arc<Self>, job_id: String, payload: Value, abort: Arc<Notify>) {
        let outcome = tokio::select! {
            res = self.client.chat_completions(&payload, None) => match res {
                Ok(value) => DispatchOutcome::Completed(value),
                Err(err) => DispatchOutcome::Failed(err),
            },
            _ = abort.notified() => DispatchOutcome::Aborted,
        };
        self.handle_outcome(job_id, outcome).await;
    }

    async fn handle_outcome(self: &Arc<Self>, job_id: String, outcome: DispatchOutcome) {
        let now = now_ms();
        let mut state = self.state.lock().await;
        state.running.remove(&job_id);

        let Some(mut job) = state.jobs.remove(&job_id) else {
            return;
        };

        match outcome {
            DispatchOutcome::Aborted => {
                self.finalize(&mut state, &mut job, "cancelled", None, Some(job_cancelled()), now);
            }
            DispatchOutcome::Completed(value) => {
                let success = extract_success(&job.request_meta.model, value);
                self.finalize(&mut state, &mut job, "completed", Some(success), None, now);
            }
            DispatchOutcome::Failed(err) => {
                let classified = classify_upstream_error(&err);
                self.apply_cooldown_signal(&mut state, &classified, now);

                if job.cancel_requested {
                    self.finalize(&mut state, &mut job, "cancelled", None, Some(job_cancelled()), now);
                } else if classified.retryable && job.attempts < self.config.retry.max_attempts {
                    job.status = JobStatus::Retrying;
                    job.abort = None;
                    let delay = self.config.retry.delay_for_attempt(job.attempts);
                    let job_id_for_retry = job.job_id.clone();
                    state.jobs.insert(job_id_for_retry.clone(), job);
                    drop(state);

                    warn!(job_id = %job_id_for_retry, delay_ms = delay, "scheduling retry");
                    let manager = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                        manager.requeue_after_retry(job_id_for_retry).await;
                    });
                    return;
                } else {
                    self.finalize(&mut state, &mut job, "failed", None, Some(classified), now);
                }
            }
        }
    }

    async fn requeue_after_retry(self: Arc<Self>, job_id: String) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if job.status == JobStatus::Retrying {
                job.status = JobStatus::Queued;
                // retries always rejoin the retry lane regardless of original priority
                state.lanes.push(&Priority::Retry, job_id.clone());
            }
        }
        drop(state);
        self.notify.notify_one();
    }

    fn finalize(
        &self,
        state: &mut QueueState,
        job: &mut JobRecord,
        status: &str,
        success: Option<UpstreamSuccess>,
        error: Option<ClassifiedError>,
        now: i64,
    ) {
        job.completed_at = Some(now);
        job.status = match status {
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Cancelled,
        };

        let envelope = build_envelope(EnvelopeInput {
            job_id: &job.job_id,
            status,
            request_meta: &job.request_meta,
            success: success.as_ref(),
            error: error.as_ref(),
            timings: Timings {
                queued_at: Some(job.queued_at),
                started_at: job.started_at,
                completed_at: job.completed_at,
            },
            attempts: job.attempts,
        });

        match status {
            "completed" => {
                let diag = &envelope.result.diagnostics;
                self.metrics.record_completed(
                    &job.request_meta.model,
                    diag.latency.queue_wait_ms.unwrap_or(0) as f64,
                    diag.latency.model_ms.unwrap_or(0) as f64,
                    diag.latency.total_ms.unwrap_or(0) as f64,
                    job.request_meta.aggressive.enabled,
                    job.request_meta.aggressive.fallback_reason.as_deref(),
                    diag.aggressive.confidence_delta,
                );
            }
            "failed" => {
                let code = error
                    .as_ref()
                    .and_then(|e| serde_json::to_value(e.code).ok())
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_default();
                self.metrics.record_failed(&job.request_meta.model, &code);
            }
            _ => {}
        }

        let waiters = job.take_waiters();
        state.results.insert(job.job_id.clone(), envelope.clone());
        for tx in waiters {
            let _ = tx.send(envelope.clone());
        }
        self.notify.notify_one();
    }

    fn apply_cooldown_signal(&self, state: &mut QueueState, classified: &ClassifiedError, now: i64) {
        use crate::error::ErrorCode;
        match classified.code {
            ErrorCode::UpstreamLoginRequired => {
                state.signals.auth_required_until = now + self.config.cooldowns.auth_required_ms;
            }
            ErrorCode::UpstreamChallenge => {
                state.signals.challenge_until = now + self.config.cooldowns.challenge_ms;
            }
            ErrorCode::UpstreamRateLimited => {
                state.signals.rate_limited_until = now + self.config.cooldowns.rate_limited_ms;
            }
            ErrorCode::UpstreamUnavailable => {
                state.signals.degraded_until = now + self.config.cooldowns.degraded_ms;
            }
            _ => {}
        }
    }
}

/// Reflectively pull formatted fields out of an opaque upstream response
/// bag. The core treats the payload/response as JSON it does not own;
/// only these well-known keys are interpreted.
fn extract_success(model: &str, raw: Value) -> UpstreamSuccess {
    let assistant_text = raw
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .or_else(|| raw.get("message").and_then(Value::as_str))
        .or_else(|| raw.get("content").and_then(Value::as_str))
        .or_else(|| raw.get("text").and_then(Value::as_str))
        .map(str::to_owned);

    let parsed_json = raw
        .get("parsed_json")
        .cloned()
        .or_else(|| raw.get("parsed").cloned())
        .or_else(|| {
            assistant_text
                .as_deref()
                .and_then(|t| serde_json::from_str::<Value>(t).ok())
        });

    let render_mode = raw
        .get("render_mode")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let rendered_html = raw
        .get("rendered_html")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let model_path = raw
        .get("model_path")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| Some(model.to_owned()));

    UpstreamSuccess {
        assistant_text,
        parsed_json,
        render_mode,
        rendered_html,
        raw_response: Some(raw),
        model_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::metrics::MetricsStore;
    use crate::queue::config::{CooldownConfig, RetryConfig};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    fn request(model: &str, priority: &str) -> SubmitRequest {
        SubmitRequest {
            payload: json!({"model": model, "messages": [{"role": "user", "content": "hi"}]}),
            priority: Some(priority.to_owned()),
            aggressive_enabled: false,
            fallback_reason: None,
            confidence_before: None,
            dom_anchor: None,
            screenshot_region: None,
            reasoning_note: None,
        }
    }

    struct RecordingClient {
        started: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl ChatClient for RecordingClient {
        async fn chat_completions(
            &self,
            payload: &Value,
            _timeout: Option<Duration>,
        ) -> Result<Value, UpstreamErrorInfo> {
            let model = payload.get("model").and_then(Value::as_str).unwrap_or_default();
            self.started.lock().unwrap().push(model.to_owned());
            Ok(json!({"message": "ok"}))
        }

        async fn health(&self) -> Result<(), UpstreamErrorInfo> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn interactive_jumps_ahead_of_batch_regardless_of_submission_order() {
        let started = Arc::new(StdMutex::new(Vec::new()));
        let client = Arc::new(RecordingClient {
            started: started.clone(),
        });
        let manager = AsyncQueueManager::new(
            QueueConfig::new(1, 10, RetryConfig::default(), CooldownConfig::default()),
            client,
            Arc::new(MetricsStore::new()),
        );

        manager.submit(request("m-batch", "batch")).await.unwrap();
        manager.submit(request("m-interactive", "interactive")).await.unwrap();

        for _ in 0..100 {
            if started.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let order = started.lock().unwrap().clone();
        assert_eq!(order, vec!["m-interactive", "m-batch"]);
    }

    #[tokio::test]
    async fn backpressure_at_max_queue_depth() {
        let client = Arc::new(RecordingClient {
            started: Arc::new(StdMutex::new(Vec::new())),
        });
        let manager = AsyncQueueManager::new(
            QueueConfig::new(1, 1, RetryConfig::default(), CooldownConfig::default()),
            client,
            Arc::new(MetricsStore::new()),
        );

        manager.submit(request("m1", "batch")).await.unwrap();
        let err = manager.submit(request("m2", "batch")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::QueueBackpressure);
        assert!(err.retryable);
    }

    struct FlakyClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatClient for FlakyClient {
        async fn chat_completions(
            &self,
            _payload: &Value,
            _timeout: Option<Duration>,
        ) -> Result<Value, UpstreamErrorInfo> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Err(UpstreamErrorInfo {
                    status: None,
                    code: None,
                    message: "request timeout".to_owned(),
                    is_timeout: true,
                })
            } else {
                Ok(json!({"message": "recovered"}))
            }
        }

        async fn health(&self) -> Result<(), UpstreamErrorInfo> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn retries_transient_timeout_then_succeeds() {
        let manager = AsyncQueueManager::new(
            QueueConfig::new(
                1,
                10,
                RetryConfig::new(2, 10, 50),
                CooldownConfig::default(),
            ),
            Arc::new(FlakyClient {
                calls: AtomicUsize::new(0),
            }),
            Arc::new(MetricsStore::new()),
        );

        let submitted = manager.submit(request("m", "batch")).await.unwrap();

        let mut envelope = None;
        for _ in 0..200 {
            if let Some(result) = manager.result(&submitted.job_id).await {
                envelope = Some(result);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let envelope = envelope.expect("job should finish within the retry budget");
        assert_eq!(envelope.status, "completed");
        assert_eq!(envelope.result.diagnostics.attempts, 2);
    }

    struct NeverCalledClient;

    #[async_trait]
    impl ChatClient for NeverCalledClient {
        async fn chat_completions(
            &self,
            _payload: &Value,
            _timeout: Option<Duration>,
        ) -> Result<Value, UpstreamErrorInfo> {
            panic!("upstream must not be called for a job cancelled before dispatch");
        }

        async fn health(&self) -> Result<(), UpstreamErrorInfo> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancel_before_dispatch_short_circuits_the_upstream_call() {
        let manager = AsyncQueueManager::new(
            QueueConfig::default(),
            Arc::new(NeverCalledClient),
            Arc::new(MetricsStore::new()),
        );

        let submitted = manager.submit(request("m", "batch")).await.unwrap();
        let outcome = manager.cancel(&submitted.job_id).await;
        assert_eq!(outcome, CancelOutcome::Cancelled);

        let envelope = manager.result(&submitted.job_id).await.unwrap();
        assert_eq!(envelope.status, "cancelled");
        assert_eq!(envelope.error.unwrap().code, ErrorCode::JobCancelled);

        assert_eq!(manager.cancel(&submitted.job_id).await, CancelOutcome::AlreadyFinal);
    }

    struct SleepyClient;

    #[async_trait]
    impl ChatClient for SleepyClient {
        async fn chat_completions(
            &self,
            _payload: &Value,
            _timeout: Option<Duration>,
        ) -> Result<Value, UpstreamErrorInfo> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({"message": "too slow"}))
        }

        async fn health(&self) -> Result<(), UpstreamErrorInfo> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancel_while_running_aborts_the_upstream_call() {
        let manager = AsyncQueueManager::new(
            QueueConfig::default(),
            Arc::new(SleepyClient),
            Arc::new(MetricsStore::new()),
        );

        let submitted = manager.submit(request("m", "batch")).await.unwrap();
        // give the dispatch loop a chance to pick the job up and start the upstream call
        tokio::time::sleep(Duration::from_millis(30)).await;

        let outcome = manager.cancel(&submitted.job_id).await;
        assert_eq!(outcome, CancelOutcome::RunningCancelRequested);

        let mut envelope = None;
        for _ in 0..100 {
            if let Some(result) = manager.result(&submitted.job_id).await {
                envelope = Some(result);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let envelope = envelope.expect("cancelled job should finalize quickly");
        assert_eq!(envelope.status, "cancelled");
    }

    #[tokio::test]
    async fn queue_snapshot_reports_depth_by_priority() {
        let manager = AsyncQueueManager::new(
            QueueConfig::new(0, 10, RetryConfig::default(), CooldownConfig::default()),
            Arc::new(SleepyClient),
            Arc::new(MetricsStore::new()),
        );

        manager.submit(request("m1", "batch")).await.unwrap();
        manager.submit(request("m2", "interactive")).await.unwrap();

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.depth.by_priority.batch, 1);
        assert_eq!(snapshot.depth.by_priority.interactive, 1);
        assert_eq!(snapshot.depth.total, 2);
    }

    struct CooldownTriggerClient {
        calls: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl ChatClient for CooldownTriggerClient {
        async fn chat_completions(
            &self,
            payload: &Value,
            _timeout: Option<Duration>,
        ) -> Result<Value, UpstreamErrorInfo> {
            let model = payload.get("model").and_then(Value::as_str).unwrap_or_default().to_owned();
            self.calls.lock().unwrap().push(model.clone());
            if model == "trigger" {
                Err(UpstreamErrorInfo {
                    status: Some(401),
                    code: None,
                    message: "missing credentials".to_owned(),
                    is_timeout: false,
                })
            } else {
                Ok(json!({"message": "ok"}))
            }
        }

        async fn health(&self) -> Result<(), UpstreamErrorInfo> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn login_required_failure_advances_auth_cooldown() {
        let manager = AsyncQueueManager::new(
            QueueConfig::default(),
            Arc::new(CooldownTriggerClient {
                calls: Arc::new(StdMutex::new(Vec::new())),
            }),
            Arc::new(MetricsStore::new()),
        );

        let before = now_ms();
        let submitted = manager.submit(request("trigger", "batch")).await.unwrap();

        let mut envelope = None;
        for _ in 0..100 {
            if let Some(e) = manager.result(&submitted.job_id).await {
                envelope = Some(e);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let envelope = envelope.expect("login-required job should fail quickly, not retry");
        assert_eq!(envelope.status, "failed");
        assert_eq!(envelope.error.unwrap().code, ErrorCode::UpstreamLoginRequired);

        let signals = manager.signals().await;
        assert!(signals.auth_required_until >= before + 300_000);
    }

    #[tokio::test]
    async fn active_cooldown_blocks_every_lane_until_the_gate_clears() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let manager = AsyncQueueManager::new(
            QueueConfig::new(
                1,
                10,
                RetryConfig::default(),
                CooldownConfig::new(1_000, 1_000, 1_000, 1_000),
            ),
            Arc::new(CooldownTriggerClient { calls: calls.clone() }),
            Arc::new(MetricsStore::new()),
        );

        let trigger = manager.submit(request("trigger", "batch")).await.unwrap();
        let mut trigger_envelope = None;
        for _ in 0..100 {
            if let Some(e) = manager.result(&trigger.job_id).await {
                trigger_envelope = Some(e);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let trigger_envelope = trigger_envelope.expect("trigger job should fail quickly");
        assert_eq!(trigger_envelope.status, "failed");

        let gate = manager.signals().await.gate();
        assert!(gate > now_ms(), "cooldown gate should be active after a login-required failure");

        let gated = manager.submit(request("gated", "interactive")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            calls.lock().unwrap().len(),
            1,
            "interactive job must not dispatch while the cooldown gate is active"
        );
        assert_eq!(manager.status(&gated.job_id).await.unwrap().status, "queued");

        let mut gated_envelope = None;
        for _ in 0..200 {
            if let Some(e) = manager.result(&gated.job_id).await {
                gated_envelope = Some(e);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let gated_envelope = gated_envelope.expect("gated job should complete once the cooldown gate clears");
        assert_eq!(gated_envelope.status, "completed");
    }
}
