//! Replay harness: runs a baseline vs candidate model over a set of
//! cases via the Queue Manager's inline-run path, scores field-level
//! accuracy, and raises drift alerts against the last report stored under
//! the same replay name.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::envelope::JobEnvelope;
use crate::error::{invalid_request, ClassifiedError};
use crate::queue::manager::{now_ms, AsyncQueueManager, SubmitRequest};

const INLINE_RUN_TIMEOUT_MS: u64 = 900_000;
const DRIFT_THRESHOLD: f64 = -0.05;

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayCase {
    pub id: String,
    pub payload: Value,
    #[serde(default)]
    pub expected: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRequest {
    pub replay_name: Option<String>,
    pub baseline_model: Option<String>,
    pub candidate_model: Option<String>,
    pub cases: Option<Vec<ReplayCase>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldResult {
    pub expected: Value,
    pub baseline_value: Option<Value>,
    pub baseline_match: bool,
    pub candidate_value: Option<Value>,
    pub candidate_match: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub id: String,
    pub baseline_accuracy: f64,
    pub candidate_accuracy: f64,
    pub field_results: HashMap<String, FieldResult>,
    pub baseline_error: Option<ClassifiedError>,
    pub candidate_error: Option<ClassifiedError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftAlert {
    #[serde(rename = "type")]
    pub alert_type: String,
    pub level: String,
    pub message: String,
    pub previous_accuracy: f64,
    pub candidate_accuracy: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub replay_id: String,
    pub replay_name: String,
    pub created_at: i64,
    pub baseline_model: String,
    pub candidate_model: String,
    pub baseline_accuracy: f64,
    pub candidate_accuracy: f64,
    pub accuracy_delta: f64,
    pub cases: Vec<CaseResult>,
    pub drift_alerts: Vec<DriftAlert>,
}

/// A value normalized for cross-type comparison: trimmed/case-folded
/// strings, numbers compared by value, booleans as-is, everything else by
/// its canonical JSON text.
#[derive(PartialEq)]
enum Normalized {
    Str(String),
    Num(f64),
    Bool(bool),
    Json(String),
    Null,
}

fn normalize(value: &Value) -> Normalized {
    match value {
        Value::String(s) => Normalized::Str(s.trim().to_lowercase()),
        Value::Number(n) => Normalized::Num(n.as_f64().unwrap_or(f64::NAN)),
        Value::Bool(b) => Normalized::Bool(*b),
        Value::Null => Normalized::Null,
        other => Normalized::Json(serde_json::to_string(other).unwrap_or_default()),
    }
}

fn fields_match(expected: &Value, actual: Option<&Value>) -> bool {
    match actual {
        Some(actual) => normalize(actual) == normalize(expected),
        None => false,
    }
}

/// Replace any run of characters outside `[A-Za-z0-9._-]` with a single `_`.
fn safe_name(raw: &str) -> String {
    let mut out = String::new();
    let mut in_run = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

fn extract_fields(envelope: &JobEnvelope, expected: &HashMap<String, Value>) -> HashMap<String, Option<Value>> {
    expected
        .keys()
        .map(|key| {
            let value = envelope
                .result
                .parsed_json
                .as_ref()
                .and_then(|j| j.get(key))
                .cloned();
            (key.clone(), value)
        })
        .collect()
}

struct ReplayState {
    reports: HashMap<String, ReplayReport>,
    latest_by_name: HashMap<String, String>,
}

pub struct ReplayHarness {
    manager: Arc<AsyncQueueManager>,
    reports_dir: Option<PathBuf>,
    state: Mutex<ReplayState>,
}

impl ReplayHarness {
    pub fn new(manager: Arc<AsyncQueueManager>, reports_dir: Option<PathBuf>) -> Self {
        Self {
            manager,
            reports_dir,
            state: Mutex::new(ReplayState {
                reports: HashMap::new(),
                latest_by_name: HashMap::new(),
            }),
        }
    }

    fn build_case_payload(model: &str, case: &ReplayCase) -> Value {
        let mut payload = case.payload.clone();
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("model".to_owned(), Value::String(model.to_owned()));
        }
        payload
    }

    async fn run_one(&self, model: &str, case: &ReplayCase) -> Result<JobEnvelope, ClassifiedError> {
        let req = SubmitRequest {
            payload: Self::build_case_payload(model, case),
            priority: Some("batch".to_owned()),
            aggressive_enabled: false,
            fallback_reason: None,
            confidence_before: None,
            dom_anchor: None,
            screenshot_region: None,
            reasoning_note: None,
        };
        self.manager.run_inline(req, INLINE_RUN_TIMEOUT_MS).await
    }

    async fn score_case(&self, baseline_model: &str, candidate_model: &str, case: &ReplayCase) -> CaseResult {
        let baseline_outcome = self.run_one(baseline_model, case).await;
        let candidate_outcome = self.run_one(candidate_model, case).await;

        let total = case.expected.len();

        let (baseline_fields, baseline_error) = match &baseline_outcome {
            Ok(envelope) => (extract_fields(envelope, &case.expected), None),
            Err(err) => (HashMap::new(), Some(err.clone())),
        };
        let (candidate_fields, candidate_error) = match &candidate_outcome {
            Ok(envelope) => (extract_fields(envelope, &case.expected), None),
            Err(err) => (HashMap::new(), Some(err.clone())),
        };

        let mut field_results = HashMap::new();
        let mut baseline_matched = 0usize;
        let mut candidate_matched = 0usize;
        for (key, expected_value) in case.expected.iter() {
            let baseline_value = baseline_fields.get(key).cloned().flatten();
            let candidate_value = candidate_fields.get(key).cloned().flatten();
            let baseline_match = fields_match(expected_value, baseline_value.as_ref());
            let candidate_match = fields_match(expected_value, candidate_value.as_ref());
            if baseline_match {
                baseline_matched += 1;
            }
            if candidate_match {
                candidate_matched += 1;
            }
            field_results.insert(
                key.clone(),
                FieldResult {
                    expected: expected_value.clone(),
                    baseline_value,
                    baseline_match,
                    candidate_value,
                    candidate_match,
                },
            );
        }

        let baseline_accuracy = if total == 0 {
            0.0
        } else {
            baseline_matched as f64 / total as f64
        };
        let candidate_accuracy = if total == 0 {
            0.0
        } else {
            candidate_matched as f64 / total as f64
        };

        CaseResult {
            id: case.id.clone(),
            baseline_accuracy,
            candidate_accuracy,
            field_results,
            baseline_error,
            candidate_error,
        }
    }

    pub async fn run(&self, req: ReplayRequest) -> Result<ReplayReport, ClassifiedError> {
        let baseline_model = req
            .baseline_model
            .ok_or_else(|| invalid_request("baselineModel is required"))?;
        let candidate_model = req
            .candidate_model
            .ok_or_else(|| invalid_request("candidateModel is required"))?;
        let cases = req
            .cases
            .filter(|c| !c.is_empty())
            .ok_or_else(|| invalid_request("cases must be a non-empty array"))?;
        let replay_name = req.replay_name.unwrap_or_else(|| "default".to_owned());

        let mut case_results = Vec::with_capacity(cases.len());
        for case in &cases {
            case_results.push(self.score_case(&baseline_model, &candidate_model, case).await);
        }

        let n = case_results.len() as f64;
        let baseline_accuracy = case_results.iter().map(|c| c.baseline_accuracy).sum::<f64>() / n;
        let candidate_accuracy = case_results.iter().map(|c| c.candidate_accuracy).sum::<f64>() / n;
        let accuracy_delta = candidate_accuracy - baseline_accuracy;

        let replay_id = format!("replay-{}", now_ms());
        let previous = self.previous_report(&replay_name).await;
        let mut drift_alerts = Vec::new();
        if let Some(previous) = previous {
            if previous.candidate_accuracy.is_finite() {
                let delta = candidate_accuracy - previous.candidate_accuracy;
                if delta <= DRIFT_THRESHOLD {
                    drift_alerts.push(DriftAlert {
                        alert_type: "accuracy_drop".to_owned(),
                        level: "warn".to_owned(),
                        message: format!(
                            "candidate accuracy for '{replay_name}' dropped from {:.3} to {:.3}",
                            previous.candidate_accuracy, candidate_accuracy
                        ),
                        previous_accuracy: previous.candidate_accuracy,
                        candidate_accuracy,
                        delta,
                    });
                }
            }
        }

        let report = ReplayReport {
            replay_id: replay_id.clone(),
            replay_name: replay_name.clone(),
            created_at: now_ms(),
            baseline_model,
            candidate_model,
            baseline_accuracy,
            candidate_accuracy,
            accuracy_delta,
            cases: case_results,
            drift_alerts,
        };

        self.store(&report).await;
        Ok(report)
    }

    async fn previous_report(&self, replay_name: &str) -> Option<ReplayReport> {
        {
            let state = self.state.lock().await;
            if let Some(id) = state.latest_by_name.get(replay_name) {
                if let Some(report) = state.reports.get(id) {
                    return Some(report.clone());
                }
            }
        }
        self.read_latest_from_disk(replay_name).await
    }

    async fn read_latest_from_disk(&self, replay_name: &str) -> Option<ReplayReport> {
        let dir = self.reports_dir.as_ref()?;
        let path = dir.join(format!("latest-{}.json", safe_name(replay_name)));
        let bytes = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice::<ReplayReport>(&bytes) {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(path = %path.display(), %err, "ignoring malformed prior replay report");
                None
            }
        }
    }

    async fn store(&self, report: &ReplayReport) {
        {
            let mut state = self.state.lock().await;
            state
                .latest_by_name
                .insert(report.replay_name.clone(), report.replay_id.clone());
            state.reports.insert(report.replay_id.clone(), report.clone());
        }

        let Some(dir) = self.reports_dir.clone() else {
            return;
        };
        if let Err(err) = tokio::fs::create_dir_all(&dir).await {
            warn!(%err, "failed to create replay reports directory");
            return;
        }
        let bytes = match serde_json::to_vec_pretty(report) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "failed to serialize replay report");
                return;
            }
        };
        let by_id = dir.join(format!("{}.json", report.replay_id));
        let latest = dir.join(format!("latest-{}.json", safe_name(&report.replay_name)));
        if let Err(err) = tokio::fs::write(&by_id, &bytes).await {
            warn!(%err, path = %by_id.display(), "failed to persist replay report");
        }
        if let Err(err) = tokio::fs::write(&latest, &bytes).await {
            warn!(%err, path = %latest.display(), "failed to persist latest replay report");
        }
    }

    pub async fn get_report(&self, replay_id: &str) -> Option<ReplayReport> {
        {
            let state = self.state.lock().await;
            if let Some(report) = state.reports.get(replay_id) {
                return Some(report.clone());
            }
        }
        let dir = self.reports_dir.as_ref()?;
        let path = dir.join(format!("{replay_id}.json"));
        let bytes = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub async fn drift_alerts(&self) -> Vec<DriftAlert> {
        let state = self.state.lock().await;
        state
            .latest_by_name
            .values()
            .filter_map(|id| state.reports.get(id))
            .flat_map(|report| report.drift_alerts.iter().cloned())
            .collect()
    }
}
