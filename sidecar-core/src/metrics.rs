//! Metrics store: running counters, latency reservoirs, and the
//! aggressive-mode win-rate accounting.
//!
//! All recording operations are meant to be called from the single queue
//! manager writer; readers take a snapshot under the same lock. One struct
//! owns the numbers: bounded reservoirs that also report
//! `p50`/`p95`/`mean` summaries.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;

/// Hard floor on the reservoir cap regardless of what a caller configures.
/// the cap constructor must enforce this regardless of caller input.
const SAMPLE_CAP_FLOOR: usize = 50;
const DEFAULT_SAMPLE_CAP: usize = 500;

#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct LatencySummary {
    pub count: usize,
    pub p50: f64,
    pub p95: f64,
    pub mean: f64,
}

#[derive(Debug, Default)]
struct Reservoir {
    samples: VecDeque<f64>,
    cap: usize,
}

impl Reservoir {
    fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            cap: cap.max(SAMPLE_CAP_FLOOR),
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() >= self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn summary(&self) -> LatencySummary {
        let n = self.samples.len();
        if n == 0 {
            return LatencySummary::default();
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let rank = |p: f64| -> f64 {
            let idx = (((n - 1) as f64) * p).floor() as usize;
            sorted[idx.min(n - 1)]
        };
        let mean = sorted.iter().sum::<f64>() / n as f64;
        LatencySummary {
            count: n,
            p50: rank(0.5),
            p95: rank(0.95),
            mean: (mean * 1000.0).round() / 1000.0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct FallbackCounters {
    triggered: u64,
    improved: u64,
}

impl FallbackCounters {
    fn win_rate(&self) -> f64 {
        if self.triggered == 0 {
            0.0
        } else {
            self.improved as f64 / self.triggered as f64
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    queue_wait: Reservoir,
    model_time: Reservoir,
    total: Reservoir,
    completed: u64,
    failed: u64,
    per_model_success: HashMap<String, u64>,
    per_model_failure: HashMap<String, u64>,
    per_error_kind: HashMap<String, u64>,
    per_fallback_reason: HashMap<String, FallbackCounters>,
}

/// Snapshot of everything recorded so far, serialized verbatim as the
/// `metrics` field of `GET /async/metrics`.
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub queue_wait_ms: LatencySummary,
    pub model_ms: LatencySummary,
    pub total_ms: LatencySummary,
    pub completed: u64,
    pub failed: u64,
    pub error_rate: f64,
    pub per_model_success: HashMap<String, u64>,
    pub per_model_failure: HashMap<String, u64>,
    pub per_error_kind: HashMap<String, u64>,
}

#[derive(Debug, Serialize)]
pub struct AggressiveReport {
    pub triggered: u64,
    pub improved: u64,
    pub win_rate: f64,
    pub by_fallback_reason: HashMap<String, AggressiveReasonReport>,
}

#[derive(Debug, Serialize)]
pub struct AggressiveReasonReport {
    pub triggered: u64,
    pub improved: u64,
    pub win_rate: f64,
}

pub struct MetricsStore {
    inner: Mutex<Inner>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::with_sample_cap(DEFAULT_SAMPLE_CAP)
    }

    pub fn with_sample_cap(cap: usize) -> Self {
        let cap = cap.max(SAMPLE_CAP_FLOOR);
        Self {
            inner: Mutex::new(Inner {
                queue_wait: Reservoir::new(cap),
                model_time: Reservoir::new(cap),
                total: Reservoir::new(cap),
                ..Default::default()
            }),
        }
    }

    pub fn record_submitted(&self, aggressive_enabled: bool, fallback_reason: Option<&str>) {
        if aggressive_enabled {
            let mut inner = self.inner.lock().unwrap();
            let key = fallback_reason.unwrap_or("unspecified").to_owned();
            inner.per_fallback_reason.entry(key).or_default().triggered += 1;
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_completed(
        &self,
        model: &str,
        queue_wait_ms: f64,
        model_ms: f64,
        total_ms: f64,
        aggressive_enabled: bool,
        fallback_reason: Option<&str>,
        confidence_delta: Option<f64>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue_wait.push(queue_wait_ms);
        inner.model_time.push(model_ms);
        inner.total.push(total_ms);
        inner.completed += 1;
        *inner
            .per_model_success
            .entry(model.to_owned())
            .or_insert(0) += 1;

        if aggressive_enabled && confidence_delta.is_some_and(|d| d > 0.0) {
            let key = fallback_reason.unwrap_or("unspecified").to_owned();
            inner.per_fallback_reason.entry(key).or_default().improved += 1;
        }
    }

    pub fn record_failed(&self, model: &str, error_kind: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.failed += 1;
        *inner
            .per_model_failure
            .entry(model.to_owned())
            .or_insert(0) += 1;
        *inner
            .per_error_kind
            .entry(error_kind.to_owned())
            .or_insert(0) += 1;
    }

    pub fn error_rate(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        error_rate(inner.completed, inner.failed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap();
        MetricsSnapshot {
            queue_wait_ms: inner.queue_wait.summary(),
            model_ms: inner.model_time.summary(),
            total_ms: inner.total.summary(),
            completed: inner.completed,
            failed: inner.failed,
            error_rate: error_rate(inner.completed, inner.failed),
            per_model_success: inner.per_model_success.clone(),
            per_model_failure: inner.per_model_failure.clone(),
            per_error_kind: inner.per_error_kind.clone(),
        }
    }

    pub fn aggressive_report(&self) -> AggressiveReport {
        let inner = self.inner.lock().unwrap();
        let mut triggered = 0u64;
        let mut improved = 0u64;
        let mut by_fallback_reason = HashMap::new();
        for (reason, counters) in inner.per_fallback_reason.iter() {
            triggered += counters.triggered;
            improved += counters.improved;
            by_fallback_reason.insert(
                reason.clone(),
                AggressiveReasonReport {
                    triggered: counters.triggered,
                    improved: counters.improved,
                    win_rate: counters.win_rate(),
                },
            );
        }
        let win_rate = if triggered == 0 {
            0.0
        } else {
            improved as f64 / triggered as f64
        };
        AggressiveReport {
            triggered,
            improved,
            win_rate,
            by_fallback_reason,
        }
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

fn error_rate(completed: u64, failed: u64) -> f64 {
    let finished = completed + failed;
    if finished == 0 {
        0.0
    } else {
        failed as f64 / finished as f64
    }
}
