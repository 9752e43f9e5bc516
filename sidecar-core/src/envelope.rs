//! Envelope builder: turns a finished job into the fixed-shape
//! `JobEnvelope`, plus the `ReviewPayload` projection derived from it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClassifiedError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Interactive,
    Retry,
    Batch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggressiveRequest {
    pub enabled: bool,
    pub fallback_reason: Option<String>,
}

/// Everything the envelope builder needs about the originating request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMeta {
    pub model: String,
    pub priority: Priority,
    pub aggressive: AggressiveRequest,
    pub confidence_before: Option<f64>,
    pub dom_anchor: Option<String>,
    pub screenshot_region: Option<String>,
    /// Explicit caller-supplied reasoning note; falls back to
    /// `aggressive.fallback_reason` when absent in the synthesized
    /// evidence placeholder.
    pub reasoning_note: Option<String>,
}

/// What the upstream call produced, if it succeeded.
#[derive(Debug, Clone, Default)]
pub struct UpstreamSuccess {
    pub assistant_text: Option<String>,
    pub parsed_json: Option<Value>,
    pub render_mode: Option<String>,
    pub rendered_html: Option<String>,
    pub raw_response: Option<Value>,
    pub model_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Timings {
    pub queued_at: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

pub struct EnvelopeInput<'a> {
    pub job_id: &'a str,
    pub status: &'a str,
    pub request_meta: &'a RequestMeta,
    pub success: Option<&'a UpstreamSuccess>,
    pub error: Option<&'a ClassifiedError>,
    pub timings: Timings,
    pub attempts: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Latency {
    pub queue_wait_ms: Option<i64>,
    pub model_ms: Option<i64>,
    pub total_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggressiveDiagnostics {
    pub enabled: bool,
    pub fallback_reason: Option<String>,
    pub confidence_before: Option<f64>,
    pub confidence_after: Option<f64>,
    pub confidence_delta: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub attempts: i32,
    pub model_path: Option<String>,
    pub latency: Latency,
    pub aggressive: AggressiveDiagnostics,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceEntry {
    pub snippet_id: Option<String>,
    pub quote: Option<String>,
    pub dom_anchor: Option<String>,
    pub screenshot_region: Option<String>,
    pub model_path: Option<String>,
    pub reasoning_note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultBlock {
    pub assistant_text: Option<String>,
    pub parsed_json: Option<Value>,
    pub render_mode: Option<String>,
    pub rendered_html: Option<String>,
    pub raw_response: Option<Value>,
    pub evidence: Vec<EvidenceEntry>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestEcho {
    pub model: String,
    pub priority: Priority,
    pub aggressive: AggressiveRequest,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeTimings {
    pub queued_at: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobEnvelope {
    pub job_id: String,
    pub status: String,
    pub request: RequestEcho,
    pub result: ResultBlock,
    pub error: Option<ClassifiedError>,
    pub timings: EnvelopeTimings,
}

/// Pull a finite `f64` out of a JSON value, treating non-numbers and
/// non-finite numbers (NaN/infinite, which never round-trip through JSON
/// anyway) the same as absent.
fn finite_number(value: Option<&Value>) -> Option<f64> {
    value
        .and_then(Value::as_f64)
        .filter(|n| n.is_finite())
}

fn derive_confidence_after(parsed_json: Option<&Value>, assistant_text: Option<&str>) -> Option<f64> {
    if let Some(v) = finite_number(parsed_json.and_then(|j| j.get("confidence"))) {
        return Some(v);
    }
    if let Some(v) = finite_number(
        parsed_json
            .and_then(|j| j.get("meta"))
            .and_then(|m| m.get("confidence")),
    ) {
        return Some(v);
    }
    if assistant_text.is_some_and(|t| !t.is_empty()) {
        return Some(0.7);
    }
    None
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

fn truncate_snippet(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_owned()
    } else {
        text.chars().take(max).collect()
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn build_evidence(
    parsed_json: Option<&Value>,
    assistant_text: Option<&str>,
    request_meta: &RequestMeta,
) -> Vec<EvidenceEntry> {
    if let Some(entries) = parsed_json
        .and_then(|j| j.get("evidence"))
        .and_then(Value::as_array)
        .filter(|a| !a.is_empty())
    {
        return entries
            .iter()
            .map(|entry| EvidenceEntry {
                snippet_id: str_field(entry, "snippet_id"),
                quote: str_field(entry, "quote"),
                dom_anchor: str_field(entry, "dom_anchor"),
                screenshot_region: str_field(entry, "screenshot_region"),
                model_path: str_field(entry, "model_path"),
                reasoning_note: str_field(entry, "reasoning_note"),
            })
            .collect();
    }

    vec![EvidenceEntry {
        snippet_id: None,
        quote: assistant_text.map(|t| truncate_snippet(t, 240)),
        dom_anchor: request_meta.dom_anchor.clone(),
        screenshot_region: request_meta.screenshot_region.clone(),
        model_path: None,
        reasoning_note: request_meta
            .reasoning_note
            .clone()
            .or_else(|| request_meta.aggressive.fallback_reason.clone()),
    }]
}

/// Build the fixed-shape envelope from a terminal job outcome.
pub fn build_envelope(input: EnvelopeInput<'_>) -> JobEnvelope {
    let success = input.success;
    let assistant_text = success.and_then(|s| s.assistant_text.as_deref());
    let parsed_json = success.and_then(|s| s.parsed_json.as_ref());

    let confidence_before = input.request_meta.confidence_before;
    let confidence_after = derive_confidence_after(parsed_json, assistant_text);
    let confidence_delta = match (confidence_after, confidence_before) {
        (Some(after), Some(before)) if after.is_finite() && before.is_finite() => {
            Some(round6(after - before))
        }
        _ => None,
    };

    let evidence = build_evidence(parsed_json, assistant_text, input.request_meta);

    let latency = Latency {
        queue_wait_ms: match (input.timings.started_at, input.timings.queued_at) {
            (Some(s), Some(q)) => Some(s - q),
            _ => None,
        },
        model_ms: match (input.timings.completed_at, input.timings.started_at) {
            (Some(c), Some(s)) => Some(c - s),
            _ => None,
        },
        total_ms: match (input.timings.completed_at, input.timings.queued_at) {
            (Some(c), Some(q)) => Some(c - q),
            _ => None,
        },
    };

    JobEnvelope {
        job_id: input.job_id.to_owned(),
        status: input.status.to_owned(),
        request: RequestEcho {
            model: input.request_meta.model.clone(),
            priority: input.request_meta.priority.clone(),
            aggressive: input.request_meta.aggressive.clone(),
        },
        result: ResultBlock {
            assistant_text: assistant_text.map(str::to_owned),
            parsed_json: parsed_json.cloned(),
            render_mode: success.and_then(|s| s.render_mode.clone()),
            rendered_html: success.and_then(|s| s.rendered_html.clone()),
            raw_response: success.and_then(|s| s.raw_response.clone()),
            evidence,
            diagnostics: Diagnostics {
                attempts: input.attempts,
                model_path: success.and_then(|s| s.model_path.clone()),
                latency,
                aggressive: AggressiveDiagnostics {
                    enabled: input.request_meta.aggressive.enabled,
                    fallback_reason: input.request_meta.aggressive.fallback_reason.clone(),
                    confidence_before,
                    confidence_after,
                    confidence_delta,
                },
            },
        },
        error: input.error.cloned(),
        timings: EnvelopeTimings {
            queued_at: input.timings.queued_at,
            started_at: input.timings.started_at,
            completed_at: input.timings.completed_at,
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewBefore {
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewAfter {
    pub confidence: Option<f64>,
    pub model_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceLink {
    pub snippet_id: Option<String>,
    pub dom_anchor: Option<String>,
    pub screenshot_region: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewPayload {
    pub job_id: String,
    pub status: String,
    pub before: ReviewBefore,
    pub after: ReviewAfter,
    pub evidence_links: Vec<EvidenceLink>,
    pub rationale: String,
    pub parsed_json: Option<Value>,
    pub assistant_text: Option<String>,
}

const DEFAULT_RATIONALE: &str = "No fallback reason provided.";

/// Derive the review projection from an already-built envelope.
pub fn build_review_payload(envelope: &JobEnvelope) -> ReviewPayload {
    let diagnostics = &envelope.result.diagnostics;
    ReviewPayload {
        job_id: envelope.job_id.clone(),
        status: envelope.status.clone(),
        before: ReviewBefore {
            confidence: diagnostics.aggressive.confidence_before,
        },
        after: ReviewAfter {
            confidence: diagnostics.aggressive.confidence_after,
            model_path: diagnostics.model_path.clone(),
        },
        evidence_links: envelope
            .result
            .evidence
            .iter()
            .map(|e| EvidenceLink {
                snippet_id: e.snippet_id.clone(),
                dom_anchor: e.dom_anchor.clone(),
                screenshot_region: e.screenshot_region.clone(),
            })
            .collect(),
        rationale: diagnostics
            .aggressive
            .fallback_reason
            .clone()
            .unwrap_or_else(|| DEFAULT_RATIONALE.to_owned()),
        parsed_json: envelope.result.parsed_json.clone(),
        assistant_text: envelope.result.assistant_text.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta() -> RequestMeta {
        RequestMeta {
            model: "gpt-5-high".to_owned(),
            priority: Priority::Batch,
            aggressive: AggressiveRequest {
                enabled: true,
                fallback_reason: Some("low_confidence".to_owned()),
            },
            confidence_before: Some(0.4),
            dom_anchor: Some("#price".to_owned()),
            screenshot_region: Some("0,0,100,100".to_owned()),
            reasoning_note: None,
        }
    }

    #[test]
    fn confidence_from_top_level_field() {
        let success = UpstreamSuccess {
            assistant_text: Some("hi".into()),
            parsed_json: Some(json!({"confidence": 0.9})),
            ..Default::default()
        };
        let envelope = build_envelope(EnvelopeInput {
            job_id: "job-1",
            status: "completed",
            request_meta: &meta(),
            success: Some(&success),
            error: None,
            timings: Timings {
                queued_at: Some(0),
                started_at: Some(10),
                completed_at: Some(30),
            },
            attempts: 1,
        });
        let diag = &envelope.result.diagnostics.aggressive;
        assert_eq!(diag.confidence_after, Some(0.9));
        assert_eq!(diag.confidence_delta, Some(0.5));
        assert_eq!(envelope.result.diagnostics.latency.queue_wait_ms, Some(10));
        assert_eq!(envelope.result.diagnostics.latency.model_ms, Some(20));
        assert_eq!(envelope.result.diagnostics.latency.total_ms, Some(30));
    }

    #[test]
    fn confidence_falls_back_to_meta_then_default() {
        let meta_conf = UpstreamSuccess {
            assistant_text: Some("hi".into()),
            parsed_json: Some(json!({"meta": {"confidence": 0.6}})),
            ..Default::default()
        };
        let envelope = build_envelope(EnvelopeInput {
            job_id: "j",
            status: "completed",
            request_meta: &meta(),
            success: Some(&meta_conf),
            error: None,
            timings: Timings::default(),
            attempts: 1,
        });
        assert_eq!(
            envelope.result.diagnostics.aggressive.confidence_after,
            Some(0.6)
        );

        let no_json = UpstreamSuccess {
            assistant_text: Some("hi".into()),
            parsed_json: None,
            ..Default::default()
        };
        let envelope = build_envelope(EnvelopeInput {
            job_id: "j",
            status: "completed",
            request_meta: &meta(),
            success: Some(&no_json),
            error: None,
            timings: Timings::default(),
            attempts: 1,
        });
        assert_eq!(
            envelope.result.diagnostics.aggressive.confidence_after,
            Some(0.7)
        );

        let nothing = UpstreamSuccess::default();
        let envelope = build_envelope(EnvelopeInput {
            job_id: "j",
            status: "completed",
            request_meta: &meta(),
            success: Some(&nothing),
            error: None,
            timings: Timings::default(),
            attempts: 1,
        });
        assert_eq!(envelope.result.diagnostics.aggressive.confidence_after, None);
        assert_eq!(envelope.result.diagnostics.aggressive.confidence_delta, None);
    }

    #[test]
    fn evidence_normalized_from_parsed_json() {
        let success = UpstreamSuccess {
            parsed_json: Some(json!({"evidence": [{"quote": "a quote", "dom_anchor": "#x"}]})),
            ..Default::default()
        };
        let envelope = build_envelope(EnvelopeInput {
            job_id: "j",
            status: "completed",
            request_meta: &meta(),
            success: Some(&success),
            error: None,
            timings: Timings::default(),
            attempts: 1,
        });
        assert_eq!(envelope.result.evidence.len(), 1);
        assert_eq!(envelope.result.evidence[0].quote.as_deref(), Some("a quote"));
    }

    #[test]
    fn evidence_synthesized_placeholder() {
        let long_text = "x".repeat(300);
        let success = UpstreamSuccess {
            assistant_text: Some(long_text.clone()),
            ..Default::default()
        };
        let envelope = build_envelope(EnvelopeInput {
            job_id: "j",
            status: "completed",
            request_meta: &meta(),
            success: Some(&success),
            error: None,
            timings: Timings::default(),
            attempts: 1,
        });
        assert_eq!(envelope.result.evidence.len(), 1);
        let quote = envelope.result.evidence[0].quote.as_ref().unwrap();
        assert_eq!(quote.chars().count(), 240);
        assert_eq!(
            envelope.result.evidence[0].reasoning_note.as_deref(),
            Some("low_confidence")
        );
    }

    #[test]
    fn review_payload_default_rationale() {
        let mut m = meta();
        m.aggressive.fallback_reason = None;
        let success = UpstreamSuccess {
            assistant_text: Some("hi".into()),
            ..Default::default()
        };
        let envelope = build_envelope(EnvelopeInput {
            job_id: "j",
            status: "completed",
            request_meta: &m,
            success: Some(&success),
            error: None,
            timings: Timings::default(),
            attempts: 1,
        });
        let review = build_review_payload(&envelope);
        assert_eq!(review.rationale, DEFAULT_RATIONALE);
    }

    #[test]
    fn envelope_matches_fixed_shape() {
        use assert_json_diff::assert_json_include;

        let success = UpstreamSuccess {
            assistant_text: Some("hi".into()),
            parsed_json: Some(json!({"confidence": 0.9})),
            ..Default::default()
        };
        let envelope = build_envelope(EnvelopeInput {
            job_id: "job-1",
            status: "completed",
            request_meta: &meta(),
            success: Some(&success),
            error: None,
            timings: Timings {
                queued_at: Some(0),
                started_at: Some(10),
                completed_at: Some(30),
            },
            attempts: 1,
        });

        assert_json_include!(
            actual: serde_json::to_value(&envelope).unwrap(),
            expected: json!({
                "job_id": "job-1",
                "status": "completed",
                "request": {
                    "model": "gpt-5-high",
                    "priority": "batch",
                    "aggressive": {"enabled": true, "fallback_reason": "low_confidence"},
                },
                "result": {
                    "assistant_text": "hi",
                    "parsed_json": {"confidence": 0.9},
                },
                "error": null,
                "timings": {"queued_at": 0, "started_at": 10, "completed_at": 30},
            })
        );
    }
}
