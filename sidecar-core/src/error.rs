//! Error taxonomy and the upstream error classifier: a small,
//! serializable enum plus a `From`-style conversion from whatever the
//! upstream transport throws.

use serde::Serialize;

/// Stable error codes surfaced to clients. Renders as `SCREAMING_SNAKE_CASE`
/// on the wire, e.g. `ErrorCode::UpstreamTimeout` -> `"UPSTREAM_TIMEOUT"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    JobNotFound,
    JobCancelled,
    QueueBackpressure,
    /// Reserved: never emitted today (see Open Question in DESIGN.md).
    QueueCooldownActive,
    UpstreamTimeout,
    UpstreamLoginRequired,
    UpstreamRateLimited,
    UpstreamChallenge,
    UpstreamUnavailable,
    UpstreamBadResponse,
    InternalError,
}

/// The classifier's public output: what the envelope builder and the HTTP
/// surface both consume.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClassifiedError {
    pub code: ErrorCode,
    pub message: String,
    pub status: u16,
    pub retryable: bool,
}

impl ClassifiedError {
    fn new(code: ErrorCode, message: impl Into<String>, status: u16, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            retryable,
        }
    }
}

/// Whatever the upstream chat client can throw: an HTTP status if the
/// failure came back as a response, an optional machine code, and a
/// human message. This is deliberately loose — the classifier only reads
/// these three fields.
#[derive(Debug, Clone, Default)]
pub struct UpstreamErrorInfo {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
    /// Set when the error originated from a client-side timeout rather
    /// than a response (connect/read timeout, no status available).
    pub is_timeout: bool,
}

const CHALLENGE_MARKERS: [&str; 3] = ["just a moment", "challenge", "verify you are human"];

/// Classify an upstream failure into a stable error kind, in the fixed
/// fixed rule order below. First match wins.
pub fn classify_upstream_error(err: &UpstreamErrorInfo) -> ClassifiedError {
    let lower_message = err.message.to_lowercase();

    if err.is_timeout || lower_message.contains("timeout") {
        return ClassifiedError::new(ErrorCode::UpstreamTimeout, err.message.clone(), 504, true);
    }

    let is_login_required = err.status == Some(401)
        || err
            .code
            .as_deref()
            .is_some_and(|c| c == "LOGIN_REQUIRED");
    if is_login_required {
        return ClassifiedError::new(
            ErrorCode::UpstreamLoginRequired,
            err.message.clone(),
            401,
            false,
        );
    }

    let is_rate_limited = err.status == Some(429) || lower_message.contains("rate limit");
    if is_rate_limited {
        return ClassifiedError::new(
            ErrorCode::UpstreamRateLimited,
            err.message.clone(),
            429,
            true,
        );
    }

    if CHALLENGE_MARKERS.iter().any(|m| lower_message.contains(m)) {
        return ClassifiedError::new(
            ErrorCode::UpstreamChallenge,
            err.message.clone(),
            503,
            true,
        );
    }

    if let Some(status) = err.status {
        if (500..=599).contains(&status) {
            return ClassifiedError::new(
                ErrorCode::UpstreamUnavailable,
                err.message.clone(),
                503,
                true,
            );
        }
        if (400..=499).contains(&status) {
            return ClassifiedError::new(
                ErrorCode::UpstreamBadResponse,
                err.message.clone(),
                424,
                false,
            );
        }
    }

    ClassifiedError::new(ErrorCode::InternalError, err.message.clone(), 500, false)
}

/// Admission-level errors raised by the queue manager, never by the
/// classifier itself.
pub fn invalid_request(message: impl Into<String>) -> ClassifiedError {
    ClassifiedError::new(ErrorCode::InvalidRequest, message, 400, false)
}

pub fn job_not_found(job_id: &str) -> ClassifiedError {
    ClassifiedError::new(
        ErrorCode::JobNotFound,
        format!("job {job_id} not found"),
        404,
        false,
    )
}

pub fn job_cancelled() -> ClassifiedError {
    ClassifiedError::new(ErrorCode::JobCancelled, "job was cancelled", 409, false)
}

pub fn internal_error(message: impl Into<String>) -> ClassifiedError {
    ClassifiedError::new(ErrorCode::InternalError, message, 500, false)
}

pub fn queue_backpressure() -> ClassifiedError {
    ClassifiedError::new(
        ErrorCode::QueueBackpressure,
        "queue is at max depth",
        429,
        true,
    )
}

/// `{status, error:{code,message,retryable,details}}` — the stable shape
/// the HTTP surface serializes for every non-2xx response.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: u16,
    pub error: ApiErrorBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiErrorBody {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

pub fn build_api_error(classified: &ClassifiedError, details: Option<serde_json::Value>) -> ApiError {
    ApiError {
        status: classified.status,
        error: ApiErrorBody {
            code: classified.code,
            message: classified.message.clone(),
            retryable: classified.retryable,
            details,
        },
    }
}
