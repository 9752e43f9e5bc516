//! Wraps the core's `ApiError` in an `axum::response::IntoResponse` impl —
//! the core stays decoupled from the HTTP framework, this crate owns the
//! translation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sidecar_core::error::ApiError;

pub struct ApiErrorResponse(pub ApiError);

impl IntoResponse for ApiErrorResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0)).into_response()
    }
}

impl From<ApiError> for ApiErrorResponse {
    fn from(value: ApiError) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_include;
    use sidecar_core::error::{build_api_error, classify_upstream_error, UpstreamErrorInfo};

    #[test]
    fn rate_limited_body_matches_the_stable_wire_shape() {
        let classified = classify_upstream_error(&UpstreamErrorInfo {
            status: Some(429),
            code: None,
            message: "slow down".to_owned(),
            is_timeout: false,
        });
        let api_error = build_api_error(&classified, None);

        assert_json_include!(
            actual: serde_json::to_value(&api_error).unwrap(),
            expected: serde_json::json!({
                "error": {
                    "code": "UPSTREAM_RATE_LIMITED",
                    "retryable": true,
                }
            })
        );
    }
}
